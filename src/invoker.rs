//! The tail of the client pipeline: one request over one connection.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{ConnectionError, RemoteError, RpcError};
use crate::message::{Message, Request, Value};
use crate::serializer::Serializer;
use crate::util::TimeUsed;

/// Performs encode, write, read and decode for one invocation.
#[async_trait]
pub trait Invoker: Send + Sync {
    /// Run `request` over `connection` and return the remote value.
    ///
    /// # Errors
    /// Surfaces serializer, connection and remote failures; a wire-level
    /// error response is re-raised as [`RpcError::Remote`].
    async fn invoke(
        &self,
        request: &Request,
        connection: &dyn Connection,
        serializer: &dyn Serializer,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Value, RpcError>;
}

/// The standard invoker.
#[derive(Debug, Default, Clone, Copy)]
pub struct RpcInvoker;

impl RpcInvoker {
    /// Create an invoker.
    #[must_use]
    pub const fn new() -> Self { Self }
}

#[async_trait]
impl Invoker for RpcInvoker {
    async fn invoke(
        &self,
        request: &Request,
        connection: &dyn Connection,
        serializer: &dyn Serializer,
        write_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Value, RpcError> {
        let body = serializer.encode(&Message::Request(request.clone()))?;

        let transaction_id = {
            let _watch = TimeUsed::watch("connection write", Duration::from_millis(10));
            let (transaction_id, write_ticket) =
                connection.write(body, Some(write_timeout)).await?;
            match write_ticket.wait(Some(write_timeout)).await {
                Ok(_) => transaction_id,
                Err(err @ ConnectionError::WriteTimeout) => {
                    // A timed-out exchange could otherwise pair a late
                    // response with a recycled transaction id.
                    connection.close();
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            }
        };
        debug!(transaction_id, "request written");

        let read_ticket = connection.read(transaction_id).await?;
        let response_body = match read_ticket.wait(Some(read_timeout)).await {
            Ok(body) => body,
            Err(err @ ConnectionError::ReadTimeout) => {
                connection.close();
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        let Message::Response(response) = serializer.decode(&response_body)? else {
            return Err(RemoteError::InvalidResponse("expected a response body".into()).into());
        };
        if let Some(wire_error) = response.error {
            return Err(RpcError::Remote(wire_error.to_remote()));
        }
        Ok(response.value.unwrap_or(Value::Null))
    }
}
