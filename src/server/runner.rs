//! Per-connection request loop.
//!
//! One runner per accepted connection: it reads requests under a bounded
//! concurrency permit, dispatches them by policy and hands encoded responses
//! to an outbound writer task. Workers complete in arbitrary order, so
//! responses may leave out of order; the transaction id pairs them up again
//! on the client. Every read and write touches the connection record so the
//! idle reaper sees activity.

use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::{Semaphore, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error};

use super::ConnRecord;
use crate::error::RemoteError;
use crate::exporter::{CallArgs, DispatchPolicy, Exporter, Invocable};
use crate::message::{Message, Request, Response, Value};
use crate::serializer::Serializer;
use crate::server::worker::WorkerPool;
use crate::transport::{Frame, Transport};

const OUTBOUND_QUEUE: usize = 64;

pub(crate) struct RunnerContext {
    pub transport: Arc<dyn Transport>,
    pub serializer: Arc<dyn Serializer>,
    pub exporter: Arc<Exporter>,
    pub worker_pool: Option<Arc<WorkerPool>>,
    pub isolated_pool: Option<Arc<WorkerPool>>,
    pub record: Arc<ConnRecord>,
    pub concurrent_requests: usize,
    pub close_signal: watch::Receiver<bool>,
}

pub(crate) async fn run(ctx: RunnerContext, socket: TcpStream) {
    let (read_half, write_half) = socket.into_split();
    let mut source = FramedRead::new(read_half, ctx.transport.server_codec());
    let mut sink = FramedWrite::new(write_half, ctx.transport.server_codec());

    let (outbound, mut outbound_rx) = mpsc::channel::<Frame>(OUTBOUND_QUEUE);
    let write_record = Arc::clone(&ctx.record);
    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            write_record.touch();
            if let Err(err) = sink.send(frame).await {
                // Stream problems end the writer but not the dispatched
                // work; remaining responses are dropped with it.
                error!(error = %err, "failed to write response");
                break;
            }
            write_record.touch();
        }
        debug!("outbound writer exited");
    });

    let semaphore = Arc::new(Semaphore::new(ctx.concurrent_requests.max(1)));
    let mut close_signal = ctx.close_signal.clone();

    loop {
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = close_signal.changed() => break,
        };

        ctx.record.touch();
        let next = tokio::select! {
            frame = source.next() => frame,
            _ = close_signal.changed() => break,
        };
        ctx.record.touch();

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                error!(error = %err, "transport read failed");
                break;
            }
            None => {
                debug!("client disconnected");
                break;
            }
        };

        let request = match ctx.serializer.decode(&frame.body) {
            Ok(Message::Request(request)) => request,
            Ok(Message::Response(_)) => {
                error!("expected a request body");
                break;
            }
            Err(err) => {
                error!(error = %err, "failed to decode request");
                break;
            }
        };

        let outcome = dispatch(&ctx, &request);
        let serializer = Arc::clone(&ctx.serializer);
        let record = Arc::clone(&ctx.record);
        let outbound = outbound.clone();
        let transaction_id = frame.transaction_id;
        let meta = request.meta;
        tokio::spawn(async move {
            let response = match outcome.await {
                Ok(value) => Response::success(Some(value), meta),
                Err(err) => Response::failure(&err, meta),
            };
            match serializer.encode(&Message::Response(response)) {
                Ok(body) => {
                    if outbound
                        .send(Frame {
                            transaction_id,
                            body,
                        })
                        .await
                        .is_err()
                    {
                        debug!("connection went away before the response was sent");
                    }
                }
                Err(err) => error!(error = %err, "failed to encode response"),
            }
            record.touch();
            drop(permit);
        });
    }

    drop(outbound);
    let _ = writer.await;
    debug!("runner exited");
}

/// Pick the execution path for one request and return its future outcome.
fn dispatch(ctx: &RunnerContext, request: &Request) -> BoxFuture<'static, Result<Value, RemoteError>> {
    let Some(entry) = ctx.exporter.get(&request.service, &request.method) else {
        let message = format!(
            "the requested method ({}, {}) is not exported",
            request.service, request.method
        );
        error!(%message);
        return Box::pin(std::future::ready(Err(RemoteError::LookupMethod(message))));
    };

    let call = CallArgs {
        args: request.args.clone(),
        kwargs: request.kwargs.clone(),
    };

    match &entry.invocable {
        Invocable::Inline(handler) => {
            let outcome = handler(call);
            Box::pin(async move {
                outcome
                    .await
                    .map_err(|err| RemoteError::MethodExecution(err.to_string()))
            })
        }
        Invocable::Blocking(handler) => {
            let pool = if entry.policy == DispatchPolicy::Isolated {
                ctx.isolated_pool.as_ref().or(ctx.worker_pool.as_ref())
            } else {
                ctx.worker_pool.as_ref()
            };
            let Some(pool) = pool else {
                return Box::pin(std::future::ready(Err(RemoteError::Concurrency(
                    "no worker pool is configured".into(),
                ))));
            };
            let handler = Arc::clone(handler);
            match pool.submit(move || handler(call)) {
                Ok(outcome) => Box::pin(async move {
                    match outcome.await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(RemoteError::MethodExecution(err.to_string())),
                        Err(_) => {
                            Err(RemoteError::MethodExecution("worker dropped the job".into()))
                        }
                    }
                }),
                Err(err) => Box::pin(std::future::ready(Err(err))),
            }
        }
    }
}
