//! Error taxonomy for the framework.
//!
//! Each family mirrors one failure domain: framing, encoding, the remote
//! side, the client connection, the connection pool, the stub side, the
//! registry and the rate limiters. [`RpcError`] aggregates them for callers
//! that only care about "the invocation failed".

use thiserror::Error;

/// Failures in the framing layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The byte stream does not contain a well-formed message.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),
    /// The remote side closed the socket at a frame boundary.
    #[error("socket already closed")]
    SocketAlreadyClosed,
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures converting messages to or from bytes.
#[derive(Debug, Error)]
pub enum SerializerError {
    /// The value could not be represented in the wire format.
    #[error("serialization failed: {0}")]
    Serialization(String),
    /// The bytes do not decode to a well-formed message.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Failures reported by or about the remote server.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Discovery produced no provider for the requested method.
    #[error("no remote server provides the requested method")]
    NoRemoteServer,
    /// The server has no worker pool for a blocking method.
    #[error("concurrency error: {0}")]
    Concurrency(String),
    /// The requested service or method is not exported.
    #[error("lookup method error: {0}")]
    LookupMethod(String),
    /// Handing the call to the isolated worker pool failed.
    #[error("submit task error: {0}")]
    SubmitTask(String),
    /// The remote method raised; wraps its message.
    #[error("method execution error: {0}")]
    MethodExecution(String),
    /// The request is missing a required field.
    #[error("request validate error: {0}")]
    RequestValidate(String),
    /// The body paired to the transaction is not a response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Stable tag identifying the error kind on the wire.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NoRemoteServer => "no_remote_server_error",
            Self::Concurrency(_) => "concurrency_error",
            Self::LookupMethod(_) => "lookup_method_error",
            Self::SubmitTask(_) => "submit_task_error",
            Self::MethodExecution(_) => "method_execution_error",
            Self::RequestValidate(_) => "request_validate_error",
            Self::InvalidResponse(_) => "invalid_response_error",
        }
    }

    /// Rebuild a typed error from its wire `kind` and `message`.
    ///
    /// Unknown kinds collapse into [`RemoteError::MethodExecution`] so that
    /// newer servers stay understandable to older clients.
    #[must_use]
    pub fn from_wire(kind: &str, message: &str) -> Self {
        let message = message.to_owned();
        match kind {
            "no_remote_server_error" => Self::NoRemoteServer,
            "concurrency_error" => Self::Concurrency(message),
            "lookup_method_error" => Self::LookupMethod(message),
            "submit_task_error" => Self::SubmitTask(message),
            "request_validate_error" => Self::RequestValidate(message),
            "invalid_response_error" => Self::InvalidResponse(message),
            "method_execution_error" => Self::MethodExecution(message),
            other => Self::MethodExecution(format!("{other}: {message}")),
        }
    }
}

/// Failures on a client connection.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionError {
    /// The write did not complete before its deadline.
    #[error("connection write timeout")]
    WriteTimeout,
    /// The response did not arrive before the read deadline.
    #[error("connection read timeout")]
    ReadTimeout,
    /// The connection closed before or during the write.
    #[error("write abort")]
    WriteAbort,
    /// The connection closed before or during the read.
    #[error("read abort")]
    ReadAbort,
    /// The bounded write queue is full.
    #[error("max pending writes reached")]
    MaxPendingWrites,
    /// The bounded read map displaced this pending read.
    #[error("max pending reads reached")]
    MaxPendingReads,
    /// A response arrived for a different transaction than the one written.
    #[error("read and write transaction ids are inconsistent")]
    TransactionMismatch,
}

/// Failures in the connection pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// Non-blocking borrow found no free connection.
    #[error("no available connection")]
    NoAvailableConnection,
    /// The pool refused the operation because it is closed.
    #[error("connection pool already closed")]
    AlreadyClosed,
    /// The connection factory failed.
    #[error("create connection error: {0}")]
    CreateConnection(String),
}

/// Failures raised on the calling side before anything hits the wire.
#[derive(Debug, Error)]
pub enum StubError {
    /// The requested method is deliberately not exposed to callers.
    #[error("method is not exposed: {0}")]
    Filtered(String),
    /// The client is missing a required collaborator.
    #[error("client misconfigured: {0}")]
    Misconfigured(&'static str),
}

/// Failures publishing to or discovering from the coordination service.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The base path must start with `/`; only the root may end with `/`.
    #[error("invalid base path: {0}")]
    InvalidBasePath(String),
    /// Registration or discovery was already started on this registry.
    #[error("already started")]
    AlreadyStarted,
    /// The coordination backend reported a failure.
    #[error("coordination error: {0}")]
    Coordination(String),
}

/// Failures in the rate limiters.
#[derive(Debug, Error)]
pub enum LimiterError {
    /// The bucket store could not run the refill step.
    #[error("bucket store error: {0}")]
    Store(String),
}

/// Any failure an invocation can surface to the caller.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Framing failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Encoding failure.
    #[error(transparent)]
    Serializer(#[from] SerializerError),
    /// Failure reported by the remote side.
    #[error(transparent)]
    Remote(#[from] RemoteError),
    /// Client connection failure.
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    /// Connection pool failure.
    #[error(transparent)]
    Pool(#[from] PoolError),
    /// Stub-side failure.
    #[error(transparent)]
    Stub(#[from] StubError),
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Rate limiter failure.
    #[error(transparent)]
    Limiter(#[from] LimiterError),
}
