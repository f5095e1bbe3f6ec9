//! RPC framework exposing in-process services as named methods over TCP.
//!
//! A server registers `(service, method)` invocables in an [`exporter`]
//! table, serves them through the [`server`] runtime with pluggable
//! [`transport`] framing and [`serializer`] encoding, and publishes them to
//! a [`registry`]. A client resolves providers through the registry, picks
//! one through a [`cluster`] strategy, borrows a pooled multiplexed
//! [`connection`] and runs the [`protocol`] pipeline down to the invoker.
//! Request/response pairing on the wire uses a 32-bit transaction id.

pub mod client;
pub mod cluster;
pub mod connection;
pub mod error;
pub mod exporter;
pub mod heartbeat;
pub mod invoker;
pub mod limiter;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod serializer;
pub mod server;
pub mod transport;
pub mod util;

pub use client::{ClientSettings, RpcClient};
pub use error::RpcError;
pub use message::{Request, Response, Value};
pub use server::{RpcServer, RpcServerBuilder};
