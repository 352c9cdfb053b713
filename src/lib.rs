//! Protocol engine for [varlink](https://varlink.org): NUL-delimited JSON
//! framing, the request/response wire codec, a pooling client with the
//! three call modes (`call`, `oneway`, `more`) and a server dispatch loop
//! over a registry of async handlers.
//!
//! Interface description files, introspection and code generation are out
//! of scope; methods are addressed by their fully qualified dotted names
//! and parameters travel as JSON objects, optionally bridged to typed
//! structs through [`Method`] descriptors.
//!
//! ```no_run
//! use std::sync::Arc;
//! use varlink_proto::{Client, Connector, ListenConfig, Listener, Server};
//! use varlink_proto::wire::Parameters;
//!
//! # async fn run() -> varlink_proto::Result<()> {
//! let mut server = Server::new();
//! server.register_call("org.example.Ping", |parameters| async move {
//!     Ok(parameters)
//! });
//!
//! let listener = Listener::bind("tcp:127.0.0.1:0").await?;
//! let address = listener.local_address()?;
//! tokio::spawn(Arc::new(server).serve(listener, ListenConfig::default()));
//!
//! let client = Client::new(Connector::new(address));
//! let pong = client.call("org.example.Ping", Parameters::new()).await?;
//! # let _ = pong;
//! # Ok(())
//! # }
//! ```

use std::marker::PhantomData;

pub mod chan;
pub mod client;
pub mod error;
pub mod framer;
pub mod server;
pub mod transport;
pub mod wire;

pub use crate::chan::{ClientChannel, ServerChannel};
pub use crate::client::{Client, MoreCall, StreamReply};
pub use crate::error::{
    Error, Result, ServiceError, ERROR_INVALID_PARAMETER, ERROR_METHOD_NOT_FOUND,
};
pub use crate::framer::Framer;
pub use crate::server::{HandlerKind, ListenConfig, ReplySink, Server};
pub use crate::transport::{Connect, Connector, Listener, Stream};
pub use crate::wire::{Parameters, Request, Response};

/// A typed method descriptor: the fully qualified method name bound to its
/// input and output parameter types.
///
/// Descriptors are plain constants shared between a service and its
/// clients:
///
/// ```
/// use varlink_proto::Method;
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct PingArgs { ping: String }
/// # #[derive(serde::Serialize, serde::Deserialize)]
/// # struct PingReply { pong: String }
///
/// const PING: Method<PingArgs, PingReply> = Method::new("org.example.Ping");
/// ```
pub struct Method<I, O> {
    name: &'static str,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O> Method<I, O> {
    pub const fn new(name: &'static str) -> Self {
        Method {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}
