//! Server dispatch engine: method registry and per-connection request
//! loops.
//!
//! Handlers are registered before serving begins; the registry is
//! read-only once connections arrive. Each accepted connection runs an
//! independent loop: read a request, match its flags against the
//! registered handler kind, invoke the handler and write zero, one or many
//! responses.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::chan::ServerChannel;
use crate::error::ServiceError;
use crate::transport::Listener;
use crate::wire::{self, Parameters, Request, Response};
use crate::{Error, Method, Result};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type CallFn = Box<dyn Fn(Parameters) -> BoxFuture<Result<Parameters>> + Send + Sync>;
type OnewayFn = Box<dyn Fn(Parameters) -> BoxFuture<Result<()>> + Send + Sync>;
type MoreFn = Box<dyn Fn(Parameters, ReplySink) -> BoxFuture<Result<()>> + Send + Sync>;

/// The call shape a handler serves, also derived from request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    /// Exactly one reply.
    Call,
    /// No reply at all.
    Oneway,
    /// One or more replies, ended by `continues=false`.
    More,
}

impl HandlerKind {
    fn for_request(request: &Request) -> Self {
        if request.oneway {
            HandlerKind::Oneway
        } else if request.more {
            HandlerKind::More
        } else {
            HandlerKind::Call
        }
    }
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerKind::Call => f.write_str("call"),
            HandlerKind::Oneway => f.write_str("oneway"),
            HandlerKind::More => f.write_str("more"),
        }
    }
}

enum Handler {
    Call(CallFn),
    Oneway(OnewayFn),
    More(MoreFn),
}

impl Handler {
    fn kind(&self) -> HandlerKind {
        match self {
            Handler::Call(_) => HandlerKind::Call,
            Handler::Oneway(_) => HandlerKind::Oneway,
            Handler::More(_) => HandlerKind::More,
        }
    }
}

/// Emit handle passed to `more` handlers: every `emit` sends one success
/// reply, in order. The handler ends the stream by emitting with
/// `continues=false` or by returning.
pub struct ReplySink {
    tx: mpsc::Sender<(Parameters, bool)>,
}

impl ReplySink {
    pub async fn emit(&self, parameters: Parameters, continues: bool) -> Result<()> {
        self.tx
            .send((parameters, continues))
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// Accept-loop configuration.
pub struct ListenConfig {
    /// Give up and return [`Error::Timeout`] if no connection arrives
    /// within this window. Zero disables the idle timeout.
    pub idle_timeout: Duration,
    /// When set to true, the accept loop returns after at most 100ms.
    pub stop: Option<Arc<AtomicBool>>,
    /// Idle read timeout applied to every accepted connection.
    pub read_timeout: Option<Duration>,
}

impl Default for ListenConfig {
    fn default() -> Self {
        ListenConfig {
            idle_timeout: Duration::ZERO,
            stop: None,
            read_timeout: None,
        }
    }
}

/// A varlink service: a registry of method handlers plus the dispatch
/// loops that drive them.
#[derive(Default)]
pub struct Server {
    handlers: HashMap<String, Handler>,
}

impl Server {
    pub fn new() -> Self {
        Server::default()
    }

    /// Register a single-reply handler.
    pub fn register_call<F, Fut>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Parameters>> + Send + 'static,
    {
        self.handlers.insert(
            method.into(),
            Handler::Call(Box::new(move |parameters| Box::pin(f(parameters)))),
        );
    }

    /// Register a no-reply handler. Failures are logged, never sent: a
    /// oneway call has no channel to report errors on.
    pub fn register_oneway<F, Fut>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(Parameters) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(
            method.into(),
            Handler::Oneway(Box::new(move |parameters| Box::pin(f(parameters)))),
        );
    }

    /// Register a streaming handler. The handler emits replies through its
    /// [`ReplySink`] and ends the stream with `continues=false`.
    pub fn register_more<F, Fut>(&mut self, method: impl Into<String>, f: F)
    where
        F: Fn(Parameters, ReplySink) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.handlers.insert(
            method.into(),
            Handler::More(Box::new(move |parameters, sink| Box::pin(f(parameters, sink)))),
        );
    }

    /// Typed single-reply registration through a [`Method`] descriptor.
    /// A request whose parameters fail to deserialize is answered with an
    /// invalid-parameter error without invoking the handler body.
    pub fn register_call_method<I, O, F, Fut>(&mut self, method: &Method<I, O>, f: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.register_call(method.name(), move |parameters| {
            let input = wire::from_parameters::<I>(parameters)
                .map_err(|e| Error::Service(ServiceError::invalid_parameter(e)));
            let fut = input.map(&f);
            async move { wire::to_parameters(&fut?.await?) }
        });
    }

    /// Serve connections accepted from `listener` until it fails, the
    /// idle timeout expires or the stop flag is raised.
    pub async fn serve(self: Arc<Self>, listener: Listener, config: ListenConfig) -> Result<()> {
        let mut idle_since = Instant::now();
        loop {
            let stream = if config.idle_timeout > Duration::ZERO || config.stop.is_some() {
                let wait = if config.stop.is_some() {
                    Duration::from_millis(100)
                } else {
                    config.idle_timeout
                };
                match tokio::time::timeout(wait, listener.accept()).await {
                    Ok(accepted) => accepted?,
                    Err(_) => {
                        if let Some(stop) = &config.stop {
                            if stop.load(Ordering::SeqCst) {
                                return Ok(());
                            }
                        }
                        // The stop-flag poll wakes up every 100ms; the idle
                        // window spans those polls.
                        if config.idle_timeout > Duration::ZERO
                            && idle_since.elapsed() >= config.idle_timeout
                        {
                            return Err(Error::Timeout);
                        }
                        continue;
                    }
                }
            } else {
                listener.accept().await?
            };
            idle_since = Instant::now();

            let server = Arc::clone(&self);
            let read_timeout = config.read_timeout;
            tokio::spawn(async move {
                let mut chan = ServerChannel::new(stream);
                if let Some(timeout) = read_timeout {
                    chan.set_read_timeout(timeout);
                }
                if let Err(e) = server.handle_connection(chan).await {
                    match e {
                        Error::ConnectionClosed | Error::Timeout => {}
                        e => tracing::warn!(error = %e, "connection loop failed"),
                    }
                }
            });
        }
    }

    /// Drive the request loop for one connection. Public so custom
    /// transports can feed accepted streams directly.
    pub async fn handle_connection<S>(&self, mut chan: ServerChannel<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let request = match chan.recv().await {
                Ok(request) => request,
                Err(Error::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            self.dispatch(&mut chan, request).await?;
        }
    }

    async fn dispatch<S>(&self, chan: &mut ServerChannel<S>, request: Request) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let handler = match self.handlers.get(&request.method) {
            Some(handler) => handler,
            None => {
                let err = ServiceError::method_not_found(&request.method);
                return chan.send(&err.into()).await;
            }
        };

        let requested = HandlerKind::for_request(&request);
        if handler.kind() != requested {
            let err = ServiceError::invalid_parameter(format!(
                "method {} is registered as a {} handler, not {}",
                request.method,
                handler.kind(),
                requested
            ));
            return chan.send(&err.into()).await;
        }

        match handler {
            Handler::Oneway(f) => {
                if let Err(e) = f(request.parameters).await {
                    tracing::warn!(method = %request.method, error = %e, "oneway handler failed");
                }
                Ok(())
            }
            Handler::Call(f) => {
                let response = match f(request.parameters).await {
                    Ok(parameters) => Response::success(parameters, false),
                    Err(e) => error_response(e),
                };
                chan.send(&response).await
            }
            Handler::More(f) => self.drive_stream(chan, f, request.parameters).await,
        }
    }

    /// Run one streaming handler, forwarding its emitted replies in order.
    /// A bounded queue keeps the handler in lockstep with the connection's
    /// write backpressure.
    async fn drive_stream<S>(
        &self,
        chan: &mut ServerChannel<S>,
        f: &MoreFn,
        parameters: Parameters,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (tx, mut rx) = mpsc::channel(1);
        let mut fut = f(parameters, ReplySink { tx });

        let outcome = loop {
            tokio::select! {
                emitted = rx.recv() => match emitted {
                    Some((parameters, continues)) => {
                        chan.send(&Response::success(parameters, continues)).await?;
                    }
                    // Sink dropped early; wait for the handler to finish.
                    None => break (&mut fut).await,
                },
                result = &mut fut => break result,
            }
        };

        // Replies emitted just before the handler returned may still be
        // queued; flush them before reporting the outcome.
        while let Ok((parameters, continues)) = rx.try_recv() {
            chan.send(&Response::success(parameters, continues)).await?;
        }

        if let Err(e) = outcome {
            chan.send(&error_response(e)).await?;
        }
        Ok(())
    }
}

/// Map a handler failure to its error reply: structured service errors
/// pass through verbatim, anything else becomes a generic
/// invalid-parameter error carrying the failure's rendering.
fn error_response(err: Error) -> Response {
    match err {
        Error::Service(e) => e.into(),
        other => ServiceError::invalid_parameter(other).into(),
    }
}
