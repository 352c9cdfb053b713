//! Client call engine: a pool of idle channels and the three call modes.
//!
//! One channel carries one logical call at a time. `call` and `oneway`
//! borrow a channel for the duration of the exchange and pool it again;
//! `more` hands the channel to a [`MoreCall`] stream, which pools it back
//! when the reply stream reaches its end marker. A channel that failed
//! mid-call is dropped, never pooled.

use std::sync::Mutex;

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::chan::ClientChannel;
use crate::error::ServiceError;
use crate::transport::Connect;
use crate::wire::{self, Parameters, Request};
use crate::{Error, Method, Result};

/// One reply observed on a streaming call: success parameters, or an error
/// reply carried as data.
pub type StreamReply = std::result::Result<Parameters, ServiceError>;

/// A varlink client multiplexing calls over pooled connections.
///
/// Any idle pooled channel may serve the next call; the pool has no
/// ordering. Calls never wait for pool capacity: an empty pool means a
/// fresh connection.
pub struct Client<C: Connect> {
    connector: C,
    pool: Mutex<Vec<ClientChannel<C::Stream>>>,
}

impl<C: Connect> Client<C> {
    pub fn new(connector: C) -> Self {
        Client {
            connector,
            pool: Mutex::new(Vec::new()),
        }
    }

    /// The connector this client opens connections with.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Warm the pool with one open connection. Safe to call repeatedly;
    /// has no effect beyond establishing readiness.
    pub async fn connect(&self) -> Result<()> {
        let chan = self.acquire().await?;
        self.release(chan);
        Ok(())
    }

    /// Close every pooled connection concurrently. The client remains
    /// usable; later calls open fresh connections.
    pub async fn disconnect(&self) {
        let taken = std::mem::take(&mut *self.pool.lock().unwrap());
        join_all(taken.into_iter().map(|mut chan| async move {
            let _ = chan.close().await;
        }))
        .await;
    }

    async fn acquire(&self) -> Result<ClientChannel<C::Stream>> {
        if let Some(chan) = self.pool.lock().unwrap().pop() {
            return Ok(chan);
        }
        let stream = self.connector.connect().await?;
        let mut chan = ClientChannel::new(stream);
        if let Some(timeout) = self.connector.read_timeout() {
            chan.set_read_timeout(timeout);
        }
        Ok(chan)
    }

    fn release(&self, chan: ClientChannel<C::Stream>) {
        self.pool.lock().unwrap().push(chan);
    }

    /// Call a method and wait for its single reply.
    ///
    /// An error reply fails the call with [`Error::Service`], carrying the
    /// error name and detail parameters.
    pub async fn call(&self, method: &str, parameters: Parameters) -> Result<Parameters> {
        let mut chan = self.acquire().await?;
        chan.send(&Request::new(method, parameters)).await?;
        let response = chan.recv().await?;
        self.release(chan);
        Ok(response.into_result()?)
    }

    /// Fire a call that expects no reply. The connection is pooled again
    /// immediately; the peer sends nothing back for a oneway call.
    pub async fn oneway(&self, method: &str, parameters: Parameters) -> Result<()> {
        let mut chan = self.acquire().await?;
        let mut request = Request::new(method, parameters);
        request.oneway = true;
        chan.send(&request).await?;
        self.release(chan);
        Ok(())
    }

    /// Start a streaming call: one or more replies, ended by a success
    /// reply without `continues`.
    pub async fn more(&self, method: &str, parameters: Parameters) -> Result<MoreCall<'_, C>> {
        let mut chan = self.acquire().await?;
        let mut request = Request::new(method, parameters);
        request.more = true;
        chan.send(&request).await?;
        Ok(MoreCall {
            client: self,
            chan: Some(chan),
            done: false,
        })
    }

    /// Typed single-reply call through a [`Method`] descriptor.
    pub async fn call_method<I, O>(&self, method: &Method<I, O>, input: &I) -> Result<O>
    where
        I: Serialize + Sync,
        O: DeserializeOwned,
    {
        let parameters = wire::to_parameters(input)?;
        let reply = self.call(method.name(), parameters).await?;
        wire::from_parameters(reply)
    }

    /// Typed oneway call through a [`Method`] descriptor.
    pub async fn oneway_method<I, O>(&self, method: &Method<I, O>, input: &I) -> Result<()>
    where
        I: Serialize + Sync,
    {
        let parameters = wire::to_parameters(input)?;
        self.oneway(method.name(), parameters).await
    }
}

/// The reply stream of a `more` call.
///
/// `next` yields each reply in send order. Error replies are items, not
/// terminators: by protocol convention only a success reply without
/// `continues` ends the stream. Once the end marker is seen the channel
/// goes back to the pool; dropping the stream mid-call closes the channel
/// instead, since it may still carry in-flight replies.
pub struct MoreCall<'a, C: Connect> {
    client: &'a Client<C>,
    chan: Option<ClientChannel<C::Stream>>,
    done: bool,
}

impl<C: Connect> MoreCall<'_, C> {
    /// Wait for the next reply. Returns `Ok(None)` after the final reply
    /// has been yielded.
    pub async fn next(&mut self) -> Result<Option<StreamReply>> {
        if self.done {
            return Ok(None);
        }
        let chan = match self.chan.as_mut() {
            Some(chan) => chan,
            None => return Err(Error::ConnectionClosed),
        };

        let response = match chan.recv().await {
            Ok(response) => response,
            Err(e) => {
                // Fatal transport failure: the channel is unusable.
                self.done = true;
                self.chan = None;
                return Err(e);
            }
        };

        let continues = response.continues();
        match response.into_result() {
            // An error reply does not end the stream on its own.
            Err(service_err) => Ok(Some(Err(service_err))),
            Ok(parameters) => {
                if !continues {
                    self.done = true;
                    if let Some(chan) = self.chan.take() {
                        self.client.release(chan);
                    }
                }
                Ok(Some(Ok(parameters)))
            }
        }
    }
}
