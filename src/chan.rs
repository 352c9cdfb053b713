//! Typed channels: the two directions of one framing/codec pair.
//!
//! A [`ClientChannel`] sends requests and receives responses; a
//! [`ServerChannel`] is its mirror image. One `recv` consumes exactly one
//! frame; no typed message is ever buffered beyond what the framer holds.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::framer::Framer;
use crate::wire::{self, Request, Response};
use crate::Result;

/// The client-facing end of a connection.
pub struct ClientChannel<S> {
    framer: Framer<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ClientChannel<S> {
    pub fn new(stream: S) -> Self {
        ClientChannel {
            framer: Framer::new(stream),
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.framer.set_read_timeout(timeout);
    }

    pub async fn send(&mut self, request: &Request) -> Result<()> {
        let bytes = wire::encode_request(request)?;
        self.framer.send(&bytes).await
    }

    pub async fn recv(&mut self) -> Result<Response> {
        let frame = self.framer.recv().await?;
        wire::decode_response(&frame)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.framer.close().await
    }
}

/// The server-facing end of a connection.
pub struct ServerChannel<S> {
    framer: Framer<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> ServerChannel<S> {
    pub fn new(stream: S) -> Self {
        ServerChannel {
            framer: Framer::new(stream),
        }
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.framer.set_read_timeout(timeout);
    }

    pub async fn send(&mut self, response: &Response) -> Result<()> {
        let bytes = wire::encode_response(response)?;
        self.framer.send(&bytes).await
    }

    pub async fn recv(&mut self) -> Result<Request> {
        let frame = self.framer.recv().await?;
        wire::decode_request(&frame)
    }

    pub async fn close(&mut self) -> Result<()> {
        self.framer.close().await
    }
}
