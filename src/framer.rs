//! Message framing over a raw duplex byte stream.
//!
//! [`Framer`] binds one raw connection to a [`FrameDecoder`], turning
//! arbitrary-sized reads into discrete messages and writing each outgoing
//! message with its single NUL terminator. All failures it surfaces are
//! I/O failures; framing itself cannot fail.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::wire::FrameDecoder;
use crate::{Error, Result};

const READ_BUF_SIZE: usize = 8192;

/// A framed duplex connection.
///
/// `recv` drains complete messages in FIFO order, reading more bytes from
/// the stream as needed. A fatal stream condition (reset, EOF, idle
/// timeout) is returned exactly once; afterwards the framer is dead and
/// every call fails with [`Error::ConnectionClosed`].
pub struct Framer<S> {
    stream: S,
    decoder: FrameDecoder,
    read_timeout: Option<Duration>,
    dead: bool,
    closed: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Framer<S> {
    pub fn new(stream: S) -> Self {
        Framer {
            stream,
            decoder: FrameDecoder::new(),
            read_timeout: None,
            dead: false,
            closed: false,
        }
    }

    /// Enforce an idle read timeout: if no bytes arrive within `timeout`
    /// while `recv` is waiting, the connection is torn down and `recv`
    /// fails with [`Error::Timeout`].
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = Some(timeout);
    }

    /// Write one message followed by exactly one NUL byte.
    ///
    /// Suspends until the whole message is flushed; partial writes are
    /// never observable.
    pub async fn send(&mut self, message: &[u8]) -> Result<()> {
        if self.dead {
            return Err(Error::ConnectionClosed);
        }
        let result = async {
            self.stream.write_all(message).await?;
            self.stream.write_all(&[0]).await?;
            self.stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.dead = true;
            return Err(e.into());
        }
        Ok(())
    }

    /// Wait for the next complete message, oldest first.
    pub async fn recv(&mut self) -> Result<Vec<u8>> {
        loop {
            if let Some(frame) = self.decoder.next_frame() {
                return Ok(frame);
            }
            if self.dead {
                return Err(Error::ConnectionClosed);
            }

            let mut buf = [0u8; READ_BUF_SIZE];
            let read = match self.read_timeout {
                Some(timeout) => {
                    match tokio::time::timeout(timeout, self.stream.read(&mut buf)).await {
                        Ok(read) => read,
                        Err(_) => {
                            self.dead = true;
                            return Err(Error::Timeout);
                        }
                    }
                }
                None => self.stream.read(&mut buf).await,
            };

            match read {
                Ok(0) => {
                    self.dead = true;
                    return Err(Error::ConnectionClosed);
                }
                Ok(n) => self.decoder.push(&buf[..n]),
                Err(e) => {
                    self.dead = true;
                    return Err(e.into());
                }
            }
        }
    }

    /// Shut down the write side of the stream. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.dead = true;
        let _ = self.stream.shutdown().await;
        Ok(())
    }
}
