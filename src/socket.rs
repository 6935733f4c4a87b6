//! [`MessageSocket`]: a TCP connection carrying the framed message protocol
//! in [`crate::wire`], with a "streaming mode" that temporarily suspends
//! framing so that raw chunk bytes can flow directly.
//!
//! The framed/streaming split mirrors the teacher crate's use of
//! `tokio_util::codec::{Framed, FramedParts}` to swap decoders mid-
//! connection (there: handshake codec -> peer message codec; here: framed
//! mode -> raw byte stream -> framed mode again). Because a
//! `tokio::net::TcpStream` cannot be shared between the framed codec and a
//! raw reader/writer at once, [`MessageSocket::start_streaming`] moves the
//! socket out entirely and hands back an owned [`StreamHandle`]; the
//! `Framed` wrapper is reconstructed from the same stream once
//! [`MessageSocket::stop_streaming`] returns it. This is the "explicit
//! ownership transfer" the design calls for instead of sharing a socket
//! across contexts.

use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, FramedParts};

use crate::error::{Error, Result};
use crate::wire::{Message, MessageCodec};
use crate::{Hash, PeerId};

/// The outcome of a transaction on a socket, reported back via
/// [`MessageSocket::finished`].
///
/// This determines what happens to the socket next: returned to the idle
/// pool, kept but with its error counter bumped, or closed outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinishedStatus {
    /// The transaction completed cleanly; return the socket to the idle
    /// pool.
    Ok,
    /// The transaction failed (timeout, IO error, remote-logical failure).
    /// The socket's error counter is incremented; past a threshold the
    /// socket is closed instead of returned idle.
    Error,
    /// Close the socket unconditionally, without waiting to consume any
    /// remaining bytes. Used to abandon a worse peer mid-stream.
    ToClose,
}

/// An owned handle to a socket's raw TCP stream, valid only while the
/// [`MessageSocket`] it came from is in streaming mode.
///
/// `leftover` holds any bytes the framed codec had already buffered past
/// the frame boundary when streaming started -- these are logically the
/// first bytes of the chunk stream and must be drained before reading from
/// the socket itself.
pub struct StreamHandle {
    stream: TcpStream,
    leftover: BytesMut,
}

impl StreamHandle {
    /// Reads into `buf`, returning `Ok(0)` on a genuine EOF and
    /// [`Error::ReadTimeout`] if no data (and no EOF) arrives within
    /// `timeout`.
    ///
    /// Because `AsyncReadExt::read` only ever resolves on data, EOF, or an
    /// IO error -- never spuriously with zero bytes while the connection is
    /// still open -- wrapping it in [`tokio::time::timeout`] already
    /// distinguishes "no data yet" (the timeout elapses, future still
    /// pending) from a genuine EOF (the read future resolves with `Ok(0)`),
    /// without needing a separate readiness probe.
    pub async fn read_with_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        if !self.leftover.is_empty() {
            let n = buf.len().min(self.leftover.len());
            buf[..n].copy_from_slice(&self.leftover[..n]);
            self.leftover.advance(n);
            return Ok(n);
        }

        match tokio::time::timeout(timeout, self.stream.read(buf)).await {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Err(Error::ReadTimeout),
        }
    }

    /// Writes the whole of `buf` to the socket.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf).await.map_err(Error::Io)
    }
}

enum Transport {
    Framed(Box<Framed<TcpStream, MessageCodec>>),
    /// The stream has been handed out via [`MessageSocket::start_streaming`]
    /// and is owned by whichever worker is currently using it.
    Streaming,
    /// The socket has been closed and can no longer be used.
    Closed,
}

/// Which side of a connection dialed it.
///
/// [`crate::connection_pool::ConnectionPool`] treats the two differently:
/// an outbound socket may sit idle in the pool indefinitely, since we're
/// the one who'll want to reuse it; an inbound socket is never pooled for
/// later reuse, since only the peer that dialed in controls whether it
/// reconnects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// A TCP connection carrying the peer<->peer message protocol.
pub struct MessageSocket {
    transport: Transport,
    local_id: PeerId,
    remote_id: Option<PeerId>,
    peer_addr: SocketAddr,
    direction: Direction,
    active: bool,
    last_activity: Instant,
    error_count: u32,
}

impl MessageSocket {
    /// Dials `addr` and wraps the resulting connection in framed mode. The
    /// remote peer's id is not yet known; it is learned from the first
    /// frame received (or asserted once the caller knows it out of band).
    pub async fn connect(addr: SocketAddr, local_id: PeerId) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self::from_parts(stream, addr, local_id, None, Direction::Outbound))
    }

    /// Wraps an already-accepted inbound connection. The remote peer id is
    /// learned from the first frame, see
    /// [`crate::connection_pool::ConnectionPool::accept`].
    pub fn from_accepted(stream: TcpStream, addr: SocketAddr, local_id: PeerId) -> Self {
        Self::from_parts(stream, addr, local_id, None, Direction::Inbound)
    }

    fn from_parts(
        stream: TcpStream,
        addr: SocketAddr,
        local_id: PeerId,
        remote_id: Option<PeerId>,
        direction: Direction,
    ) -> Self {
        let framed = Framed::new(stream, MessageCodec::new(local_id, remote_id));
        Self {
            transport: Transport::Framed(Box::new(framed)),
            local_id,
            remote_id,
            peer_addr: addr,
            direction,
            active: true,
            last_activity: Instant::now(),
            error_count: 0,
        }
    }

    /// The remote address this socket is connected to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Which side dialed this connection.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// The remote peer id, once known (either asserted at construction or
    /// learned from the first received frame).
    pub fn remote_id(&self) -> Option<Hash> {
        self.remote_id.map(Hash::new)
    }

    /// Asserts the expected remote peer id up front, e.g. right after
    /// [`ConnectionPool::accept`](crate::connection_pool::ConnectionPool::accept)
    /// has read the first frame and validated it out of band.
    pub fn set_remote_id(&mut self, id: PeerId) {
        self.remote_id = Some(id);
        if let Transport::Framed(framed) = &mut self.transport {
            framed.codec_mut().remote_id = Some(id);
        }
    }

    /// Whether the socket has been used recently (sent or received a
    /// message) since the last call to [`Self::finished`].
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Marks the socket active and resets its idle timer. Called
    /// automatically by [`Self::send`]/[`Self::recv`].
    pub fn set_active(&mut self) {
        self.active = true;
        self.last_activity = Instant::now();
    }

    /// Whether the socket has sat idle (not in an active transaction)
    /// longer than `idle_timeout`.
    pub fn is_idle_timed_out(&self, idle_timeout: Duration) -> bool {
        !self.active && self.last_activity.elapsed() > idle_timeout
    }

    /// Whether the socket has been closed and must be discarded.
    pub fn is_closed(&self) -> bool {
        matches!(self.transport, Transport::Closed)
    }

    /// Sends a message in framed mode.
    ///
    /// # Errors
    ///
    /// Returns an error (and closes the socket) if the socket isn't in
    /// framed mode or the underlying write fails.
    pub async fn send(&mut self, msg: Message) -> Result<()> {
        self.set_active();
        let framed = match &mut self.transport {
            Transport::Framed(framed) => framed,
            _ => return Err(Error::InvalidFrame("socket not in framed mode".into())),
        };
        if let Err(e) = framed.send(msg).await {
            self.transport = Transport::Closed;
            return Err(e);
        }
        Ok(())
    }

    /// Receives the next message in framed mode, or `Ok(None)` if the peer
    /// closed the connection cleanly.
    pub async fn recv(&mut self) -> Result<Option<Message>> {
        let framed = match &mut self.transport {
            Transport::Framed(framed) => framed,
            _ => return Err(Error::InvalidFrame("socket not in framed mode".into())),
        };
        match framed.next().await {
            Some(Ok(msg)) => {
                if self.remote_id.is_none() {
                    self.remote_id = framed.codec().remote_id;
                }
                self.set_active();
                Ok(Some(msg))
            }
            Some(Err(e)) => {
                self.transport = Transport::Closed;
                Err(e)
            }
            None => Ok(None),
        }
    }

    /// Suspends framing and returns an owned [`StreamHandle`] over the raw
    /// TCP stream. Any bytes the framed decoder had already buffered past
    /// the last frame boundary are preserved as the handle's `leftover`, so
    /// a `GET_CHUNK_RESULT` sent/received back-to-back with chunk bytes
    /// never loses data.
    pub fn start_streaming(&mut self) -> Result<StreamHandle> {
        let transport = std::mem::replace(&mut self.transport, Transport::Streaming);
        let framed = match transport {
            Transport::Framed(framed) => *framed,
            other => {
                self.transport = other;
                return Err(Error::InvalidFrame(
                    "socket not in framed mode, cannot start streaming".into(),
                ));
            }
        };
        let parts = framed.into_parts();
        Ok(StreamHandle {
            stream: parts.io,
            leftover: parts.read_buf,
        })
    }

    /// Resumes framed mode from a [`StreamHandle`] previously returned by
    /// [`Self::start_streaming`].
    pub fn stop_streaming(&mut self, handle: StreamHandle) {
        let codec = MessageCodec::new(self.local_id, self.remote_id);
        let mut parts = FramedParts::new(handle.stream, codec);
        parts.read_buf = handle.leftover;
        self.transport = Transport::Framed(Box::new(Framed::from_parts(parts)));
        self.set_active();
    }

    /// Reports the outcome of a transaction, per [`FinishedStatus`].
    ///
    /// `max_errors` is the configured
    /// [`TransferConf::max_socket_errors_before_close`](crate::conf::TransferConf::max_socket_errors_before_close).
    pub fn finished(&mut self, status: FinishedStatus, max_errors: u32) {
        if !self.active {
            return;
        }

        match status {
            FinishedStatus::ToClose => {
                self.transport = Transport::Closed;
                self.active = false;
                return;
            }
            FinishedStatus::Error => {
                self.error_count += 1;
                if self.error_count > max_errors {
                    self.transport = Transport::Closed;
                    self.active = false;
                    return;
                }
            }
            FinishedStatus::Ok => {
                self.error_count = 0;
            }
        }

        self.active = false;
        self.last_activity = Instant::now();
    }
}

/// A sink for errors coming out of the IO layer that should close the
/// socket without further ceremony, matching `Socket::close()`'s
/// unconditional-close semantics in the original design.
pub(crate) fn io_err_closes(e: io::Error) -> Error {
    Error::Io(e)
}
