//! Replay-capable connection wrapper.
//!
//! While sniffing, every byte read from the raw connection is appended to an
//! internal buffer as well as returned to the reader. Re-sniffing rewinds the
//! read cursor to offset 0 of that buffer, so the next matcher sees the exact
//! same leading bytes without touching the wire again. Once sniffing is done,
//! reads drain whatever is still buffered and then fall through to the raw
//! connection.
//!
//! ```text
//!            sniffing                         done
//! raw ──read──▶ buffer ──cursor──▶ matcher    buffer[cursor..] ──▶ consumer
//!                                             raw ──────────────▶ consumer
//! ```

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::{Instant, Sleep};

use crate::net::connection::CloseSignal;
use crate::net::RawIo;

/// Deadline that can be polled alongside I/O.
struct Deadline {
    sleep: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn none() -> Self {
        Self { sleep: None }
    }

    fn set(&mut self, at: Option<Instant>) {
        match (at, self.sleep.as_mut()) {
            (Some(at), Some(sleep)) => sleep.as_mut().reset(at),
            (Some(at), None) => self.sleep = Some(Box::pin(tokio::time::sleep_until(at))),
            (None, _) => self.sleep = None,
        }
    }

    fn is_set(&self) -> bool {
        self.sleep.is_some()
    }

    /// Ready once the deadline has passed; registers the waker otherwise.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }
}

fn deadline_exceeded() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "i/o deadline exceeded")
}

fn force_closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed by multiplexer")
}

/// A raw connection plus the bytes sniffed from it.
pub struct ReplayConn {
    inner: Box<dyn RawIo>,
    buffer: Vec<u8>,
    /// Read position inside `buffer`.
    cursor: usize,
    sniffing: bool,
    read_deadline: Deadline,
    write_deadline: Deadline,
    close: Arc<CloseSignal>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for ReplayConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayConn")
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .field("buffered", &self.buffer.len())
            .field("cursor", &self.cursor)
            .field("sniffing", &self.sniffing)
            .finish()
    }
}

impl ReplayConn {
    pub fn new(
        inner: Box<dyn RawIo>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        close: Arc<CloseSignal>,
    ) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            cursor: 0,
            sniffing: false,
            read_deadline: Deadline::none(),
            write_deadline: Deadline::none(),
            close,
            peer_addr,
            local_addr,
        }
    }

    /// Begin (or restart) a sniffing pass from buffer offset 0.
    pub fn start_sniffing(&mut self) -> Sniffer<'_> {
        self.sniffing = true;
        self.cursor = 0;
        Sniffer { conn: self }
    }

    /// Freeze the buffer; subsequent reads drain it and then hit the wire.
    pub fn done_sniffing(&mut self) {
        self.sniffing = false;
        self.cursor = 0;
    }

    pub fn is_sniffing(&self) -> bool {
        self.sniffing
    }

    /// Bytes captured so far.
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Fail raw reads with `TimedOut` after `at`; `None` clears the deadline.
    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.set_read_deadline(at);
        self.set_write_deadline(at);
    }

    /// Convenience for `set_read_deadline(Some(now + timeout))`.
    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.set_read_deadline(Some(Instant::now() + timeout));
    }

    pub fn has_read_deadline(&self) -> bool {
        self.read_deadline.is_set()
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_closed()
    }

    pub(crate) fn close_signal(&self) -> &Arc<CloseSignal> {
        &self.close
    }

    fn poll_read_inner(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if self.close.is_closed() {
            return Poll::Ready(Err(force_closed()));
        }
        self.close.register_read(cx.waker());

        if self.cursor < self.buffer.len() {
            let pending = &self.buffer[self.cursor..];
            let n = pending.len().min(buf.remaining());
            buf.put_slice(&pending[..n]);
            self.cursor += n;
            return Poll::Ready(Ok(()));
        }

        if !self.sniffing && !self.buffer.is_empty() {
            // Fully replayed; release the memory.
            self.buffer = Vec::new();
            self.cursor = 0;
        }

        let filled_before = buf.filled().len();
        match Pin::new(&mut self.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                if self.sniffing {
                    let fresh = &buf.filled()[filled_before..];
                    self.buffer.extend_from_slice(fresh);
                    self.cursor = self.buffer.len();
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                if self.read_deadline.poll_expired(cx) {
                    Poll::Ready(Err(deadline_exceeded()))
                } else {
                    Poll::Pending
                }
            }
        }
    }

    fn poll_write_inner(&mut self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        if self.close.is_closed() {
            return Poll::Ready(Err(force_closed()));
        }
        self.close.register_write(cx.waker());

        match Pin::new(&mut self.inner).poll_write(cx, data) {
            Poll::Pending => {
                if self.write_deadline.poll_expired(cx) {
                    Poll::Ready(Err(deadline_exceeded()))
                } else {
                    Poll::Pending
                }
            }
            ready => ready,
        }
    }
}

impl AsyncRead for ReplayConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_read_inner(cx, buf)
    }
}

impl AsyncWrite for ReplayConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().poll_write_inner(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.close.is_closed() {
            return Poll::Ready(Err(force_closed()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Buffering view over a [`ReplayConn`] handed to matchers.
///
/// Reads are captured for replay; writes go straight to the peer.
pub struct Sniffer<'a> {
    conn: &'a mut ReplayConn,
}

impl Sniffer<'_> {
    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr
    }

    /// Bytes this pass has consumed so far.
    pub fn consumed(&self) -> &[u8] {
        &self.conn.buffer[..self.conn.cursor]
    }
}

impl AsyncRead for Sniffer<'_> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        self.get_mut().conn.poll_read_inner(cx, buf)
    }
}

impl AsyncWrite for Sniffer<'_> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        self.get_mut().conn.poll_write_inner(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.get_mut().conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Matchers never get to end the stream.
        Poll::Ready(Ok(()))
    }
}
