//! Raw listener abstraction.
//!
//! # Responsibilities
//! - Accept incoming transport connections for the multiplexer
//! - Defer expensive per-connection setup (TLS handshakes) to the
//!   per-connection task so the accept loop never stalls on one peer
//! - Classify accept errors as transient or fatal

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;

use crate::net::RawIo;

type Handshake = Pin<Box<dyn Future<Output = io::Result<Box<dyn RawIo>>> + Send>>;

/// A connection fresh out of `accept`.
pub struct Incoming {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    io: IncomingIo,
}

enum IncomingIo {
    Ready(Box<dyn RawIo>),
    Handshake(Handshake),
}

impl Incoming {
    /// A connection that needs no further setup.
    pub fn ready(io: Box<dyn RawIo>, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self {
        Self {
            peer_addr,
            local_addr,
            io: IncomingIo::Ready(io),
        }
    }

    /// A connection that becomes usable once `handshake` completes.
    pub fn handshake<F>(handshake: F, peer_addr: SocketAddr, local_addr: SocketAddr) -> Self
    where
        F: Future<Output = io::Result<Box<dyn RawIo>>> + Send + 'static,
    {
        Self {
            peer_addr,
            local_addr,
            io: IncomingIo::Handshake(Box::pin(handshake)),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Finish connection setup.
    pub async fn establish(self) -> io::Result<Box<dyn RawIo>> {
        match self.io {
            IncomingIo::Ready(io) => Ok(io),
            IncomingIo::Handshake(handshake) => handshake.await,
        }
    }
}

/// Source of raw connections for [`Multiplexer::serve`](crate::mux::Multiplexer::serve).
#[async_trait]
pub trait RawListener: Send + Sync {
    /// Accept the next connection.
    async fn accept(&self) -> io::Result<Incoming>;

    /// Address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl RawListener for TcpListener {
    async fn accept(&self) -> io::Result<Incoming> {
        let (stream, peer_addr) = TcpListener::accept(self).await?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        Ok(Incoming::ready(Box::new(stream), peer_addr, local_addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// TCP listener that terminates TLS before sniffing.
pub struct TlsListener {
    inner: TcpListener,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn new(inner: TcpListener, config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
        }
    }
}

#[async_trait]
impl RawListener for TlsListener {
    async fn accept(&self) -> io::Result<Incoming> {
        let (stream, peer_addr) = self.inner.accept().await?;
        let local_addr = stream.local_addr()?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(peer_addr = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
        }
        let acceptor = self.acceptor.clone();
        let handshake = async move {
            let tls = acceptor.accept(stream).await?;
            Ok(Box::new(tls) as Box<dyn RawIo>)
        };
        Ok(Incoming::handshake(handshake, peer_addr, local_addr))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Accept errors worth retrying after a short pause.
///
/// Covers per-connection failures (the peer went away before we got to it)
/// and resource exhaustion that clears once other connections close.
pub fn is_transient_accept_error(e: &io::Error) -> bool {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::OutOfMemory
    ) {
        return true;
    }
    // ENOMEM, ENFILE, EMFILE, ENOBUFS
    #[cfg(unix)]
    if matches!(e.raw_os_error(), Some(12 | 23 | 24 | 105)) {
        return true;
    }
    false
}
