//! Virtual listeners fed by the multiplexer.
//!
//! # Responsibilities
//! - Queue hijacked connections for one protocol server (bounded, FIFO)
//! - Apply backpressure: a full queue blocks the handoff, never drops it
//! - Close every queued connection when the sub-listener goes away

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::lifecycle::Shutdown;
use crate::mux::error::MuxError;
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::net::{ConnState, ConnectionId, ReplayConn};

/// A connection claimed by a matcher group.
///
/// Reads first replay the bytes the matchers sniffed, then continue on the
/// wire. Dropping it closes the connection and updates the multiplexer's
/// bookkeeping.
#[derive(Debug)]
pub struct MuxConn {
    conn: ReplayConn,
    guard: ConnectionGuard,
}

impl MuxConn {
    pub(crate) fn new(mut conn: ReplayConn, guard: ConnectionGuard) -> Self {
        conn.done_sniffing();
        guard.record().set_state(ConnState::Hijacked);
        Self { conn, guard }
    }

    pub fn id(&self) -> ConnectionId {
        self.guard.id()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.conn.peer_addr()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.conn.local_addr()
    }

    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.conn.set_read_deadline(at);
    }

    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.conn.set_write_deadline(at);
    }

    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.conn.set_deadline(at);
    }

    /// Shut down the write half and release the connection.
    pub async fn close(mut self) -> io::Result<()> {
        self.conn.shutdown().await
    }
}

impl AsyncRead for MuxConn {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_read(cx, buf)
    }
}

impl AsyncWrite for MuxConn {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().conn).poll_write(cx, data)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_shutdown(cx)
    }
}

#[derive(Debug)]
struct Shared {
    group: usize,
    tx: mpsc::Sender<MuxConn>,
    rx: Mutex<mpsc::Receiver<MuxConn>>,
    /// Cancelled by `close` or together with the multiplexer.
    scope: Shutdown,
    closed: AtomicBool,
    tracker: Arc<ConnectionTracker>,
}

/// Listener handed to one protocol server.
///
/// Cheap to clone; clones share the same queue.
#[derive(Debug, Clone)]
pub struct SubListener {
    shared: Arc<Shared>,
}

impl SubListener {
    pub(crate) fn new(group: usize, capacity: usize, scope: Shutdown, tracker: Arc<ConnectionTracker>) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            shared: Arc::new(Shared {
                group,
                tx,
                rx: Mutex::new(rx),
                scope,
                closed: AtomicBool::new(false),
                tracker,
            }),
        }
    }

    /// Priority of the group feeding this listener (0 = first registered).
    pub fn group(&self) -> usize {
        self.shared.group
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst) || self.shared.scope.is_triggered()
    }

    /// Queue a hijacked connection for `accept`.
    ///
    /// Waits while the queue is full. Gives up with `ListenerClosed` when
    /// this listener closes and with `Cancelled` when `ctx` is cancelled; in
    /// both cases `conn` is closed before returning.
    pub async fn notify(&self, ctx: &Shutdown, conn: MuxConn) -> Result<(), MuxError> {
        if self.is_closed() {
            Self::reject(conn, "listener closed");
            return Err(MuxError::ListenerClosed);
        }
        if ctx.is_triggered() {
            Self::reject(conn, "handoff cancelled");
            return Err(MuxError::Cancelled);
        }

        let reserved = tokio::select! {
            biased;
            _ = self.shared.scope.cancelled() => Err(MuxError::ListenerClosed),
            _ = ctx.cancelled() => Err(MuxError::Cancelled),
            permit = self.shared.tx.reserve() => permit.map_err(|_| MuxError::ListenerClosed),
        };

        match reserved {
            Ok(permit) => {
                tracing::trace!(connection_id = %conn.id(), group = self.shared.group, "Connection queued");
                permit.send(conn);
                if self.is_closed() {
                    // Raced with close(): its drain may already have run.
                    self.drain_queued().await;
                }
                Ok(())
            }
            Err(e) => {
                Self::reject(conn, "handoff abandoned");
                Err(e)
            }
        }
    }

    fn reject(conn: MuxConn, reason: &'static str) {
        tracing::debug!(connection_id = %conn.id(), peer_addr = %conn.peer_addr(), reason, "Closing undeliverable connection");
        drop(conn);
    }

    /// Close every queued connection. Returns how many there were.
    async fn drain_queued(&self) -> usize {
        let mut rx = self.shared.rx.lock().await;
        rx.close();
        let mut drained = 0usize;
        while let Ok(conn) = rx.try_recv() {
            drop(conn);
            drained += 1;
        }
        drained
    }

    /// Wait for the next matched connection.
    pub async fn accept(&self) -> Result<MuxConn, MuxError> {
        if self.is_closed() {
            return Err(MuxError::ListenerClosed);
        }

        let mut rx = tokio::select! {
            biased;
            _ = self.shared.scope.cancelled() => return Err(MuxError::ListenerClosed),
            rx = self.shared.rx.lock() => rx,
        };

        tokio::select! {
            biased;
            _ = self.shared.scope.cancelled() => Err(MuxError::ListenerClosed),
            conn = rx.recv() => conn.ok_or(MuxError::ListenerClosed),
        }
    }

    /// Close the listener and every connection still queued. Idempotent.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.scope.trigger();

        let drained = self.drain_queued().await;
        tracing::debug!(group = self.shared.group, drained, "Sub-listener closed");
    }

    /// Addresses of every real listener currently feeding the multiplexer.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.shared.tracker.listener_addrs()
    }

    /// First of [`addrs`](Self::addrs).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.addrs()
            .first()
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "multiplexer is not serving any listener"))
    }

    /// Connections waiting for `accept`.
    pub fn queued(&self) -> usize {
        self.shared.tx.max_capacity() - self.shared.tx.capacity()
    }
}

impl axum::serve::Listener for SubListener {
    type Io = MuxConn;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match SubListener::accept(self).await {
            Ok(conn) => {
                let peer_addr = conn.peer_addr();
                (conn, peer_addr)
            }
            // axum expects accept to never fail; a closed listener has nothing left to yield.
            Err(_) => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        SubListener::local_addr(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::CloseSignal;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, DuplexStream};

    fn mux_conn(tracker: &Arc<ConnectionTracker>) -> (MuxConn, DuplexStream) {
        let (server, client) = tokio::io::duplex(1024);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let close = CloseSignal::new();
        let guard = tracker.track(addr, Arc::clone(&close));
        let conn = ReplayConn::new(Box::new(server), addr, addr, close);
        (MuxConn::new(conn, guard), client)
    }

    fn sub_listener(capacity: usize) -> (SubListener, Arc<ConnectionTracker>) {
        let tracker = ConnectionTracker::new();
        let sl = SubListener::new(0, capacity, Shutdown::new(), Arc::clone(&tracker));
        (sl, tracker)
    }

    #[tokio::test]
    async fn notify_then_accept_delivers_in_order() {
        let (sl, tracker) = sub_listener(4);
        let ctx = Shutdown::new();
        let (a, _ca) = mux_conn(&tracker);
        let (b, _cb) = mux_conn(&tracker);
        let (a_id, b_id) = (a.id(), b.id());

        sl.notify(&ctx, a).await.unwrap();
        sl.notify(&ctx, b).await.unwrap();
        assert_eq!(sl.queued(), 2);

        assert_eq!(sl.accept().await.unwrap().id(), a_id);
        assert_eq!(sl.accept().await.unwrap().id(), b_id);
    }

    #[tokio::test]
    async fn full_queue_blocks_until_accept_frees_a_slot() {
        let (sl, tracker) = sub_listener(1);
        let ctx = Shutdown::new();
        let (first, _c1) = mux_conn(&tracker);
        let (second, _c2) = mux_conn(&tracker);
        sl.notify(&ctx, first).await.unwrap();

        let blocked = {
            let sl = sl.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { sl.notify(&ctx, second).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        let _first = sl.accept().await.unwrap();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("notify resumes once a slot frees")
            .unwrap()
            .unwrap();
        assert_eq!(sl.queued(), 1);
    }

    #[tokio::test]
    async fn cancelled_handoff_closes_connection() {
        let (sl, tracker) = sub_listener(1);
        let ctx = Shutdown::new();
        let (first, _c1) = mux_conn(&tracker);
        let (second, mut client) = mux_conn(&tracker);
        sl.notify(&ctx, first).await.unwrap();

        let blocked = {
            let sl = sl.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { sl.notify(&ctx, second).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.trigger();

        let err = blocked.await.unwrap().unwrap_err();
        assert!(matches!(err, MuxError::Cancelled));
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0, "peer sees EOF");
        assert_eq!(tracker.active_count(), 1);
    }

    #[tokio::test]
    async fn close_drains_queue_and_fails_later_calls() {
        let (sl, tracker) = sub_listener(4);
        let ctx = Shutdown::new();
        let (queued, mut client) = mux_conn(&tracker);
        sl.notify(&ctx, queued).await.unwrap();

        sl.close().await;
        sl.close().await;

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(tracker.active_count(), 0);

        assert!(matches!(sl.accept().await, Err(MuxError::ListenerClosed)));
        let (late, _c) = mux_conn(&tracker);
        assert!(matches!(sl.notify(&ctx, late).await, Err(MuxError::ListenerClosed)));
        assert_eq!(tracker.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_notify_and_close_never_strand_a_connection() {
        for _ in 0..200 {
            let (sl, tracker) = sub_listener(4);
            let ctx = Shutdown::new();
            let mut clients = Vec::new();
            let mut senders = Vec::new();
            for _ in 0..3 {
                let (conn, client) = mux_conn(&tracker);
                clients.push(client);
                let sl = sl.clone();
                let ctx = ctx.clone();
                senders.push(tokio::spawn(async move { sl.notify(&ctx, conn).await }));
            }
            let closer = {
                let sl = sl.clone();
                tokio::spawn(async move { sl.close().await })
            };

            for sender in senders {
                let _ = sender.await.unwrap();
            }
            closer.await.unwrap();

            assert_eq!(tracker.active_count(), 0);
            for mut client in clients {
                let mut buf = [0u8; 1];
                assert_eq!(client.read(&mut buf).await.unwrap(), 0);
            }
        }
    }

    #[tokio::test]
    async fn close_wakes_pending_accept() {
        let (sl, _tracker) = sub_listener(1);
        let waiter = {
            let sl = sl.clone();
            tokio::spawn(async move { sl.accept().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        sl.close().await;
        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert!(matches!(result, Err(MuxError::ListenerClosed)));
    }

    #[tokio::test]
    async fn addr_reflects_registered_listeners() {
        let (sl, tracker) = sub_listener(1);
        assert!(sl.local_addr().is_err());

        let addr: SocketAddr = "127.0.0.1:7000".parse().unwrap();
        let _guard = tracker.register_listener(addr, Shutdown::new());
        assert_eq!(sl.local_addr().unwrap(), addr);
        assert_eq!(sl.addrs(), vec![addr]);
    }

    #[tokio::test]
    async fn accepted_conn_replays_sniffed_bytes() {
        use tokio::io::AsyncWriteExt;

        let tracker = ConnectionTracker::new();
        let (server, mut client) = tokio::io::duplex(1024);
        let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let close = CloseSignal::new();
        let guard = tracker.track(addr, Arc::clone(&close));
        let mut conn = ReplayConn::new(Box::new(server), addr, addr, close);

        client.write_all(b"hello").await.unwrap();
        let mut peek = [0u8; 2];
        conn.start_sniffing().read_exact(&mut peek).await.unwrap();

        let mut hijacked = MuxConn::new(conn, guard);
        drop(client);
        let mut all = Vec::new();
        hijacked.read_to_end(&mut all).await.unwrap();
        assert_eq!(all, b"hello");
    }
}
