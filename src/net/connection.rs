//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (New → Active → Hijacked | Idle → Closed)
//! - Generate unique connection and listener IDs for tracing
//! - Keep the shared table of live listeners and connections used by
//!   `close` and `shutdown`
//! - Let the multiplexer force-close a connection owned by another task

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::Poll;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::task::AtomicWaker;

use crate::lifecycle::Shutdown;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

static LISTENER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Opaque handle issued when a real listener is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(LISTENER_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, not yet sniffed.
    New = 0,
    /// Matchers are reading the connection.
    Active = 1,
    /// No matcher claimed the connection.
    Idle = 2,
    /// Handed to a sub-listener.
    Hijacked = 3,
    /// Closed by the multiplexer or by its consumer.
    Closed = 4,
}

impl ConnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnState::New,
            1 => ConnState::Active,
            2 => ConnState::Idle,
            3 => ConnState::Hijacked,
            _ => ConnState::Closed,
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnState::New => "new",
            ConnState::Active => "active",
            ConnState::Idle => "idle",
            ConnState::Hijacked => "hijacked",
            ConnState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// `(unix_secs << 8) | state` in one word so state reads never take a lock.
fn pack(state: ConnState, unix_secs: u64) -> u64 {
    (unix_secs << 8) | state as u64
}

fn unpack(packed: u64) -> (ConnState, u64) {
    (ConnState::from_u8((packed & 0xff) as u8), packed >> 8)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Force-close flag shared between a connection and the multiplexer.
///
/// The owning task registers its wakers on every poll so a close requested
/// from another task interrupts pending reads and writes.
#[derive(Debug, Default)]
pub struct CloseSignal {
    closed: AtomicBool,
    read_waker: AtomicWaker,
    write_waker: AtomicWaker,
}

impl CloseSignal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Request closure and wake any pending I/O.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.read_waker.wake();
        self.write_waker.wake();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub(crate) async fn closed(&self) {
        std::future::poll_fn(|cx| {
            self.register_read(cx.waker());
            if self.is_closed() {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }

    pub(crate) fn register_read(&self, waker: &std::task::Waker) {
        self.read_waker.register(waker);
    }

    pub(crate) fn register_write(&self, waker: &std::task::Waker) {
        self.write_waker.register(waker);
    }
}

/// Bookkeeping for one accepted connection.
#[derive(Debug)]
pub struct ConnectionRecord {
    id: ConnectionId,
    peer_addr: SocketAddr,
    state: AtomicU64,
    hijacked: AtomicBool,
    close: Arc<CloseSignal>,
}

impl ConnectionRecord {
    fn new(peer_addr: SocketAddr, close: Arc<CloseSignal>) -> Self {
        Self {
            id: ConnectionId::new(),
            peer_addr,
            state: AtomicU64::new(pack(ConnState::New, unix_now())),
            hijacked: AtomicBool::new(false),
            close,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnState {
        unpack(self.state.load(Ordering::Acquire)).0
    }

    /// State plus the unix time at which it was entered.
    pub fn state_since(&self) -> (ConnState, u64) {
        unpack(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ConnState) {
        if state == ConnState::Hijacked {
            self.hijacked.store(true, Ordering::Release);
        }
        self.state.store(pack(state, unix_now()), Ordering::Release);
        tracing::trace!(connection_id = %self.id, state = %state, "Connection state changed");
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked.load(Ordering::Acquire)
    }

    /// Force-close the underlying connection.
    pub fn close(&self) {
        self.close.close();
    }

    /// True when shutdown may close this connection without interrupting work.
    ///
    /// Connections stuck in `New` longer than `new_grace` count as idle.
    pub fn is_idle(&self, new_grace: Duration) -> bool {
        let (state, since) = self.state_since();
        match state {
            ConnState::Idle | ConnState::Closed => true,
            ConnState::New => unix_now().saturating_sub(since) >= new_grace.as_secs(),
            ConnState::Active | ConnState::Hijacked => false,
        }
    }
}

/// A real listener registered with the multiplexer.
#[derive(Debug)]
struct TrackedListener {
    addr: SocketAddr,
    stop: Shutdown,
}

#[derive(Debug, Default)]
struct Tables {
    listeners: HashMap<ListenerId, TrackedListener>,
    connections: HashMap<ConnectionId, Arc<ConnectionRecord>>,
}

/// Shared table of live listeners and connections.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    tables: Mutex<Tables>,
}

impl ConnectionTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        // The tables stay consistent even if a holder panicked.
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a new connection. The returned guard removes it on drop.
    pub fn track(self: &Arc<Self>, peer_addr: SocketAddr, close: Arc<CloseSignal>) -> ConnectionGuard {
        let record = Arc::new(ConnectionRecord::new(peer_addr, close));
        self.tables().connections.insert(record.id(), Arc::clone(&record));
        metrics::gauge!("mux_active_connections").increment(1.0);
        ConnectionGuard {
            record,
            tracker: Arc::clone(self),
        }
    }

    /// Register a real listener. The returned guard unregisters it on drop.
    pub fn register_listener(self: &Arc<Self>, addr: SocketAddr, stop: Shutdown) -> ListenerGuard {
        let id = ListenerId::next();
        self.tables().listeners.insert(id, TrackedListener { addr, stop });
        tracing::debug!(listener_id = %id, address = %addr, "Listener registered");
        ListenerGuard {
            id,
            tracker: Arc::clone(self),
        }
    }

    /// Addresses of every registered listener, in registration order.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        let tables = self.tables();
        let mut listeners: Vec<_> = tables.listeners.iter().map(|(id, l)| (id.0, l.addr)).collect();
        listeners.sort_by_key(|(id, _)| *id);
        listeners.into_iter().map(|(_, addr)| addr).collect()
    }

    /// Stop every registered listener. Returns how many were signalled.
    pub fn close_listeners(&self) -> usize {
        let tables = self.tables();
        for listener in tables.listeners.values() {
            listener.stop.trigger();
        }
        tables.listeners.len()
    }

    /// Force-close every tracked connection.
    pub fn close_connections(&self) -> usize {
        let tables = self.tables();
        for record in tables.connections.values() {
            record.close();
        }
        tables.connections.len()
    }

    /// Close idle connections; true when no connection is left doing work.
    pub fn close_idle(&self, new_grace: Duration) -> bool {
        let tables = self.tables();
        let mut quiescent = true;
        for record in tables.connections.values() {
            if record.is_idle(new_grace) {
                record.close();
            } else {
                quiescent = false;
            }
        }
        quiescent && tables.connections.is_empty()
    }

    pub fn active_count(&self) -> usize {
        self.tables().connections.len()
    }

    pub fn listener_count(&self) -> usize {
        self.tables().listeners.len()
    }

    fn remove_connection(&self, id: ConnectionId) {
        if self.tables().connections.remove(&id).is_some() {
            metrics::gauge!("mux_active_connections").decrement(1.0);
        }
    }

    fn remove_listener(&self, id: ListenerId) {
        self.tables().listeners.remove(&id);
    }
}

/// Guard that tracks a connection's lifetime.
/// Marks the record closed and removes it from the tracker when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    record: Arc<ConnectionRecord>,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.record.id()
    }

    pub fn record(&self) -> &Arc<ConnectionRecord> {
        &self.record
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.record.set_state(ConnState::Closed);
        self.tracker.remove_connection(self.record.id());
        tracing::trace!(connection_id = %self.record.id(), "Connection closed");
    }
}

/// Guard that keeps a listener registered while its accept loop runs.
#[derive(Debug)]
pub struct ListenerGuard {
    id: ListenerId,
    tracker: Arc<ConnectionTracker>,
}

impl ListenerGuard {
    pub fn id(&self) -> ListenerId {
        self.id
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.tracker.remove_listener(self.id);
        tracing::debug!(listener_id = %self.id, "Listener unregistered");
    }
}
