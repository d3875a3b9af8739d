//! The connection multiplexer.
//!
//! # Responsibilities
//! - Run the accept loop for every served listener (with backoff)
//! - Sniff each connection against the matcher groups in priority order
//! - Hand matched connections to the group's sub-listener, close the rest
//! - Close or gracefully shut down everything it tracks

use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MuxConfig;
use crate::lifecycle::Shutdown;
use crate::matching::{self, BoxMatcher};
use crate::mux::error::{panic_message, MuxError};
use crate::mux::group::MatcherGroup;
use crate::mux::policy::{default_error_policy, ErrorPolicy};
use crate::mux::sub_listener::{MuxConn, SubListener};
use crate::net::connection::{CloseSignal, ConnectionTracker};
use crate::net::listener::Incoming;
use crate::net::tls::{load_tls_config, with_default_alpn};
use crate::net::{ConnState, RawListener, ReplayConn, TlsListener};
use crate::resilience::Backoff;

type Groups = Arc<Vec<Arc<MatcherGroup>>>;

struct Inner {
    tracker: Arc<ConnectionTracker>,
    /// Copy-on-write so connection tasks sniff against a stable snapshot.
    groups: RwLock<Groups>,
    policy: RwLock<ErrorPolicy>,
    read_timeout: RwLock<Option<Duration>>,
    /// Cancelled by `close` and at the end of a successful `shutdown`.
    root: Shutdown,
    /// Child of `root`; cancelled when acceptance stops.
    accepting: Shutdown,
    queue_capacity: usize,
    backoff_base: Duration,
    backoff_max: Duration,
    poll_interval: Duration,
    new_idle_grace: Duration,
    /// Set once `close` has torn everything down.
    torn_down: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Releases the root watcher and every sub-listener still in use.
        self.root.trigger();
    }
}

/// Serves several protocols from the same listeners.
///
/// Cheap to clone; clones drive the same multiplexer.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("groups", &self.groups().len())
            .field("listeners", &self.inner.tracker.listener_count())
            .field("connections", &self.inner.tracker.active_count())
            .field("closed", &self.inner.root.is_triggered())
            .finish()
    }
}

impl Multiplexer {
    /// Multiplexer with default settings, cancelled together with `parent`.
    pub fn new(parent: &Shutdown) -> Self {
        Self::with_config(parent, &MuxConfig::default())
    }

    /// Multiplexer tuned by `config`.
    ///
    /// Only the runtime settings are read (sniff timeout, queue, backoff,
    /// shutdown); groups are registered with [`match_group`](Self::match_group).
    pub fn with_config(parent: &Shutdown, config: &MuxConfig) -> Self {
        let root = parent.child();
        let accepting = root.child();
        // A zero delay would spin the accept loop on persistent errors.
        let backoff_base_ms = config.backoff.base_ms.max(1);
        let mux = Self {
            inner: Arc::new(Inner {
                tracker: ConnectionTracker::new(),
                groups: RwLock::new(Arc::new(Vec::new())),
                policy: RwLock::new(default_error_policy()),
                read_timeout: RwLock::new(config.timeouts.read_timeout()),
                root,
                accepting,
                queue_capacity: config.queue.capacity.max(1),
                backoff_base: Duration::from_millis(backoff_base_ms),
                backoff_max: Duration::from_millis(config.backoff.max_ms.max(backoff_base_ms)),
                poll_interval: Duration::from_millis(config.shutdown.poll_interval_ms.max(1)),
                new_idle_grace: Duration::from_secs(config.shutdown.new_idle_secs),
                torn_down: AtomicBool::new(false),
            }),
        };
        mux.watch_root();
        mux
    }

    /// Tear down like `close` when the root scope is cancelled from outside,
    /// such as through the parent scope.
    fn watch_root(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("Multiplexer created outside a tokio runtime; parent cancellation only stops serving");
            return;
        };
        let root = self.inner.root.clone();
        let inner = Arc::downgrade(&self.inner);
        runtime.spawn(async move {
            root.cancelled().await;
            if let Some(inner) = inner.upgrade() {
                Multiplexer { inner }.close().await;
            }
        });
    }

    /// Register a group of alternative matchers and return its listener.
    ///
    /// Groups are tried in registration order; the first group with a
    /// matching matcher receives the connection. May be called while serving.
    pub fn match_group<I>(&self, matchers: I) -> SubListener
    where
        I: IntoIterator<Item = BoxMatcher>,
    {
        let matchers: Vec<BoxMatcher> = matchers.into_iter().collect();
        let mut groups = self.inner.groups.write().unwrap_or_else(|poisoned| poisoned.into_inner());

        let index = groups.len();
        let target = SubListener::new(
            index,
            self.inner.queue_capacity,
            self.inner.root.child(),
            Arc::clone(&self.inner.tracker),
        );
        let mut next = Vec::with_capacity(index + 1);
        next.extend(groups.iter().cloned());
        next.push(Arc::new(MatcherGroup::new(index, matchers, target.clone())));
        *groups = Arc::new(next);

        tracing::debug!(group = index, "Matcher group registered");
        target
    }

    /// Catch-all group whose connections are each served by `handler` on
    /// its own task. Register it last.
    ///
    /// A panicking handler only loses its own connection; panics carrying
    /// [`AbortHandler`](crate::mux::AbortHandler) are not logged. Must be
    /// called from within a tokio runtime.
    pub fn match_and_go_serve<F, Fut>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(MuxConn) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = self.match_group([matching::any()]);
        let handler = Arc::new(handler);

        tokio::spawn(async move {
            while let Ok(conn) = listener.accept().await {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let connection_id = conn.id();
                    let outcome = AssertUnwindSafe(async move { handler(conn).await })
                        .catch_unwind()
                        .await;
                    if let Err(payload) = outcome {
                        if let Some(message) = panic_message(payload.as_ref()) {
                            tracing::error!(connection_id = %connection_id, panic = %message, "Connection handler panicked");
                        }
                    }
                });
            }
            tracing::debug!(group = listener.group(), "Catch-all handler stopped");
        })
    }

    /// Catch-all group served by a server that runs its own accept loop,
    /// such as `axum::serve`. `serve` gets the group's listener and runs on
    /// its own task. Register it last.
    pub fn match_and_go_serve_with<F, Fut>(&self, serve: F) -> JoinHandle<Fut::Output>
    where
        F: FnOnce(SubListener) -> Fut,
        Fut: Future + Send + 'static,
        Fut::Output: Send + 'static,
    {
        let listener = self.match_group([matching::any()]);
        tracing::debug!(group = listener.group(), "Catch-all server attached");
        tokio::spawn(serve(listener))
    }

    /// Replace the error-continuation policy.
    ///
    /// The policy sees unmatched connections and accept failures; returning
    /// `false` stops serving (for `NotMatched`: closes the multiplexer).
    pub fn handle_error<F>(&self, policy: F)
    where
        F: Fn(&MuxError) -> bool + Send + Sync + 'static,
    {
        *self.inner.policy.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::new(policy);
    }

    /// Deadline for matchers to reach a verdict. `Duration::ZERO` disables it.
    pub fn set_read_timeout(&self, timeout: Duration) {
        let timeout = (!timeout.is_zero()).then_some(timeout);
        *self.inner.read_timeout.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        *self.inner.read_timeout.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Addresses of every listener currently being served.
    pub fn listener_addrs(&self) -> Vec<SocketAddr> {
        self.inner.tracker.listener_addrs()
    }

    /// Connections accepted and not yet closed, hijacked ones included.
    pub fn active_connections(&self) -> usize {
        self.inner.tracker.active_count()
    }

    /// Scope cancelled when this multiplexer is closed.
    pub fn scope(&self) -> &Shutdown {
        &self.inner.root
    }

    pub fn is_closed(&self) -> bool {
        self.inner.root.is_triggered()
    }

    fn groups(&self) -> Groups {
        Arc::clone(&self.inner.groups.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    fn policy(&self) -> ErrorPolicy {
        Arc::clone(&self.inner.policy.read().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Ask the policy whether to keep going. A panicking policy counts as yes.
    fn report(&self, err: &MuxError) -> bool {
        let policy = self.policy();
        match std::panic::catch_unwind(AssertUnwindSafe(|| policy(err))) {
            Ok(keep_going) => keep_going,
            Err(payload) => {
                if let Some(message) = panic_message(payload.as_ref()) {
                    tracing::error!(error = %err, panic = %message, "Error policy panicked");
                }
                true
            }
        }
    }

    /// Accept from `listener` until acceptance stops.
    ///
    /// Returns `ServerClosed` once the multiplexer is closed or shutting
    /// down, or the accept error the policy refused to continue after.
    pub async fn serve<L>(&self, listener: L) -> Result<(), MuxError>
    where
        L: RawListener,
    {
        if self.inner.accepting.is_triggered() {
            return Err(MuxError::ServerClosed);
        }
        let addr = listener.local_addr().map_err(MuxError::Accept)?;
        let stop = self.inner.accepting.child();
        let _registration = self.inner.tracker.register_listener(addr, stop.clone());
        tracing::info!(address = %addr, "Multiplexer serving");

        let mut backoff = Backoff::new(self.inner.backoff_base, self.inner.backoff_max);
        loop {
            let accepted = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(incoming) => {
                    backoff.reset();
                    metrics::counter!("mux_connections_accepted_total").increment(1);
                    self.spawn_connection(incoming);
                }
                Err(e) => {
                    metrics::counter!("mux_accept_errors_total").increment(1);
                    let err = MuxError::Accept(e);
                    if !self.report(&err) {
                        tracing::error!(address = %addr, error = %err, "Accept failed; serving stopped");
                        return Err(err);
                    }
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        address = %addr,
                        error = %err,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        "Accept failed; retrying"
                    );
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        tracing::info!(address = %addr, "Multiplexer stopped accepting");
        Err(MuxError::ServerClosed)
    }

    /// Bind a TCP listener on `addr` and [`serve`](Self::serve) it.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<(), MuxError> {
        let listener = bind(addr).await?;
        self.serve(listener).await
    }

    /// Like [`listen_and_serve`](Self::listen_and_serve), terminating TLS
    /// with the PEM certificate chain and key before sniffing.
    pub async fn listen_and_serve_tls(
        &self,
        addr: &str,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), MuxError> {
        let config = load_tls_config(cert_path.as_ref(), key_path.as_ref())
            .await
            .map_err(MuxError::Tls)?;
        self.listen_and_serve_tls_with_config(addr, config).await
    }

    /// TLS variant taking a prepared rustls configuration. "http/1.1" is
    /// added to the advertised ALPN protocols if missing.
    pub async fn listen_and_serve_tls_with_config(
        &self,
        addr: &str,
        config: Arc<rustls::ServerConfig>,
    ) -> Result<(), MuxError> {
        let listener = bind(addr).await?;
        self.serve(TlsListener::new(listener, with_default_alpn(config))).await
    }

    fn spawn_connection(&self, incoming: Incoming) {
        let mux = self.clone();
        tokio::spawn(async move {
            let peer_addr = incoming.peer_addr();
            let outcome = AssertUnwindSafe(mux.handle_connection(incoming)).catch_unwind().await;
            if let Err(payload) = outcome {
                if let Some(message) = panic_message(payload.as_ref()) {
                    tracing::error!(peer_addr = %peer_addr, panic = %message, "Connection task panicked");
                }
            }
        });
    }

    async fn handle_connection(&self, incoming: Incoming) {
        let peer_addr = incoming.peer_addr();
        let local_addr = incoming.local_addr();
        let close = CloseSignal::new();
        let guard = self.inner.tracker.track(peer_addr, Arc::clone(&close));
        let connection_id = guard.id();
        tracing::debug!(connection_id = %connection_id, peer_addr = %peer_addr, "Connection accepted");

        let read_timeout = self.read_timeout();
        let setup = async {
            match read_timeout {
                Some(limit) => match tokio::time::timeout(limit, incoming.establish()).await {
                    Ok(result) => result,
                    Err(_) => Err(std::io::ErrorKind::TimedOut.into()),
                },
                None => incoming.establish().await,
            }
        };
        let raw = tokio::select! {
            result = setup => result,
            _ = close.closed() => {
                tracing::debug!(connection_id = %connection_id, "Connection closed during setup");
                return;
            }
        };
        let raw = match raw {
            Ok(raw) => raw,
            Err(e) => {
                tracing::debug!(connection_id = %connection_id, peer_addr = %peer_addr, error = %e, "Connection setup failed");
                return;
            }
        };

        if self.inner.accepting.is_triggered() {
            tracing::debug!(connection_id = %connection_id, "Multiplexer stopping; closing new connection");
            return;
        }

        let mut conn = ReplayConn::new(raw, peer_addr, local_addr, close);
        guard.record().set_state(ConnState::Active);
        if let Some(limit) = read_timeout {
            conn.set_read_timeout(limit);
        }

        for group in self.groups().iter() {
            if !group.matches(&mut conn).await {
                continue;
            }
            conn.set_read_deadline(None);
            metrics::counter!("mux_connections_matched_total", "group" => group.index().to_string()).increment(1);
            tracing::debug!(
                connection_id = %connection_id,
                group = group.index(),
                sniffed = conn.buffered().len(),
                "Connection matched"
            );

            let conn = MuxConn::new(conn, guard);
            if let Err(e) = group.target().notify(&self.inner.root, conn).await {
                tracing::debug!(connection_id = %connection_id, group = group.index(), error = %e, "Handoff failed");
            }
            return;
        }

        guard.record().set_state(ConnState::Idle);
        metrics::counter!("mux_connections_unmatched_total").increment(1);
        let keep_going = self.report(&MuxError::NotMatched {
            id: connection_id,
            peer_addr,
        });
        drop(conn);
        drop(guard);

        if !keep_going {
            tracing::warn!(connection_id = %connection_id, "Error policy rejected unmatched connection; closing multiplexer");
            self.close().await;
        }
    }

    /// Stop immediately: stop accepting, close every sub-listener and
    /// force-close every tracked listener and connection.
    ///
    /// Runs on its own when the parent scope is cancelled. Later calls do nothing.
    pub async fn close(&self) {
        self.inner.root.trigger();
        if self.inner.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let listeners = self.inner.tracker.close_listeners();
        let connections = self.inner.tracker.close_connections();
        for group in self.groups().iter() {
            group.target().close().await;
        }
        tracing::info!(listeners, connections, "Multiplexer closed");
    }

    /// Stop accepting, then wait for busy connections to finish.
    ///
    /// Idle connections (and those never sniffed within the configured
    /// grace) are closed on every poll. Fails with `ShutdownTimeout` if
    /// connections are still busy after `grace`; the multiplexer then stays
    /// in the shutting-down state and `close` can finish the job.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), MuxError> {
        self.inner.accepting.trigger();
        let listeners = self.inner.tracker.close_listeners();
        tracing::info!(listeners, grace_ms = grace.as_millis() as u64, "Graceful shutdown started");

        let deadline = Instant::now() + grace;
        loop {
            if self.inner.tracker.close_idle(self.inner.new_idle_grace) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                let remaining = self.inner.tracker.active_count();
                tracing::warn!(remaining, "Graceful shutdown timed out");
                return Err(MuxError::ShutdownTimeout { remaining });
            }
            tokio::time::sleep(self.inner.poll_interval.min(deadline - now)).await;
        }

        self.inner.root.trigger();
        for group in self.groups().iter() {
            group.target().close().await;
        }
        tracing::info!("Graceful shutdown complete");
        Ok(())
    }
}

async fn bind(addr: &str) -> Result<TcpListener, MuxError> {
    TcpListener::bind(addr).await.map_err(|source| MuxError::Bind {
        addr: addr.to_string(),
        source,
    })
}
