//! Shutdown coordination.
//!
//! A [`Shutdown`] is a cancellable scope. Scopes form a tree: cancelling a
//! scope cancels every scope derived from it with [`Shutdown::child`], while
//! cancelling a child leaves the parent untouched.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;

/// Cancellable scope shared by long-running tasks.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// Watch channel carrying the cancelled flag of this scope.
    tx: Arc<watch::Sender<bool>>,
    /// Scope this one was derived from.
    parent: Option<Box<Shutdown>>,
}

impl Shutdown {
    /// Create a new root scope.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: None,
        }
    }

    /// Derive a scope that is cancelled together with `self`.
    pub fn child(&self) -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            parent: Some(Box::new(self.clone())),
        }
    }

    /// Cancel this scope and everything derived from it.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    /// Non-blocking check.
    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow() || self.parent.as_ref().is_some_and(|p| p.is_triggered())
    }

    /// Resolves once this scope or any ancestor is cancelled.
    pub fn cancelled(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let mut rx = self.tx.subscribe();
            match &self.parent {
                Some(parent) => {
                    tokio::select! {
                        _ = rx.wait_for(|cancelled| *cancelled) => {}
                        _ = parent.cancelled() => {}
                    }
                }
                None => {
                    // The sender lives in `self`, so the channel cannot close here.
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                }
            }
        })
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
