//! Shared application state and the process-wide readiness signal.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tokio::sync::watch;

use choreo_core::Config;
use choreo_store::IngestionStore;

use crate::bus::InProcessBus;
use crate::engine::IngestionEngine;

pub struct AppState {
    pub config: Config,
    pub pool: PgPool,
    pub store: IngestionStore,
    pub engine: Arc<IngestionEngine>,
    pub bus: Arc<InProcessBus>,
}

/// One-shot readiness signal: resolves exactly once, when the last
/// registered provider finishes its first connect pass.
pub struct ReadySignal {
    pending: AtomicUsize,
    tx: watch::Sender<bool>,
}

impl ReadySignal {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            pending: AtomicUsize::new(0),
            tx,
        }
    }

    /// Count one provider that still has to connect.
    pub fn register(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark one provider connected; resolves the signal when it was the
    /// last one pending.
    pub fn mark_connected(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _ = self.tx.send(true);
        }
    }

    /// Resolve immediately when nothing was ever registered.
    pub fn resolve_if_idle(&self) {
        if self.pending.load(Ordering::SeqCst) == 0 {
            let _ = self.tx.send(true);
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.tx.borrow()
    }

    /// Block until every registered provider has connected.
    pub async fn wait_ready(&self) {
        let mut rx = self.tx.subscribe();
        if *rx.borrow_and_update() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

impl Default for ReadySignal {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ─────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_signal_resolves_after_last_provider() {
        let signal = Arc::new(ReadySignal::new());
        signal.register();
        signal.register();

        assert!(!signal.is_ready());
        signal.mark_connected();
        assert!(!signal.is_ready());

        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait_ready().await })
        };
        signal.mark_connected();

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_ready should resolve")
            .unwrap();
        assert!(signal.is_ready());
    }

    #[tokio::test]
    async fn test_ready_signal_idle_resolution() {
        let signal = ReadySignal::new();
        signal.resolve_if_idle();
        assert!(signal.is_ready());
        // Resolution is sticky.
        tokio::time::timeout(Duration::from_millis(100), signal.wait_ready())
            .await
            .expect("already-ready signal should not block");
    }
}
