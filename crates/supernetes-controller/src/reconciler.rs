//! Generic reconciliation loop framework
//!
//! One loop per reconciler, single-threaded cooperative within that loop.
//! One iteration is one `reconcile` call; after it returns, a timer of the
//! configured interval elapses before the next call. Cancellation mid-
//! iteration terminates the iteration at its next suspension point, and
//! cancellation-derived errors are swallowed silently. Other errors are
//! logged; the next tick retries.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use supernetes_common::{Error, Result};

/// A single reconciliation pass
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Converge observed external state with desired state once. The token
    /// is cancelled when the loop is stopping; implementations should pass
    /// it down to any long-lived work they spawn.
    async fn reconcile(&self, token: &CancellationToken) -> Result<()>;
}

/// Timer-driven reconciliation loop with idempotent start and draining stop
pub struct Reconciler {
    name: &'static str,
    interval: Duration,
    target: Arc<dyn Reconcile>,
    parent: CancellationToken,
    state: tokio::sync::Mutex<LoopState>,
}

#[derive(Default)]
struct LoopState {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Create a reconciler driving the given target every `interval`
    pub fn new(
        parent: CancellationToken,
        name: &'static str,
        interval: Duration,
        target: Arc<dyn Reconcile>,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::config("must specify reconciliation interval"));
        }

        Ok(Self {
            name,
            interval,
            target,
            parent,
            state: tokio::sync::Mutex::new(LoopState::default()),
        })
    }

    /// Start the reconciliation loop. No-op if already running.
    pub async fn start(&self) {
        let mut state = self.state.lock().await;

        if let Some(handle) = &state.handle {
            if !handle.is_finished() {
                return; // No-op if already running
            }
        }

        let token = self.parent.child_token();
        let name = self.name;
        let interval = self.interval;
        let target = self.target.clone();

        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            debug!(reconciler = name, "starting reconciliation loop");

            loop {
                debug!(reconciler = name, "performing reconciliation");
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    result = target.reconcile(&loop_token) => match result {
                        Ok(()) => debug!(reconciler = name, "reconciliation finished"),
                        Err(e) if e.is_cancellation() => {}
                        Err(e) => error!(reconciler = name, error = %e, "reconciliation failed"),
                    },
                }

                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }

            debug!(reconciler = name, "stopped reconciliation loop");
        });

        state.token = Some(token);
        state.handle = Some(handle);
    }

    /// Stop the reconciliation loop and wait for it to drain. Safe to call
    /// from any task, also when the loop was never started.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;

        if let Some(token) = state.token.take() {
            token.cancel();
        }

        if let Some(handle) = state.handle.take() {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        calls: AtomicUsize,
        block: bool,
    }

    #[async_trait]
    impl Reconcile for Counter {
        async fn reconcile(&self, token: &CancellationToken) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.block {
                token.cancelled().await;
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_ticks_on_interval() {
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            block: false,
        });

        let reconciler = Reconciler::new(
            CancellationToken::new(),
            "test",
            Duration::from_secs(10),
            counter.clone(),
        )
        .unwrap();

        reconciler.start().await;
        tokio::time::sleep(Duration::from_secs(25)).await;
        reconciler.stop().await;

        // Immediate first call plus two interval ticks
        assert_eq!(counter.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            block: true,
        });

        let reconciler = Reconciler::new(
            CancellationToken::new(),
            "test",
            Duration::from_secs(600),
            counter.clone(),
        )
        .unwrap();

        reconciler.start().await;
        reconciler.start().await;
        reconciler.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        reconciler.stop().await;

        // A single loop performed a single (blocked) iteration
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_cancels_inflight_iteration() {
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            block: true,
        });

        let reconciler = Reconciler::new(
            CancellationToken::new(),
            "test",
            Duration::from_secs(600),
            counter.clone(),
        )
        .unwrap();

        reconciler.start().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The iteration is blocked on the token; stop must drain promptly
        tokio::time::timeout(Duration::from_secs(1), reconciler.stop())
            .await
            .expect("stop should drain the loop");

        // Stop with no loop running is also fine
        reconciler.stop().await;
    }

    #[tokio::test]
    async fn test_zero_interval_is_rejected() {
        let counter = Arc::new(Counter {
            calls: AtomicUsize::new(0),
            block: false,
        });

        assert!(
            Reconciler::new(CancellationToken::new(), "test", Duration::ZERO, counter).is_err()
        );
    }
}
