//! Drain bookkeeping for the request server.
//!
//! The accept loop and every accepted connection hold a [`DrainGuard`].
//! [`Drain::drain`] stops the accept loop and waits until every guard is
//! gone, or cancels whatever is left once the deadline passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Drain deadline of {deadline:?} passed with {remaining} task(s) still running")]
pub struct DrainTimeout {
    pub remaining: usize,
    pub deadline: Duration,
}

#[derive(Clone, Default)]
pub struct Drain {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Cancelled when the accept loop must stop.
    stop: CancellationToken,
    /// Cancelled when the deadline passes; connections still running abort.
    force: CancellationToken,
    active: AtomicUsize,
    idle: Notify,
}

/// Keeps the drain waiting while alive.
pub struct DrainGuard {
    inner: Arc<Inner>,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        let prev = self.inner.active.fetch_sub(1, Ordering::SeqCst);
        if prev == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

impl Drain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop_token(&self) -> CancellationToken {
        self.inner.stop.clone()
    }

    pub fn force_token(&self) -> CancellationToken {
        self.inner.force.clone()
    }

    pub fn guard(&self) -> DrainGuard {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn active(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Stops accepting, then waits for every guard to drop. Never takes
    /// longer than `deadline`; on expiry the force token is cancelled and
    /// the call returns immediately.
    pub async fn drain(&self, deadline: Duration) -> Result<(), DrainTimeout> {
        self.inner.stop.cancel();

        let active = self.active();
        if active == 0 {
            info!("Nothing in flight, drain complete");
            return Ok(());
        }

        info!(
            active,
            deadline_secs = deadline.as_secs_f64(),
            "Draining in-flight connections"
        );

        match tokio::time::timeout(deadline, self.wait_idle()).await {
            Ok(()) => {
                info!("All connections drained cleanly");
                Ok(())
            }
            Err(_) => {
                let remaining = self.active();
                self.inner.force.cancel();
                warn!(remaining, "Drain deadline expired, closing remaining connections");
                Err(DrainTimeout {
                    remaining,
                    deadline,
                })
            }
        }
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.active() == 0 {
                return;
            }
            notified.await;
        }
    }
}
