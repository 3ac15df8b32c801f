//! A cooperative cancellation token shared by every task in a long-running operation.
//!
//! Built over [`tokio::sync::watch`] rather than pulling in `tokio_util` for
//! a single type - `tokio` is already part of the stack.

use std::time::Duration;

use tokio::sync::watch;

use crate::error::VaultError;

/// A handle that can be cloned freely; cancelling any clone cancels them all.
#[derive(Clone)]
pub struct CancellationToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    /// Signals cancellation to every holder of this token (and its clones).
    pub fn cancel(&self) {
        // Only fails if every receiver (including our own) is gone, which
        // can't happen since we hold one.
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once this token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                // Sender dropped without ever cancelling - nothing more will happen.
                return;
            }
        }
    }

    /// Bails with [`VaultError::Cancelled`] if this token has been cancelled.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            Err(VaultError::Cancelled.into())
        } else {
            Ok(())
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Sleeps for `dur`, returning early if cancelled first. Used by background
/// tasks (lock refresh) that need to wake up either periodically or on demand.
pub async fn sleep_or_cancelled(dur: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => false,
        _ = token.cancelled() => true,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn cancel_wakes_up_waiters() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());

        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        token.cancel();
        handle.await.unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn check_fails_once_cancelled() {
        let token = CancellationToken::new();
        assert!(token.check().is_ok());
        token.cancel();
        assert!(token.check().is_err());
    }
}
