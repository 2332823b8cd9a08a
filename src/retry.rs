// -*- mode: rust; -*-
//
// This file is part of pinproof.
// See LICENSE for licensing information.

//! Bounded retries with exponential backoff, and cancellation.
//!
//! Only `NetworkFailure` is retried.  Every wait, in flight or between
//! attempts, races the caller's [`CancelHandle`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::warn;

use crate::errors::{Error, Result};

/// Retry bounds for calls to the issuing authority and verifier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempts made before the failure is surfaced, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound of any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy { max_attempts: 3, base_delay_ms: 200, max_delay_ms: 5_000 }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt`, counting from 1:
    /// `base * 2^(attempt - 1)`, capped at `max_delay_ms`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt.saturating_sub(1)).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Cancels pending network operations of one session.
///
/// Clones share the same cancellation state.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        CancelHandle::new()
    }
}

impl CancelHandle {
    /// A handle that has not been cancelled.
    pub fn new() -> CancelHandle {
        let (tx, rx) = watch::channel(false);
        CancelHandle { tx: Arc::new(tx), rx }
    }

    /// Cancel every operation watching this handle.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`CancelHandle::cancel`] was called.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the handle is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless cancelled first.
    pub async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        if self.is_cancelled() {
            return Err(Error::CancelledOperation);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(Error::CancelledOperation),
            r = fut => r,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, runs out
/// of attempts, or `cancel` fires.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, cancel: &CancelHandle, operation: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match cancel.guard(op()).await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = policy.delay_for(attempt);
                warn!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying");
                cancel.guard(async { tokio::time::sleep(delay).await; Ok(()) }).await?;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delays_double_up_to_the_cap() {
        let policy = RetryPolicy { max_attempts: 10, base_delay_ms: 100, max_delay_ms: 1_000 };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(200), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let out = retry(&RetryPolicy::default(), &CancelHandle::new(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::NetworkFailure("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let calls = AtomicU32::new(0);
        let out: Result<()> = retry(&RetryPolicy::default(), &CancelHandle::new(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::NetworkFailure("down".into()))
        })
        .await;
        assert_eq!(out, Err(Error::NetworkFailure("down".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: Result<()> = retry(&RetryPolicy::default(), &CancelHandle::new(), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidActivationToken)
        })
        .await;
        assert_eq!(out, Err(Error::InvalidActivationToken));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_a_pending_call() {
        let cancel = CancelHandle::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let out: Result<()> = retry(&RetryPolicy::default(), &cancel, "test", || async {
            std::future::pending::<Result<()>>().await
        })
        .await;
        assert_eq!(out, Err(Error::CancelledOperation));
        assert!(cancel.is_cancelled());
    }
}
