//! Exponential-delay retry for fallible async operations.
//!
//! The wait before retry `n` (1-indexed) is `base_delay × multiplier^(n-1)`.
//! There is no jitter: a single client has no competing peers to spread out.
//!
//! ```text
//! attempt 1 ──fail──► on_backoff(wait=1s) ──sleep──► attempt 2 ──fail──►
//! on_backoff(wait=2s) ──sleep──► attempt 3 ──ok──► Ok(value)
//! ```
//!
//! Only errors whose [`Transient::is_transient`] returns `true` are retried.
//! Once `max_attempts` invocations have failed, the last error is returned
//! unchanged; deciding whether that is fatal is the caller's business.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// Classifies errors the retry loop may retry.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Wait before the second attempt.
    pub base_delay: Duration,
    /// Growth factor applied per failed attempt.
    pub multiplier: u32,
    /// Total invocations, including the first one.
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Doubling policy starting at `base_delay`.
    pub fn exponential(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            multiplier: 2,
            max_attempts,
        }
    }

    /// Wait after failed attempt `attempt` (1-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1);
        let factor = self.multiplier.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1), 10)
    }
}

/// Details of one scheduled retry, handed to the `on_backoff` hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffAttempt {
    /// The attempt that just failed (1-indexed).
    pub attempt: u32,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    /// How long the controller will sleep before the next attempt.
    pub wait: Duration,
    /// Name of the wrapped operation.
    pub target: String,
    /// Rendered arguments of the wrapped operation.
    pub args: String,
    /// Display form of the error that triggered the retry.
    pub error: String,
}

/// A retry loop bound to a policy and an operation identity.
#[derive(Debug, Clone)]
pub struct Retry {
    policy: BackoffPolicy,
    target: String,
    args: String,
}

impl Retry {
    /// Retry under `policy`; `target` names the operation in backoff reports.
    pub fn new(policy: BackoffPolicy, target: impl Into<String>) -> Self {
        Self {
            policy,
            target: target.into(),
            args: String::new(),
        }
    }

    /// Attach a rendering of the operation's arguments for observability.
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = args.into();
        self
    }

    /// The policy delays and attempt limits come from.
    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails permanently, or exhausts the policy.
    pub async fn run<T, E, F, Fut, H>(&self, op: F, on_backoff: H) -> Result<T, E>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(&BackoffAttempt),
    {
        match self.drive(op, on_backoff, None).await {
            Some(result) => result,
            None => unreachable!("retry without a cancel signal cannot be cancelled"),
        }
    }

    /// Like [`Retry::run`], but abandons a pending backoff wait as soon as
    /// `cancel` turns `true` (or its sender is dropped).
    ///
    /// Returns `None` when cancelled. An attempt already in flight is never
    /// interrupted; cancellation only takes effect between attempts.
    pub async fn run_until_cancelled<T, E, F, Fut, H>(
        &self,
        op: F,
        on_backoff: H,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<Result<T, E>>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(&BackoffAttempt),
    {
        self.drive(op, on_backoff, Some(cancel)).await
    }

    async fn drive<T, E, F, Fut, H>(
        &self,
        mut op: F,
        mut on_backoff: H,
        mut cancel: Option<&mut watch::Receiver<bool>>,
    ) -> Option<Result<T, E>>
    where
        E: Transient + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        H: FnMut(&BackoffAttempt),
    {
        let started = Instant::now();
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            let err = match op().await {
                Ok(value) => return Some(Ok(value)),
                Err(err) => err,
            };
            if !err.is_transient() || attempt >= max_attempts {
                return Some(Err(err));
            }

            let wait = self.policy.delay(attempt);
            on_backoff(&BackoffAttempt {
                attempt,
                elapsed: started.elapsed(),
                wait,
                target: self.target.clone(),
                args: self.args.clone(),
                error: err.to_string(),
            });

            match cancel.as_deref_mut() {
                Some(rx) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = rx.wait_for(|stop| *stop) => return None,
                    }
                }
                None => tokio::time::sleep(wait).await,
            }
            attempt += 1;
        }
    }
}
