//! Retry policy for processor calls
//!
//! Only transient failures are retried. The delay before retry `i` is
//! `200ms * 2^i` plus up to 100ms of jitter, and every wait races the
//! caller's [`CancelSignal`].

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;

use crate::error::BillingResult;
use crate::gateway::ProcessorError;

/// Default number of attempts for a single processor call
pub const DEFAULT_ATTEMPTS: u32 = 3;

/// Retries of a whole processor-mutation-plus-persist unit
pub const UNIT_RETRIES: u32 = 2;

const MAX_JITTER_MS: u64 = 100;

/// Retry settings read from the environment
#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub attempts: u32,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
        }
    }
}

impl RetrySettings {
    pub fn from_env() -> Self {
        let attempts = std::env::var("PROCESSOR_RETRY_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_ATTEMPTS);
        Self {
            attempts: attempts.max(1),
        }
    }
}

/// Cooperative cancellation: an explicit trigger, a deadline, or both.
#[derive(Debug, Clone, Default)]
pub struct CancelSignal {
    flag: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Trigger side of a [`CancelSignal`]
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        Self::default()
    }

    pub fn pair() -> (CancelHandle, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (
            CancelHandle { tx },
            CancelSignal {
                flag: Some(rx),
                deadline: None,
            },
        )
    }

    /// A signal that fires once `timeout` has elapsed
    pub fn deadline(timeout: Duration) -> Self {
        Self {
            flag: None,
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        let flagged = self.flag.as_ref().is_some_and(|rx| *rx.borrow());
        let expired = self.deadline.is_some_and(|d| Instant::now() >= d);
        flagged || expired
    }

    /// Resolves when the signal fires. Pending forever for [`CancelSignal::never`].
    pub async fn cancelled(&self) {
        let flag = async {
            match &self.flag {
                Some(rx) => {
                    let mut rx = rx.clone();
                    loop {
                        if *rx.borrow_and_update() {
                            return;
                        }
                        // Handle dropped without cancelling
                        if rx.changed().await.is_err() {
                            std::future::pending::<()>().await;
                        }
                    }
                }
                None => std::future::pending::<()>().await,
            }
        };
        let timer = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = flag => {}
            _ = timer => {}
        }
    }
}

/// Errors the retry loop knows how to classify
pub trait Retryable: std::fmt::Display {
    fn is_transient(&self) -> bool;

    /// Error to report when cancellation wins before any attempt ran
    fn cancelled(operation: &'static str) -> Self;
}

impl Retryable for ProcessorError {
    fn is_transient(&self) -> bool {
        ProcessorError::is_transient(self)
    }

    fn cancelled(operation: &'static str) -> Self {
        ProcessorError::cancelled(operation)
    }
}

/// Base delays: 200ms, 400ms, 800ms, ...
pub fn base_delays() -> ExponentialBackoff {
    ExponentialBackoff::from_millis(2).factor(100)
}

fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=MAX_JITTER_MS))
}

/// Run `op` up to `attempts` times (at least once), retrying transient failures.
pub async fn with_retry<T, E, F, Fut>(
    operation: &'static str,
    attempts: u32,
    cancel: &CancelSignal,
    mut op: F,
) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = attempts.max(1);
    let mut delays = base_delays();
    let mut last_error: Option<E> = None;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            break;
        }

        let error = match op().await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if !error.is_transient() || attempt + 1 == attempts {
            return Err(error);
        }

        let delay = delays.next().unwrap_or(Duration::ZERO) + jitter();
        tracing::warn!(
            operation = operation,
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying processor call after transient error"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(error),
        }
        last_error = Some(error);
    }

    Err(last_error.unwrap_or_else(|| E::cancelled(operation)))
}

/// Repeat a processor-mutation-plus-persist unit while it fails with a
/// repeatable error, up to `retries` extra times. The unit must be safe to
/// replay, which idempotency keys on the mutation guarantee.
pub async fn with_unit_retries<T, F, Fut>(operation: &'static str, retries: u32, mut op: F) -> BillingResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BillingResult<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_repeatable() && attempt < retries => {
                attempt += 1;
                tracing::warn!(
                    operation = operation,
                    attempt = attempt,
                    error = %error,
                    "Repeating unit of work after recoverable failure"
                );
            }
            Err(error) => return Err(error),
        }
    }
}
