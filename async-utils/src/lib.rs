//! Cancellation helpers shared by the scheduler loop and the upload workers.
//!
//! Everything here races some wait against a `CancellationToken` so that a
//! shutdown request is observed promptly no matter what the caller is
//! blocked on.

use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Error returned when a wait is interrupted by the token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelErr {
    Cancelled,
}

impl std::fmt::Display for CancelErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("operation cancelled")
    }
}

impl std::error::Error for CancelErr {}

/// Outcome of [`deadline_or_cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bounded<T> {
    Completed(T),
    TimedOut,
    Cancelled,
}

/// Extension trait for making futures cancellable.
#[async_trait]
pub trait OrCancelExt: Sized {
    type Output;

    /// Race this future against the token.
    ///
    /// Returns `Err(CancelErr::Cancelled)` if the token fires first. An
    /// already-cancelled token wins even if the future is immediately ready.
    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr>;
}

#[async_trait]
impl<F> OrCancelExt for F
where
    F: Future + Send,
    F::Output: Send,
{
    type Output = F::Output;

    async fn or_cancel(self, token: &CancellationToken) -> Result<Self::Output, CancelErr> {
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(CancelErr::Cancelled),
            res = self => Ok(res),
        }
    }
}

/// Sleep for `duration` unless the token fires first.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> Result<(), CancelErr> {
    if token.is_cancelled() {
        return Err(CancelErr::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::time::sleep(duration).or_cancel(token).await
}

/// Sleep until `deadline`, waking at least every `slice` to run `on_slice`.
///
/// `on_slice` is invoked after every partial sleep; returning `false` stops
/// the wait early with `Ok(false)`. Completes with `Ok(true)` once the
/// deadline is reached. The token is checked before every slice, which
/// bounds the time between a cancel request and the return to one slice.
pub async fn sleep_until_sliced<F>(
    deadline: Instant,
    slice: Duration,
    token: &CancellationToken,
    mut on_slice: F,
) -> Result<bool, CancelErr>
where
    F: FnMut() -> bool + Send,
{
    let slice = if slice.is_zero() {
        Duration::from_millis(1)
    } else {
        slice
    };
    loop {
        if token.is_cancelled() {
            return Err(CancelErr::Cancelled);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(true);
        }
        let step = (deadline - now).min(slice);
        sleep_or_cancel(step, token).await?;
        if !on_slice() {
            return Ok(false);
        }
    }
}

/// Run `fut` with a per-call time bound, also giving up on cancellation.
pub async fn deadline_or_cancel<F>(
    fut: F,
    limit: Duration,
    token: &CancellationToken,
) -> Bounded<F::Output>
where
    F: Future + Send,
    F::Output: Send,
{
    match tokio::time::timeout(limit, fut).or_cancel(token).await {
        Ok(Ok(value)) => Bounded::Completed(value),
        Ok(Err(_elapsed)) => Bounded::TimedOut,
        Err(CancelErr::Cancelled) => Bounded::Cancelled,
    }
}
