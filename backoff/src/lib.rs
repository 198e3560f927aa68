//! Retry with backoff for async operations.
//!
//! An [`Operation`] produces a fresh future on every attempt. When an attempt fails, the
//! [`Condition`] decides whether the error is worth another try, and the backoff [`strategy`]
//! decides how long to cool off before it. Running out of backoff ends the retries with the last
//! error.
//!
//! ```rust
//! use backoff::retry::Retry;
//! use backoff::strategy::fixed;
//!
//! async fn put_object() -> Result<u64, ()> {
//!     Ok(42)
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let interval = fixed::Interval::from_millis(1).take(3);
//!     let result = Retry::new(interval, put_object, |_: &(), _attempt: u16| true).await;
//!     assert_eq!(result, Ok(42));
//! }
//! ```

use std::future::Future;

/// Backoff strategies. Each one is an iterator of [`Duration`](std::time::Duration)s, so the
/// number of retries can be bounded either by the strategy itself or with
/// [`take`](std::iter::Iterator::take).
pub mod strategy;

/// The [`Retry`](retry::Retry) future.
pub mod retry;

/// Decides whether a failed attempt should be retried. `attempt` is the 1-based number of the
/// attempt that just failed.
pub trait Condition<E> {
    fn can_retry(&self, error: &E, attempt: u16) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E, u16) -> bool,
{
    fn can_retry(&self, error: &E, attempt: u16) -> bool {
        self(error, attempt)
    }
}

/// Anything that returns a new future for every attempt.
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    #[must_use = "futures do nothing unless you `.await` or poll them"]
    fn run(&mut self) -> Self::Future;
}

impl<T, E, R, F> Operation for F
where
    R: Future<Output = Result<T, E>>,
    F: FnMut() -> R,
{
    type Item = T;
    type Error = E;
    type Future = R;

    fn run(&mut self) -> Self::Future {
        self()
    }
}
