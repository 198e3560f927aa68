use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};

use crate::{Condition, Operation};

/// The retry state machine alternates between running the operation and sleeping off the
/// backoff delay:
/// ```no_rust
/// Running --Ok--> done
///    |
///    +--Err--> condition says no ---------------> done(Err)
///    |
///    +--Err--> backoff exhausted ---------------> done(Err)
///    |
///    +--Err--> Sleeping(delay) --elapsed--> Running
/// ```
#[pin_project(project = RetryStateProj)]
enum RetryState<O>
where
    O: Operation,
{
    Running(#[pin] O::Future),
    Sleeping(#[pin] Sleep),
}

/// Runs an [`Operation`] until it succeeds, the [`Condition`] rejects an error, or the backoff
/// runs out.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    state: RetryState<O>,
    backoff: I,
    operation: O,
    condition: C,
    attempt: u16,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<II: IntoIterator<IntoIter = I, Item = I::Item>>(
        backoff: II,
        mut operation: O,
        condition: C,
    ) -> Self {
        Self {
            state: RetryState::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            attempt: 1,
        }
    }

    fn cool_off(mut self: Pin<&mut Self>, err: O::Error) -> Result<(), O::Error> {
        let Some(delay) = self.as_mut().project().backoff.next() else {
            return Err(err);
        };
        self.as_mut()
            .project()
            .state
            .set(RetryState::Sleeping(sleep_until(Instant::now() + delay)));
        Ok(())
    }

    fn reattempt(mut self: Pin<&mut Self>) {
        let this = self.as_mut().project();
        *this.attempt = this.attempt.saturating_add(1);
        let future = this.operation.run();
        self.as_mut().project().state.set(RetryState::Running(future));
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.as_mut().project().state.project() {
            RetryStateProj::Running(op) => match op.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(Ok(item)) => Poll::Ready(Ok(item)),
                Poll::Ready(Err(e)) => {
                    if !self.condition.can_retry(&e, self.attempt) {
                        return Poll::Ready(Err(e));
                    }
                    match self.as_mut().cool_off(e) {
                        Ok(()) => self.poll(cx),
                        Err(e) => Poll::Ready(Err(e)),
                    }
                }
            },
            RetryStateProj::Sleeping(sleep) => match sleep.poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(()) => {
                    self.as_mut().reattempt();
                    self.poll(cx)
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::strategy::{exponential::Exponential, fixed};

    #[tokio::test]
    async fn succeeds_without_retry() {
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            || future::ready(Ok::<_, ()>("stored")),
            |_: &(), _| true,
        )
        .await;
        assert_eq!(result, Ok("stored"));
    }

    #[tokio::test]
    async fn non_retryable_error_returns_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = Retry::new(
            fixed::Interval::from_millis(1),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), &str>("permission denied"))
            },
            |_: &&str, _| false,
        )
        .await;
        assert_eq!(result, Err("permission denied"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_errors_then_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let result = Retry::new(
            fixed::Interval::from_millis(1).take(5),
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                future::ready(if n < 2 { Err("throttled") } else { Ok(n) })
            },
            |_: &&str, _| true,
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_ceiling_bounds_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let attempts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&attempts);

        let result = Retry::new(
            Exponential::from_millis(1, 4, 2.0).with_max_attempts(3),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                future::ready(Err::<(), _>("unavailable"))
            },
            move |_: &&str, attempt| {
                seen.lock().unwrap().push(attempt);
                true
            },
        )
        .await;

        assert_eq!(result, Err("unavailable"));
        // first run plus three retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(*attempts.lock().unwrap(), vec![1, 2, 3, 4]);
    }
}
