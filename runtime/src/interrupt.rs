//! Wake a suspended task early with a reason.
//!
//! A task that owns an [Interruptible] can suspend on [Interruptible::wait] (an idle wait with
//! no deadline) or on [sleep] (a virtual-time wait that may be cut short). Any other task holding
//! the matching [Interrupter] can then resume it with a reason. Reasons are queued, so none is
//! lost if several arrive before the owner runs again.
//!
//! # Example
//!
//! ```rust
//! use ubsim_runtime::{deterministic::Executor, interrupt, Clock, Runner, Spawner};
//!
//! let (executor, _) = Executor::default();
//! executor.until(100.0).start(|context| async move {
//!     let (interrupter, mut interruptible) = interrupt::channel();
//!     let waiter = context.clone().spawn(|context| async move {
//!         match interrupt::sleep(&context, 50.0, &mut interruptible).await {
//!             interrupt::Wake::Elapsed => None,
//!             interrupt::Wake::Interrupted(reason) => Some((reason, context.current())),
//!         }
//!     });
//!     context.sleep(10.0).await;
//!     interrupter.interrupt("new frame");
//!     assert_eq!(waiter.await.unwrap(), Some(("new frame", 10.0)));
//! }).unwrap();
//! ```

use crate::Clock;
use futures::{
    future::{select, Either},
    pin_mut,
};
use std::{
    collections::VecDeque,
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll, Waker},
};

/// Why a task suspended on [sleep] resumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wake<R> {
    /// The full duration elapsed.
    Elapsed,
    /// Another task interrupted the wait.
    Interrupted(R),
}

struct Inner<R> {
    reasons: VecDeque<R>,
    waiting: bool,
    waker: Option<Waker>,
}

/// Create a linked [Interrupter] and [Interruptible].
pub fn channel<R: Send + 'static>() -> (Interrupter<R>, Interruptible<R>) {
    let inner = Arc::new(Mutex::new(Inner {
        reasons: VecDeque::new(),
        waiting: false,
        waker: None,
    }));
    (
        Interrupter {
            inner: inner.clone(),
        },
        Interruptible { inner },
    )
}

/// Signals the task that owns the matching [Interruptible].
pub struct Interrupter<R> {
    inner: Arc<Mutex<Inner<R>>>,
}

impl<R> Clone for Interrupter<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R> Interrupter<R> {
    /// Queue `reason` and resume the owner if it is suspended.
    ///
    /// If the owner is not suspended, it observes the reason the next time it waits.
    pub fn interrupt(&self, reason: R) {
        let waker = {
            let mut inner = self.inner.lock().unwrap();
            inner.reasons.push_back(reason);
            inner.waiting = false;
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Returns true if the owner is currently suspended waiting for an interrupt.
    ///
    /// Cleared as soon as an interrupt is delivered (before the owner runs again), so
    /// checking this before calling [Interrupter::interrupt] wakes an idle task exactly once.
    pub fn is_waiting(&self) -> bool {
        self.inner.lock().unwrap().waiting
    }
}

/// Receives interrupts sent through any clone of the matching [Interrupter].
pub struct Interruptible<R> {
    inner: Arc<Mutex<Inner<R>>>,
}

impl<R> Interruptible<R> {
    /// Suspend until the next interrupt and return its reason.
    pub fn wait(&mut self) -> Wait<'_, R> {
        Wait { owner: self }
    }

    /// Discard any interrupt that has not been observed yet.
    pub fn clear(&mut self) {
        self.inner.lock().unwrap().reasons.clear();
    }
}

/// Future returned by [Interruptible::wait].
pub struct Wait<'a, R> {
    owner: &'a mut Interruptible<R>,
}

impl<R> Future for Wait<'_, R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.owner.inner.lock().unwrap();
        if let Some(reason) = inner.reasons.pop_front() {
            inner.waiting = false;
            inner.waker = None;
            return Poll::Ready(reason);
        }
        inner.waiting = true;
        inner.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl<R> Drop for Wait<'_, R> {
    fn drop(&mut self) {
        let mut inner = self.owner.inner.lock().unwrap();
        inner.waiting = false;
        inner.waker = None;
    }
}

/// Sleep for `duration` unless interrupted first.
///
/// If the deadline and an interrupt arrive at the same instant, the elapsed deadline wins and
/// the interrupt stays queued.
pub async fn sleep<E: Clock, R>(
    clock: &E,
    duration: f64,
    interruptible: &mut Interruptible<R>,
) -> Wake<R> {
    let timer = clock.sleep(duration);
    pin_mut!(timer);
    match select(timer, interruptible.wait()).await {
        Either::Left(((), _)) => Wake::Elapsed,
        Either::Right((reason, _)) => Wake::Interrupted(reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deterministic::Executor, Runner, Spawner};

    #[test]
    fn test_reasons_are_queued() {
        let (executor, _) = Executor::default();
        let reasons = executor
            .start(|_| async move {
                let (interrupter, mut interruptible) = channel();
                interrupter.interrupt(1);
                interrupter.interrupt(2);
                let first = interruptible.wait().await;
                let second = interruptible.wait().await;
                (first, second)
            })
            .unwrap();
        assert_eq!(reasons, (1, 2));
    }

    #[test]
    fn test_waiting_flag() {
        let (executor, _) = Executor::default();
        executor
            .until(10.0)
            .start(|context| async move {
                let (interrupter, mut interruptible) = channel::<&'static str>();
                assert!(!interrupter.is_waiting());
                let waiter = context
                    .clone()
                    .spawn(move |_| async move { interruptible.wait().await });

                // Let the waiter suspend
                context.sleep(1.0).await;
                assert!(interrupter.is_waiting());
                interrupter.interrupt("new frame");
                assert!(!interrupter.is_waiting());
                assert_eq!(waiter.await.unwrap(), "new frame");
            })
            .unwrap();
    }

    #[test]
    fn test_sleep_elapses() {
        let (executor, _) = Executor::default();
        let (wake, now) = executor
            .start(|context| async move {
                let (_interrupter, mut interruptible) = channel::<()>();
                let wake = sleep(&context, 12.5, &mut interruptible).await;
                (wake, context.current())
            })
            .unwrap();
        assert_eq!(wake, Wake::Elapsed);
        assert_eq!(now, 12.5);
    }

    #[test]
    fn test_interrupted_sleep_does_not_advance_time() {
        let (executor, context) = Executor::default();
        let now = executor
            .start(|context| async move {
                let (interrupter, mut interruptible) = channel();
                let waiter = context.clone().spawn(|context| async move {
                    let wake = sleep(&context, 100.0, &mut interruptible).await;
                    assert_eq!(wake, Wake::Interrupted("pause"));
                    context.current()
                });
                context.sleep(3.0).await;
                interrupter.interrupt("pause");
                waiter.await.unwrap()
            })
            .unwrap();
        assert_eq!(now, 3.0);

        // The abandoned deadline was cancelled
        assert_eq!(context.current(), 3.0);
    }
}
