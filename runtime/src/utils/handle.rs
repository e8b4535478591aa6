use crate::Error;
use futures::channel::oneshot;
use prometheus_client::metrics::gauge::Gauge;
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Once},
    task::{Context, Poll},
};

/// Handle to a spawned task.
///
/// Resolves to the task's output once it completes, or to [Error::Closed] if the task was
/// dropped before completing (for example, because the run ended first).
pub struct Handle<T>
where
    T: Send + 'static,
{
    receiver: oneshot::Receiver<T>,

    running: Gauge,
    once: Arc<Once>,
}

impl<T> Handle<T>
where
    T: Send + 'static,
{
    pub(crate) fn init<F>(f: F, running: Gauge) -> (impl Future<Output = ()>, Self)
    where
        F: Future<Output = T> + Send + 'static,
    {
        // Increment running counter
        running.inc();

        // Initialize channel to handle result
        let once = Arc::new(Once::new());
        let (sender, receiver) = oneshot::channel();

        let wrapped = {
            let once = once.clone();
            let running = running.clone();
            async move {
                let result = f.await;

                // Decrement running counter
                once.call_once(|| {
                    running.dec();
                });
                let _ = sender.send(result);
            }
        };
        (
            wrapped,
            Self {
                receiver,

                running,
                once,
            },
        )
    }
}

impl<T> Future for Handle<T>
where
    T: Send + 'static,
{
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(value)) => Poll::Ready(Ok(value)),
            Poll::Ready(Err(_)) => {
                self.once.call_once(|| {
                    self.running.dec();
                });
                Poll::Ready(Err(Error::Closed))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
