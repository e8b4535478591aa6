//! Transmission of a single frame over a link.
//!
//! A [Sending] owns a task that holds the link for the frame's transmission time and then
//! delivers the frame to the receiver. The transmission can be paused and resumed, which is the
//! building block for preemptive egress disciplines.

use crate::{metrics, Address, Environment, Error, Frame, Node};
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context as TaskContext, Poll},
};
use tracing::trace;
use ubsim_runtime::{
    deterministic::Context,
    interrupt::{self, Interrupter, Wake},
    Clock, Handle, Metrics as _, Spawner,
};

/// Configuration for link transmissions.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Config {
    /// Bits that must have been sent before a transmission may be paused.
    pub min_preemption_bits: f64,

    /// Bits added to the remaining transmission every time it is paused.
    pub preemption_penalty_bits: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            min_preemption_bits: 8.0,
            preemption_penalty_bits: 0.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Control {
    Pause,
    Start,
}

struct Progress {
    active: bool,
    delivered: bool,
    start_time: f64,
    transmission_time: f64,
    sent_bits: f64,
}

/// An in-flight transmission of a frame from one node to another.
///
/// Resolves once the frame has been handed to the receiver.
pub struct Sending {
    context: Context,
    config: Config,
    bandwidth: f64,

    progress: Arc<Mutex<Progress>>,
    control: Interrupter<Control>,
    handle: Handle<Result<(), Error>>,
}

impl Sending {
    pub(crate) fn new(
        env: &Environment,
        sender: Address,
        receiver: Arc<dyn Node>,
        frame: Arc<Frame>,
        traffic_class: u8,
        extra_bits: f64,
        bandwidth: f64,
    ) -> Self {
        let context = env.context().clone();
        let delivered = env.metrics().frames_delivered.clone();
        let progress = Arc::new(Mutex::new(Progress {
            active: true,
            delivered: false,
            start_time: context.current(),
            transmission_time: (frame.bits() + extra_bits) / bandwidth,
            sent_bits: 0.0,
        }));
        let (control, mut interruptible) = interrupt::channel();
        let handle = context.with_label("link").spawn({
            let progress = progress.clone();
            move |context| async move {
                loop {
                    let remaining = progress.lock().unwrap().transmission_time;
                    match interrupt::sleep(&context, remaining, &mut interruptible).await {
                        Wake::Elapsed => break,
                        Wake::Interrupted(reason) => {
                            trace!(now = context.current(), ?reason, "transmission interrupted");
                        }
                    }

                    // Hold the link until resumed
                    let reason = interruptible.wait().await;
                    trace!(now = context.current(), ?reason, "transmission resumed");
                }
                {
                    let mut progress = progress.lock().unwrap();
                    progress.delivered = true;
                    progress.active = false;
                }

                // Hand the frame to the receiver
                let address = receiver.address();
                frame.on_hop(address, context.current());
                if frame.flow().path().is_terminal(address) {
                    delivered.get_or_create(&metrics::Node::new(address)).inc();
                }
                receiver.push_frame(frame, &sender, traffic_class)
            }
        });
        Self {
            context,
            config: *env.link(),
            bandwidth,
            progress,
            control,
            handle,
        }
    }

    /// Remaining transmission time in microseconds (as of the last pause or start).
    pub fn transmission_time(&self) -> f64 {
        self.progress.lock().unwrap().transmission_time
    }

    /// Returns true if the transmission is running (not paused and not delivered).
    pub fn is_active(&self) -> bool {
        self.progress.lock().unwrap().active
    }

    /// Returns true if the frame has been handed to the receiver.
    pub fn is_delivered(&self) -> bool {
        self.progress.lock().unwrap().delivered
    }

    /// Returns true if enough bits have been sent for a pause to be meaningful.
    pub fn interruptable(&self) -> bool {
        let progress = self.progress.lock().unwrap();
        if progress.delivered {
            return false;
        }
        let mut sent = progress.sent_bits;
        if progress.active {
            sent += (self.context.current() - progress.start_time) * self.bandwidth;
        }
        sent > self.config.min_preemption_bits
    }

    /// Suspend the transmission.
    ///
    /// The remaining time is recomputed from the time elapsed since the last start, plus the
    /// configured preemption penalty.
    pub fn pause(&self) {
        {
            let mut progress = self.progress.lock().unwrap();
            if !progress.active || progress.delivered {
                return;
            }
            let elapsed = self.context.current() - progress.start_time;
            let remaining = (progress.transmission_time - elapsed).max(0.0);
            progress.sent_bits += elapsed * self.bandwidth;
            progress.transmission_time =
                remaining + self.config.preemption_penalty_bits / self.bandwidth;
            progress.active = false;
        }
        self.control.interrupt(Control::Pause);
    }

    /// Resume a paused transmission with its remaining time.
    pub fn start(&self) {
        {
            let mut progress = self.progress.lock().unwrap();
            if progress.active || progress.delivered {
                return;
            }
            progress.start_time = self.context.current();
            progress.active = true;
        }
        self.control.interrupt(Control::Start);
    }
}

impl Future for Sending {
    type Output = Result<(), Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(err)) => Poll::Ready(Err(err.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}
