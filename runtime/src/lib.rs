//! Drive cooperative simulation tasks in deterministic virtual time.
//!
//! This crate provides the engine underneath the network simulator. Tasks are ordinary
//! `async` blocks that suspend only at explicit points (a virtual-time sleep, an idle wait
//! on an [interrupt::Interruptible], or another task's [Handle]). The
//! [deterministic] executor advances virtual time from one alarm to the next and runs every
//! ready task in the order it was woken, so a run is fully reproducible for a fixed seed and
//! task-creation order.
//!
//! # Terminology
//!
//! Each runtime is composed of an `Executor` and a `Context`. The `Executor` implements the
//! [Runner] trait and drives execution. The `Context` implements the other traits to provide
//! time, task spawning, metrics, and randomness.
//!
//! # Time
//!
//! Virtual time is measured in microseconds as an `f64`, starting at `0.0`. Link bandwidths
//! elsewhere in the workspace are expressed in bits per microsecond, so a transmission time
//! is simply `bits / bandwidth`.

use prometheus_client::registry::Metric;
use std::future::Future;
use thiserror::Error;

pub mod deterministic;
pub mod interrupt;
mod utils;
pub use utils::Handle;

/// Prefix for runtime metrics.
const METRICS_PREFIX: &str = "runtime";

/// Errors that can occur when interacting with the runtime.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("closed")]
    Closed,
    #[error("stopped")]
    Stopped,
    #[error("timeout")]
    Timeout,
    #[error("stalled")]
    Stalled,
}

/// Interface that any task scheduler must implement to start
/// running tasks.
pub trait Runner {
    /// Context defines the environment available to tasks.
    type Context;

    /// Start running a root task.
    ///
    /// When this function returns, all spawned tasks will be dropped.
    fn start<F, Fut>(self, f: F) -> Result<Fut::Output, Error>
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future;
}

/// Interface that any task scheduler must implement to spawn tasks.
pub trait Spawner: Clone + Send + Sync + 'static {
    /// Spawn a task with the current context.
    ///
    /// Unlike directly awaiting a future, the task becomes ready immediately (behind any
    /// task that is already ready) even if the caller never awaits the returned [Handle].
    ///
    /// # Panics
    ///
    /// Panics if the context was already used to spawn a task. The context passed to `f` counts
    /// as used, so the task must clone it (or call `with_label`) to spawn children.
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static;

    /// Signal the runtime to stop executing tasks at the next opportunity.
    ///
    /// The task calling `stop` runs until it next suspends.
    fn stop(&self);

    /// Returns true if [Spawner::stop] has been called.
    fn stopped(&self) -> bool;
}

/// Interface to register and encode metrics.
pub trait Metrics: Clone + Send + Sync + 'static {
    /// Get the current label of the context.
    fn label(&self) -> String;

    /// Create a new instance of `Metrics` with the given label appended to the end
    /// of the current `Metrics` label.
    ///
    /// It is not permitted to use `METRICS_PREFIX` as the start of a label (reserved
    /// for metrics for the runtime).
    fn with_label(&self, label: &str) -> Self;

    /// Register a metric with the runtime.
    ///
    /// Any registered metric will include (as a prefix) the label of the current context.
    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric);

    /// Encode all metrics into a buffer.
    fn encode(&self) -> String;
}

/// Interface that any task scheduler must implement to provide
/// time-based operations in virtual microseconds.
pub trait Clock: Clone + Send + Sync + 'static {
    /// Returns the current virtual time.
    fn current(&self) -> f64;

    /// Sleep for the given duration.
    ///
    /// A duration of zero (or less) still yields to every task that is already ready.
    fn sleep(&self, duration: f64) -> impl Future<Output = ()> + Send + 'static;

    /// Sleep until the given deadline.
    fn sleep_until(&self, deadline: f64) -> impl Future<Output = ()> + Send + 'static;
}
