//! A deterministic runtime that runs tasks in virtual time.
//!
//! Ready tasks are polled in the order they were woken (spawned tasks in the order they were
//! spawned). Once no task is ready, the earliest pending alarm fires and virtual time jumps to
//! it. Alarms registered for the same instant fire in registration order, which makes every run
//! reproducible given a fixed seed and a fixed task-creation order.
//!
//! # Panics
//!
//! If any task panics, the runtime will panic.
//!
//! # Example
//!
//! ```rust
//! use ubsim_runtime::{deterministic::Executor, Clock, Runner, Spawner};
//!
//! let (executor, _) = Executor::default();
//! let result = executor.until(100.0).start(|context| async move {
//!     let child = context.clone().spawn(|context| async move {
//!         context.sleep(25.0).await;
//!         context.current()
//!     });
//!     child.await.unwrap()
//! });
//! assert_eq!(result, Ok(25.0));
//! ```

use crate::{utils::Handle, Clock, Error, METRICS_PREFIX};
use futures::task::{waker_ref, ArcWake};
use prometheus_client::{
    encoding::{text::encode, EncodeLabelSet},
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::{Metric, Registry},
};
use rand::{rngs::StdRng, RngCore, SeedableRng};
use std::{
    collections::{BinaryHeap, HashSet, VecDeque},
    future::Future,
    mem::take,
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc, Mutex,
    },
    task::{self, Poll, Waker},
};
use tracing::trace;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct Work {
    label: String,
}

#[derive(Debug)]
struct Metrics {
    tasks_spawned: Family<Work, Counter>,
    tasks_running: Family<Work, Gauge>,
    task_polls: Family<Work, Counter>,
}

impl Metrics {
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self {
            tasks_spawned: Family::default(),
            tasks_running: Family::default(),
            task_polls: Family::default(),
        };
        registry.register(
            "tasks_spawned",
            "Total number of tasks spawned",
            metrics.tasks_spawned.clone(),
        );
        registry.register(
            "tasks_running",
            "Number of tasks currently running",
            metrics.tasks_running.clone(),
        );
        registry.register(
            "task_polls",
            "Total number of task polls",
            metrics.task_polls.clone(),
        );
        metrics
    }
}

struct Task {
    id: u128,
    label: String,

    tasks: Arc<Tasks>,

    future: Mutex<Pin<Box<dyn Future<Output = ()> + Send + 'static>>>,

    queued: Mutex<bool>,
    completed: Mutex<bool>,
}

impl ArcWake for Task {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        if *arc_self.completed.lock().unwrap() {
            return;
        }
        {
            let mut queued = arc_self.queued.lock().unwrap();
            if *queued {
                return;
            }
            *queued = true;
        }
        arc_self.tasks.enqueue(WorkItem::Task(arc_self.clone()));
    }
}

/// A work item in the ready-queue: either a spawned task or the root future.
enum WorkItem {
    Root,
    Task(Arc<Task>),
}

struct Tasks {
    counter: Mutex<u128>,
    queue: Mutex<VecDeque<WorkItem>>,
    root_queued: Mutex<bool>,
    all: Mutex<Vec<Arc<Task>>>,
}

impl Tasks {
    fn register(
        arc_self: &Arc<Self>,
        label: &str,
        future: Pin<Box<dyn Future<Output = ()> + Send + 'static>>,
    ) {
        let id = {
            let mut l = arc_self.counter.lock().unwrap();
            let old = *l;
            *l = l.checked_add(1).expect("task counter overflow");
            old
        };
        let task = Arc::new(Task {
            id,
            label: label.to_string(),
            future: Mutex::new(future),
            tasks: arc_self.clone(),
            queued: Mutex::new(true),
            completed: Mutex::new(false),
        });
        arc_self.all.lock().unwrap().push(task.clone());
        arc_self.enqueue(WorkItem::Task(task));
    }

    fn enqueue(&self, item: WorkItem) {
        self.queue.lock().unwrap().push_back(item);
    }

    fn enqueue_root(&self) {
        {
            let mut queued = self.root_queued.lock().unwrap();
            if *queued {
                return;
            }
            *queued = true;
        }
        self.enqueue(WorkItem::Root);
    }

    fn next(&self) -> Option<WorkItem> {
        self.queue.lock().unwrap().pop_front()
    }

    /// Drop every task future (breaking any reference cycle between tasks and the state they
    /// share) and forget all queued work.
    fn clear(&self) {
        let all = take(&mut *self.all.lock().unwrap());
        for task in all {
            *task.completed.lock().unwrap() = true;
            let future = {
                let mut future = task.future.lock().unwrap();
                std::mem::replace(&mut *future, Box::pin(async {}))
            };
            drop(future);
        }
        let queue = take(&mut *self.queue.lock().unwrap());
        drop(queue);
    }
}

/// Waker for the root future.
///
/// The root future isn't stored inside `Tasks`, so it is queued as [WorkItem::Root].
struct RootWaker {
    tasks: Arc<Tasks>,
}

impl ArcWake for RootWaker {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        arc_self.tasks.enqueue_root();
    }
}

/// Configuration for the `deterministic` runtime.
#[derive(Clone, Debug)]
pub struct Config {
    /// Seed for the random number generator.
    pub seed: u64,

    /// Virtual time (in microseconds) at which the run ends, if any.
    pub horizon: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed: 42,
            horizon: None,
        }
    }
}

/// Deterministic runtime that runs tasks in virtual time.
pub struct Executor {
    registry: Mutex<Registry>,
    horizon: Mutex<Option<f64>>,
    metrics: Arc<Metrics>,
    rng: Mutex<StdRng>,
    time: Mutex<f64>,
    tasks: Arc<Tasks>,
    sleeping: Mutex<BinaryHeap<Alarm>>,
    alarms: Mutex<u64>,
    cancelled: Mutex<HashSet<u64>>,
    stopped: AtomicBool,
}

impl Executor {
    /// Initialize a new `deterministic` runtime with the given configuration.
    pub fn init(cfg: Config) -> (Runner, Context) {
        if let Some(horizon) = cfg.horizon {
            assert!(horizon >= 0.0, "horizon must not be negative");
        }

        // Create a new registry
        let mut registry = Registry::default();
        let runtime_registry = registry.sub_registry_with_prefix(METRICS_PREFIX);

        // Initialize runtime
        let metrics = Arc::new(Metrics::init(runtime_registry));
        let executor = Arc::new(Self {
            registry: Mutex::new(registry),
            horizon: Mutex::new(cfg.horizon),
            metrics,
            rng: Mutex::new(StdRng::seed_from_u64(cfg.seed)),
            time: Mutex::new(0.0),
            tasks: Arc::new(Tasks {
                queue: Mutex::new(VecDeque::new()),
                counter: Mutex::new(1), // Reserve 0 for the root task
                root_queued: Mutex::new(false),
                all: Mutex::new(Vec::new()),
            }),
            sleeping: Mutex::new(BinaryHeap::new()),
            alarms: Mutex::new(0),
            cancelled: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        });
        (
            Runner {
                executor: executor.clone(),
            },
            Context {
                label: String::new(),
                spawned: false,
                executor,
            },
        )
    }

    /// Initialize a new `deterministic` runtime with the default configuration
    /// and the provided seed.
    pub fn seeded(seed: u64) -> (Runner, Context) {
        let cfg = Config {
            seed,
            ..Config::default()
        };
        Self::init(cfg)
    }

    /// Initialize a new `deterministic` runtime with the default configuration.
    // We'd love to implement the trait but we can't because of the return type.
    #[allow(clippy::should_implement_trait)]
    pub fn default() -> (Runner, Context) {
        Self::init(Config::default())
    }

    fn now(&self) -> f64 {
        *self.time.lock().unwrap()
    }

    /// Pop the earliest alarm that has not been cancelled.
    fn next_alarm(&self) -> Option<Alarm> {
        let mut sleeping = self.sleeping.lock().unwrap();
        let mut cancelled = self.cancelled.lock().unwrap();
        while let Some(alarm) = sleeping.pop() {
            if cancelled.remove(&alarm.seq) {
                continue;
            }
            return Some(alarm);
        }
        None
    }

    fn register_alarm(&self, time: f64, waker: Waker, fired: Arc<AtomicBool>) -> u64 {
        let seq = {
            let mut alarms = self.alarms.lock().unwrap();
            let seq = *alarms;
            *alarms = alarms.checked_add(1).expect("alarm counter overflow");
            seq
        };
        self.sleeping.lock().unwrap().push(Alarm {
            time,
            seq,
            waker,
            fired,
        });
        seq
    }
}

/// Implementation of [crate::Runner] for the `deterministic` runtime.
pub struct Runner {
    executor: Arc<Executor>,
}

impl Runner {
    /// End the run once virtual time reaches `horizon` microseconds.
    ///
    /// Alarms due at or after the horizon never fire.
    pub fn until(self, horizon: f64) -> Self {
        assert!(horizon >= 0.0, "horizon must not be negative");
        *self.executor.horizon.lock().unwrap() = Some(horizon);
        self
    }

    fn poll_task(&self, task: &Arc<Task>) {
        // The task may be woken again while it is being polled
        *task.queued.lock().unwrap() = false;
        if *task.completed.lock().unwrap() {
            return;
        }
        trace!(id = task.id, "processing task");

        // Record task poll
        self.executor
            .metrics
            .task_polls
            .get_or_create(&Work {
                label: task.label.clone(),
            })
            .inc();

        // Prepare task for polling
        let waker = waker_ref(task);
        let mut cx = task::Context::from_waker(&waker);
        let mut fut = task.future.lock().unwrap();
        if fut.as_mut().poll(&mut cx).is_pending() {
            trace!(id = task.id, "task is still pending");
            return;
        }

        // Mark task as completed
        *task.completed.lock().unwrap() = true;
        trace!(id = task.id, "task is complete");
    }
}

impl crate::Runner for Runner {
    type Context = Context;

    fn start<F, Fut>(self, f: F) -> Result<Fut::Output, Error>
    where
        F: FnOnce(Self::Context) -> Fut,
        Fut: Future,
    {
        // Pin root task to the heap
        let context = Context {
            label: String::new(),
            spawned: false,
            executor: self.executor.clone(),
        };
        let mut root = Box::pin(f(context));
        let mut output = None;

        // A waker for the root future
        let root_waker_src = Arc::new(RootWaker {
            tasks: self.executor.tasks.clone(),
        });
        self.executor.tasks.enqueue_root();

        // Process tasks until the horizon is reached, work runs out, or a task stops the run
        let horizon = *self.executor.horizon.lock().unwrap();
        let reason = loop {
            // Run everything that is ready at the current instant
            while let Some(item) = self.executor.tasks.next() {
                if self.executor.stopped.load(AtomicOrdering::SeqCst) {
                    break;
                }
                match item {
                    WorkItem::Root => {
                        *self.executor.tasks.root_queued.lock().unwrap() = false;
                        if output.is_some() {
                            continue;
                        }
                        trace!(id = 0, "processing task");
                        let waker = waker_ref(&root_waker_src);
                        let mut cx = task::Context::from_waker(&waker);
                        if let Poll::Ready(v) = root.as_mut().poll(&mut cx) {
                            trace!(id = 0, "task is complete");
                            output = Some(v);
                        }
                    }
                    WorkItem::Task(task) => self.poll_task(&task),
                }
            }
            if self.executor.stopped.load(AtomicOrdering::SeqCst) {
                trace!(now = self.executor.now(), "runtime stopped");
                break Error::Stopped;
            }

            // Fire the next alarm (if it is before the horizon)
            let Some(alarm) = self.executor.next_alarm() else {
                break Error::Stalled;
            };
            if let Some(horizon) = horizon {
                if alarm.time >= horizon {
                    // Keep the alarm around so the state remains consistent until cleared
                    self.executor.sleeping.lock().unwrap().push(alarm);
                    *self.executor.time.lock().unwrap() = horizon;
                    trace!(now = horizon, "horizon reached");
                    break Error::Timeout;
                }
            }
            {
                let mut time = self.executor.time.lock().unwrap();
                if alarm.time > *time {
                    *time = alarm.time;
                    trace!(now = *time, "time advanced");
                }
            }
            alarm.fired.store(true, AtomicOrdering::SeqCst);
            alarm.waker.wake();
        };

        // Reaching the end of available work within the horizon still consumes the horizon
        if reason == Error::Stalled {
            if let Some(horizon) = horizon {
                let mut time = self.executor.time.lock().unwrap();
                if *time < horizon {
                    *time = horizon;
                }
            }
        }
        let result = match output {
            Some(v) => Ok(v),
            None => Err(reason),
        };

        // Release all task state
        drop(root);
        self.executor.tasks.clear();
        self.executor.sleeping.lock().unwrap().clear();
        self.executor.cancelled.lock().unwrap().clear();
        result
    }
}

/// Implementation of [crate::Spawner], [crate::Clock], [crate::Metrics], and
/// [rand::RngCore] for the `deterministic` runtime.
pub struct Context {
    label: String,
    spawned: bool,
    executor: Arc<Executor>,
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            spawned: false,
            executor: self.executor.clone(),
        }
    }
}

impl crate::Spawner for Context {
    fn spawn<F, Fut, T>(self, f: F) -> Handle<T>
    where
        F: FnOnce(Self) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        // Ensure a context only spawns one task
        assert!(!self.spawned, "already spawned");

        // Get metrics
        let label = self.label.clone();
        let work = Work {
            label: label.clone(),
        };
        self.executor
            .metrics
            .tasks_spawned
            .get_or_create(&work)
            .inc();
        let gauge = self
            .executor
            .metrics
            .tasks_running
            .get_or_create(&work)
            .clone();

        // Set up the task (its context cannot spawn again)
        let executor = self.executor.clone();
        let mut context = self;
        context.spawned = true;
        let future = f(context);
        let (f, handle) = Handle::init(future, gauge);

        // Spawn the task
        Tasks::register(&executor.tasks, &label, Box::pin(f));
        handle
    }

    fn stop(&self) {
        self.executor.stopped.store(true, AtomicOrdering::SeqCst);
    }

    fn stopped(&self) -> bool {
        self.executor.stopped.load(AtomicOrdering::SeqCst)
    }
}

impl crate::Metrics for Context {
    fn with_label(&self, label: &str) -> Self {
        let label = {
            let prefix = self.label.clone();
            if prefix.is_empty() {
                label.to_string()
            } else {
                format!("{}_{}", prefix, label)
            }
        };
        assert!(
            !label.starts_with(METRICS_PREFIX),
            "using runtime label is not allowed"
        );
        Self {
            label,
            spawned: false,
            executor: self.executor.clone(),
        }
    }

    fn label(&self) -> String {
        self.label.clone()
    }

    fn register<N: Into<String>, H: Into<String>>(&self, name: N, help: H, metric: impl Metric) {
        let name = name.into();
        let prefixed_name = {
            let prefix = &self.label;
            if prefix.is_empty() {
                name
            } else {
                format!("{}_{}", *prefix, name)
            }
        };
        self.executor
            .registry
            .lock()
            .unwrap()
            .register(prefixed_name, help, metric)
    }

    fn encode(&self) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &self.executor.registry.lock().unwrap()).expect("encoding failed");
        buffer
    }
}

impl RngCore for Context {
    fn next_u32(&mut self) -> u32 {
        self.executor.rng.lock().unwrap().next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.executor.rng.lock().unwrap().next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.executor.rng.lock().unwrap().fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.executor.rng.lock().unwrap().try_fill_bytes(dest)
    }
}

struct Alarm {
    time: f64,
    seq: u64,
    waker: Waker,
    fired: Arc<AtomicBool>,
}

impl PartialEq for Alarm {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for Alarm {}

impl PartialOrd for Alarm {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Alarm {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reverse the ordering for min-heap (earliest time, then earliest registration)
        other
            .time
            .total_cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Sleeper {
    executor: Arc<Executor>,
    time: f64,
    alarm: Option<u64>,
    fired: Arc<AtomicBool>,
}

impl Future for Sleeper {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut task::Context<'_>) -> Poll<Self::Output> {
        if self.alarm.is_some() {
            if self.fired.load(AtomicOrdering::SeqCst) {
                self.alarm = None;
                return Poll::Ready(());
            }
            return Poll::Pending;
        }

        // Even an elapsed deadline yields to every task that is already ready
        let time = self.time.max(self.executor.now());
        let seq = self
            .executor
            .register_alarm(time, cx.waker().clone(), self.fired.clone());
        self.alarm = Some(seq);
        Poll::Pending
    }
}

impl Drop for Sleeper {
    fn drop(&mut self) {
        let Some(seq) = self.alarm.take() else {
            return;
        };
        if !self.fired.load(AtomicOrdering::SeqCst) {
            self.executor.cancelled.lock().unwrap().insert(seq);
        }
    }
}

impl Clock for Context {
    fn current(&self) -> f64 {
        self.executor.now()
    }

    fn sleep(&self, duration: f64) -> impl Future<Output = ()> + Send + 'static {
        let deadline = self.current() + duration.max(0.0);
        self.sleep_until(deadline)
    }

    fn sleep_until(&self, deadline: f64) -> impl Future<Output = ()> + Send + 'static {
        Sleeper {
            executor: self.executor.clone(),

            time: deadline,
            alarm: None,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }
}
