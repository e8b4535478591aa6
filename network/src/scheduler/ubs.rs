use super::{Classification, Mode, QueueKey, Scheduler};
use crate::{
    telemetry::{QueueRecord, Results, SwitchRecord},
    Address, Environment, Error, Frame, FrameId, PriorityMap, Wakeup,
};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};
use tracing::{debug, trace};
use ubsim_runtime::{
    deterministic::Context,
    interrupt::{self, Interrupter, Interruptible},
    Clock, Metrics as _, Spawner,
};

/// Configuration of an urgency-based scheduler (and of the switch that owns it).
#[derive(Clone, Debug)]
pub struct Config {
    /// Maps frame priorities to traffic classes.
    pub priority_map: PriorityMap,

    /// Shaping discipline of every shaped queue.
    pub mode: Mode,

    /// How frames are assigned to shaped queues.
    pub classification: Classification,

    /// Whether to record per-frame and per-queue telemetry.
    pub monitor: bool,
}

impl Config {
    /// Unmonitored configuration with one shaped queue per (traffic class, sender).
    pub fn new(priority_map: PriorityMap, mode: Mode) -> Self {
        Self {
            priority_map,
            mode,
            classification: Classification::default(),
            monitor: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Interval {
    start: f64,
    end: f64,
    bytes: usize,
    frames: usize,
}

/// Content of a queue over contiguous intervals of virtual time.
struct Occupancy {
    since: f64,
    bytes: usize,
    frames: usize,
    closed: Vec<Interval>,
}

impl Occupancy {
    fn new(now: f64) -> Self {
        Self {
            since: now,
            bytes: 0,
            frames: 0,
            closed: Vec::new(),
        }
    }

    fn update(&mut self, now: f64, bytes: usize, frames: usize) {
        if now > self.since {
            self.closed.push(Interval {
                start: self.since,
                end: now,
                bytes: self.bytes,
                frames: self.frames,
            });
            self.since = now;
        }
        self.bytes = bytes;
        self.frames = frames;
    }

    /// Closed intervals plus the open interval ending at `now`.
    fn intervals(&self, now: f64) -> impl Iterator<Item = Interval> + '_ {
        let open = (now > self.since).then_some(Interval {
            start: self.since,
            end: now,
            bytes: self.bytes,
            frames: self.frames,
        });
        self.closed.iter().copied().chain(open)
    }
}

struct Queue {
    frames: VecDeque<Arc<Frame>>,
    bytes: usize,
    occupancy: Occupancy,
}

impl Queue {
    fn new(now: f64) -> Self {
        Self {
            frames: VecDeque::new(),
            bytes: 0,
            occupancy: Occupancy::new(now),
        }
    }

    fn push(&mut self, frame: Arc<Frame>, now: f64) {
        self.bytes += frame.len();
        self.frames.push_back(frame);
        self.occupancy.update(now, self.bytes, self.frames.len());
    }

    fn pop(&mut self, now: f64) -> Option<Arc<Frame>> {
        let frame = self.frames.pop_front()?;
        self.bytes -= frame.len();
        self.occupancy.update(now, self.bytes, self.frames.len());
        Some(frame)
    }

    fn remove(&mut self, frame: &Arc<Frame>, now: f64) -> bool {
        let Some(index) = self.frames.iter().position(|f| Arc::ptr_eq(f, frame)) else {
            return false;
        };
        self.frames.remove(index);
        self.bytes -= frame.len();
        self.occupancy.update(now, self.bytes, self.frames.len());
        true
    }
}

struct Shaped {
    queue: Queue,
    wake: Interrupter<Wakeup>,
}

/// What is known about a frame handled by a monitored scheduler.
struct Record {
    flow: u64,
    len: usize,
    priority: u8,
    queue: String,
    arrival_time: f64,
    transmission_time: f64,
    eligible_time: Option<f64>,
    forwarding_time: Option<f64>,
}

#[derive(Default)]
struct State {
    shaped: BTreeMap<QueueKey, Shaped>,
    pseudo: BTreeMap<u8, Queue>,
    records: BTreeMap<FrameId, Record>,
}

struct Inner {
    env: Environment,
    cfg: Config,
    bandwidth: f64,
    egress: Interrupter<Wakeup>,
    state: Mutex<State>,
}

impl Inner {
    /// Move the head of the shaped queue `key` into the pseudo queue of its traffic class.
    fn release(&self, key: &QueueKey) -> Option<Arc<Frame>> {
        let now = self.env.now();
        let frame = {
            let mut state = self.state.lock().unwrap();
            let frame = state.shaped.get_mut(key)?.queue.pop(now)?;
            state
                .pseudo
                .entry(key.traffic_class)
                .or_insert_with(|| Queue::new(now))
                .push(frame.clone(), now);
            if let Some(record) = state.records.get_mut(&frame.id()) {
                record.eligible_time = Some(now);
            }
            frame
        };
        trace!(now, queue = %key, frame = frame.id(), "frame eligible");

        // The egress may have been idle with nothing to send
        if self.egress.is_waiting() {
            self.egress.interrupt(Wakeup::NewFrame);
        }
        Some(frame)
    }
}

/// Urgency-based scheduler of one egress port.
///
/// Every shaped queue is drained by its own task, which holds the head frame until the
/// configured [Mode] admits it and then moves it to the pseudo queue of its traffic class.
/// [Scheduler::peek_frame] serves the highest non-empty traffic class first.
#[derive(Clone)]
pub struct Ubs {
    inner: Arc<Inner>,
}

impl Ubs {
    /// Create a scheduler for an egress link of `bandwidth` bits per microsecond.
    ///
    /// `egress` is interrupted whenever a frame becomes eligible while the egress is idle.
    pub fn new(
        env: &Environment,
        cfg: Config,
        bandwidth: f64,
        egress: Interrupter<Wakeup>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                env: env.clone(),
                cfg,
                bandwidth,
                egress,
                state: Mutex::new(State::default()),
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.cfg.mode
    }

    pub fn bandwidth(&self) -> f64 {
        self.inner.bandwidth
    }

    /// Frames waiting in shaped queues.
    pub fn shaped_frames(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.shaped.values().map(|s| s.queue.frames.len()).sum()
    }

    /// Frames eligible for transmission.
    pub fn eligible_frames(&self) -> usize {
        let state = self.inner.state.lock().unwrap();
        state.pseudo.values().map(|q| q.frames.len()).sum()
    }
}

impl Scheduler for Ubs {
    fn append_frame(
        &self,
        frame: Arc<Frame>,
        sender: &Address,
        upstream: u8,
    ) -> Result<(), Error> {
        let inner = &self.inner;
        let now = inner.env.now();
        let traffic_class = self.traffic_class(&frame);
        let key = inner.cfg.classification.key(traffic_class, sender, upstream);

        let spawn = {
            let mut state = inner.state.lock().unwrap();
            if inner.cfg.monitor {
                if state.records.contains_key(&frame.id()) {
                    return Err(Error::DuplicateFrame(frame.id()));
                }
                state.records.insert(
                    frame.id(),
                    Record {
                        flow: frame.flow().id(),
                        len: frame.len(),
                        priority: frame.priority(),
                        queue: key.to_string(),
                        arrival_time: now,
                        transmission_time: frame.bits() / inner.bandwidth,
                        eligible_time: None,
                        forwarding_time: None,
                    },
                );
            }
            state
                .pseudo
                .entry(traffic_class)
                .or_insert_with(|| Queue::new(now));

            // Lazily create the shaped queue (and its task)
            let mut spawn = None;
            let shaped = state.shaped.entry(key.clone()).or_insert_with(|| {
                let (wake, idle) = interrupt::channel();
                spawn = Some(idle);
                Shaped {
                    queue: Queue::new(now),
                    wake,
                }
            });
            shaped.queue.push(frame.clone(), now);
            if spawn.is_none() && shaped.wake.is_waiting() {
                shaped.wake.interrupt(Wakeup::NewFrame);
            }
            spawn
        };
        debug!(now, queue = %key, frame = frame.id(), "frame queued");

        if let Some(idle) = spawn {
            let inner = inner.clone();
            inner
                .env
                .context()
                .with_label("shaper")
                .spawn(move |context| shape(inner, context, key, idle));
        }
        Ok(())
    }

    fn peek_frame(&self) -> Option<Arc<Frame>> {
        let state = self.inner.state.lock().unwrap();
        state
            .pseudo
            .values()
            .rev()
            .find_map(|queue| queue.frames.front().cloned())
    }

    fn traffic_class(&self, frame: &Frame) -> u8 {
        self.inner.cfg.priority_map.traffic_class(frame.priority())
    }

    fn end_transmission(&self, frame: &Arc<Frame>) {
        let now = self.inner.env.now();
        let mut state = self.inner.state.lock().unwrap();
        let removed = state
            .pseudo
            .values_mut()
            .rev()
            .any(|queue| queue.remove(frame, now));
        if !removed {
            return;
        }
        if let Some(record) = state.records.get_mut(&frame.id()) {
            record.forwarding_time = Some(now);
        }
    }

    fn telemetry(&self, switch: &Address, egress: &Address) -> Results {
        let inner = &self.inner;
        let mut results = Results::default();
        if !inner.cfg.monitor {
            return results;
        }
        let run = inner.env.run();
        let now = inner.env.now();
        let state = inner.state.lock().unwrap();
        for (id, record) in &state.records {
            let nodal_delay = record.forwarding_time.map(|t| t - record.arrival_time);
            results.switch.push(SwitchRecord {
                sim_name: run.name.clone(),
                sim_id: run.id,
                seed: run.seed,
                switch_address: switch.to_string(),
                egress_address: egress.to_string(),
                mode: inner.cfg.mode.to_string(),
                frame_id: *id,
                flow_id: record.flow,
                frame_len: record.len,
                frame_priority: record.priority,
                arrival_time: record.arrival_time,
                shaped_queue: record.queue.clone(),
                transmission_time: record.transmission_time,
                eligible_time: record.eligible_time,
                forwarding_time: record.forwarding_time,
                nodal_delay,
                queue_delay: nodal_delay.map(|d| d - record.transmission_time),
            });
        }

        let shaped = state
            .shaped
            .iter()
            .map(|(key, shaped)| (key.to_string(), &shaped.queue));
        let pseudo = state
            .pseudo
            .iter()
            .map(|(class, queue)| (format!("pseudo-{class}"), queue));
        for (label, queue) in shaped.chain(pseudo) {
            for interval in queue.occupancy.intervals(now) {
                results.queue.push(QueueRecord {
                    sim_name: run.name.clone(),
                    sim_id: run.id,
                    seed: run.seed,
                    switch_address: switch.to_string(),
                    egress_address: egress.to_string(),
                    queue: label.clone(),
                    start: interval.start,
                    end: interval.end,
                    bytes: interval.bytes,
                    frames: interval.frames,
                });
            }
        }
        results
    }
}

/// Drain the shaped queue `key`, holding each head frame until the shaper admits it.
async fn shape(inner: Arc<Inner>, context: Context, key: QueueKey, mut idle: Interruptible<Wakeup>) {
    let mut shaper = inner.cfg.mode.shaper();
    loop {
        let head = {
            let state = inner.state.lock().unwrap();
            state
                .shaped
                .get(&key)
                .and_then(|shaped| shaped.queue.frames.front().cloned())
        };
        let Some(frame) = head else {
            idle.wait().await;
            continue;
        };

        // Only this task removes frames from the queue, so the head is stable while waiting
        let delay = shaper.delay(frame.flow(), frame.bits(), context.current());
        if delay > 0.0 {
            trace!(now = context.current(), queue = %key, frame = frame.id(), delay, "shaping frame");
            context.sleep(delay).await;
        }
        inner.release(&key);
        shaper.admit(frame.flow(), frame.bits(), context.current());
    }
}
