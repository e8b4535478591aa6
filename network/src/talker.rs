use crate::{
    metrics,
    scheduler::{Shapeless, Shaper, TokenBucket},
    telemetry::{Results, TalkerRecord},
    Address, Environment, Error, Flow, Frame, Node, Wakeup, MAX_PRIORITY,
};
use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
};
use tracing::debug;
use ubsim_runtime::{
    interrupt::{self, Interrupter, Interruptible},
    Clock, Metrics as _, Spawner,
};

/// Payload (in bytes) of frames generated by [Talker::add_flow].
pub const DEFAULT_PAYLOAD: usize = 1500;

/// Send queue shared by a talker's generators and its sending task.
struct Outbox {
    frames: VecDeque<Arc<Frame>>,
    sent: Vec<Arc<Frame>>,
}

struct Source {
    env: Environment,
    address: Address,
    monitor: bool,

    outbox: Mutex<Outbox>,
    wake: Interrupter<Wakeup>,
}

impl Source {
    /// Create the send queue and spawn its sending task.
    fn new(
        env: &Environment,
        address: Address,
        monitor: bool,
        shaper: Box<dyn Shaper>,
    ) -> Arc<Self> {
        let (wake, idle) = interrupt::channel();
        let source = Arc::new(Self {
            env: env.clone(),
            address,
            monitor,
            outbox: Mutex::new(Outbox {
                frames: VecDeque::new(),
                sent: Vec::new(),
            }),
            wake,
        });
        env.context().with_label("talker").spawn({
            let source = source.clone();
            move |_| async move {
                if let Err(err) = source.send(shaper, idle).await {
                    source.env.fail(err);
                }
            }
        });
        source
    }

    /// Create a frame of `payload` bytes and queue it for sending.
    fn enqueue(&self, flow: &Arc<Flow>, payload: usize, priority: u8) -> Arc<Frame> {
        let frame = Arc::new(Frame::new(
            self.env.frame_id(),
            flow.clone(),
            payload,
            priority,
        ));
        self.env
            .metrics()
            .frames_generated
            .get_or_create(&metrics::Node::new(&self.address))
            .inc();
        self.outbox.lock().unwrap().frames.push_back(frame.clone());
        debug!(now = self.env.now(), address = %self.address, frame = frame.id(), "frame generated");
        if self.wake.is_waiting() {
            self.wake.interrupt(Wakeup::NewFrame);
        }
        frame
    }

    /// Drain the send queue in arrival order, one transmission at a time.
    async fn send(
        &self,
        mut shaper: Box<dyn Shaper>,
        mut idle: Interruptible<Wakeup>,
    ) -> Result<(), Error> {
        let context = self.env.context();
        loop {
            let next = {
                let mut outbox = self.outbox.lock().unwrap();
                let frame = outbox.frames.pop_front();
                if let (Some(frame), true) = (&frame, self.monitor) {
                    outbox.sent.push(frame.clone());
                }
                frame
            };
            let Some(frame) = next else {
                idle.wait().await;
                continue;
            };
            let flow = frame.flow().clone();
            let receiver = flow
                .path()
                .next_hops(&self.address)
                .first()
                .cloned()
                .ok_or_else(|| Error::NoRoute {
                    address: self.address.clone(),
                    flow: flow.id(),
                })?;

            // Hold the frame until the shaper admits it
            let delay = shaper.delay(&flow, frame.bits(), context.current());
            if delay > 0.0 {
                context.sleep(delay).await;
            }
            shaper.admit(&flow, frame.bits(), context.current());

            self.env
                .send_frame(&self.address, &receiver, frame, 0.0, None)?
                .await?;
            debug!(now = context.current(), address = %self.address, "send frame");
        }
    }

    /// One row per (sent frame, terminal reached), or a single row if none was reached yet.
    fn telemetry(&self) -> Results {
        let mut results = Results::default();
        if !self.monitor {
            return results;
        }
        let run = self.env.run();
        let outbox = self.outbox.lock().unwrap();
        for frame in &outbox.sent {
            let record = |receiver: Option<&Address>, delay: Option<f64>| TalkerRecord {
                sim_name: run.name.clone(),
                sim_id: run.id,
                seed: run.seed,
                frame_id: frame.id(),
                flow_id: frame.flow().id(),
                frame_len: frame.len(),
                frame_priority: frame.priority(),
                sender: self.address.to_string(),
                receiver: receiver.map(|r| r.to_string()),
                start_time: frame.start_time(),
                arrival_time: frame.start_time().zip(delay).map(|(s, d)| s + d),
                delay,
            };
            let delays = frame.delays();
            if delays.is_empty() {
                results.talker.push(record(None, None));
                continue;
            }
            for (receiver, delay) in &delays {
                results.talker.push(record(Some(receiver), Some(*delay)));
            }
        }
        results
    }
}

fn check_priority(priority: u8) -> Result<(), Error> {
    if priority > MAX_PRIORITY {
        return Err(Error::InvalidPriority(priority));
    }
    Ok(())
}

/// A source that emits each of its flows as a continuous leaky bucket.
///
/// Every flow gets a generator that queues one frame every `frame_bits / leaky_rate`
/// microseconds. All generators share one send queue, which is drained strictly in arrival
/// order toward the first hop of each frame's path.
pub struct Talker {
    source: Arc<Source>,
}

impl Talker {
    pub fn new(env: &Environment, address: impl Into<Address>, monitor: bool) -> Arc<Self> {
        Arc::new(Self {
            source: Source::new(env, address.into(), monitor, Box::new(Shapeless)),
        })
    }

    /// Generate frames of [DEFAULT_PAYLOAD] bytes for `flow`.
    pub fn add_flow(&self, flow: Arc<Flow>, priority: u8) -> Result<(), Error> {
        self.add_flow_with(flow, priority, std::iter::repeat(DEFAULT_PAYLOAD))
    }

    /// Generate frames for `flow` with payload sizes drawn from `payloads`.
    ///
    /// Generation stops when `payloads` is exhausted.
    pub fn add_flow_with<P>(&self, flow: Arc<Flow>, priority: u8, payloads: P) -> Result<(), Error>
    where
        P: IntoIterator<Item = usize>,
        P::IntoIter: Send + 'static,
    {
        check_priority(priority)?;
        let source = self.source.clone();
        let payloads = payloads.into_iter();
        let context = source.env.context().with_label("generator");
        context.spawn(move |context| async move {
            for payload in payloads {
                let frame = source.enqueue(&flow, payload, priority);
                context.sleep(frame.bits() / flow.leaky_rate()).await;
            }
        });
        Ok(())
    }
}

impl Node for Talker {
    fn address(&self) -> &Address {
        &self.source.address
    }

    fn environment(&self) -> &Environment {
        &self.source.env
    }

    fn on_frame_received(&self, frame: Arc<Frame>, sender: &Address, _: u8) -> Result<(), Error> {
        debug!(address = %self.source.address, %sender, frame = frame.id(), "talker ignored frame");
        Ok(())
    }

    fn monitored(&self) -> bool {
        self.source.monitor
    }

    fn telemetry(&self) -> Results {
        self.source.telemetry()
    }
}

/// A source for a single flow with externally timed arrivals and a token-bucket shaped send
/// queue.
///
/// Frame sizes come from `payloads` and the gaps between frames (in microseconds) from
/// `gaps`. Before entering the network, frames are regulated down to the flow's leaky rate
/// and burstiness. Generation stops when either sequence is exhausted.
pub struct TokenBucketTalker {
    source: Arc<Source>,
    flow: Arc<Flow>,
    priority: u8,
}

impl TokenBucketTalker {
    pub fn new<P, G>(
        env: &Environment,
        address: impl Into<Address>,
        flow: Arc<Flow>,
        priority: u8,
        payloads: P,
        gaps: G,
        monitor: bool,
    ) -> Result<Arc<Self>, Error>
    where
        P: IntoIterator<Item = usize>,
        P::IntoIter: Send + 'static,
        G: IntoIterator<Item = f64>,
        G::IntoIter: Send + 'static,
    {
        check_priority(priority)?;
        let shaper = Box::new(TokenBucket::new(env.now()));
        let source = Source::new(env, address.into(), monitor, shaper);
        env.context().with_label("generator").spawn({
            let source = source.clone();
            let flow = flow.clone();
            let payloads = payloads.into_iter();
            let mut gaps = gaps.into_iter();
            move |context| async move {
                for payload in payloads {
                    source.enqueue(&flow, payload, priority);
                    let Some(gap) = gaps.next() else {
                        break;
                    };
                    context.sleep(gap).await;
                }
            }
        });
        Ok(Arc::new(Self {
            source,
            flow,
            priority,
        }))
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }
}

impl Node for TokenBucketTalker {
    fn address(&self) -> &Address {
        &self.source.address
    }

    fn environment(&self) -> &Environment {
        &self.source.env
    }

    fn on_frame_received(&self, frame: Arc<Frame>, sender: &Address, _: u8) -> Result<(), Error> {
        debug!(address = %self.source.address, %sender, frame = frame.id(), "talker ignored frame");
        Ok(())
    }

    fn monitored(&self) -> bool {
        self.source.monitor
    }

    fn telemetry(&self) -> Results {
        self.source.telemetry()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Listener, Path, Run, Topology};
    use ubsim_runtime::{deterministic::Executor, Runner};

    fn setup(
        context: ubsim_runtime::deterministic::Context,
    ) -> (Environment, Arc<Listener>, Topology) {
        let env = Environment::new(context, Run::default(), Default::default());
        let listener = Listener::new(&env, "l");
        let mut topology = Topology::default();
        topology.add(listener.clone()).unwrap();
        (env, listener, topology)
    }

    #[test]
    fn test_leaky_bucket_generation() {
        let (executor, context) = Executor::default();
        let (env, listener, mut topology) = setup(context);
        let talker = Talker::new(&env, "t", true);
        let flow = Flow::new(1, Path::new(["t", "l"]).unwrap(), 100.0, 1500.0).unwrap();
        talker
            .add_flow_with(Arc::new(flow), 3, std::iter::repeat(974).take(3))
            .unwrap();
        topology.add(talker.clone()).unwrap();
        topology.connect("t", "l", 1000.0).unwrap();
        env.install(topology).unwrap();
        executor.until(1_000.0).start(|_| async {}).unwrap();

        // 8000-bit frames every 80us, each taking 8us on the link
        let arrivals: Vec<_> = listener.arrivals().iter().map(|a| a.time).collect();
        assert_eq!(arrivals, vec![8.0, 88.0, 168.0]);

        let records = talker.telemetry().talker;
        assert_eq!(records.len(), 3);
        assert_eq!(records[1].start_time, Some(80.0));
        assert_eq!(records[1].arrival_time, Some(88.0));
        assert_eq!(records[1].delay, Some(8.0));
        assert_eq!(records[1].receiver.as_deref(), Some("l"));
    }

    #[test]
    fn test_generation_stops_before_horizon() {
        let (executor, context) = Executor::default();
        let (env, listener, mut topology) = setup(context);
        let talker = Talker::new(&env, "t", true);

        // 1000-bit frames every 10us
        let flow = Flow::new(1, Path::new(["t", "l"]).unwrap(), 100.0, 1500.0).unwrap();
        talker.add_flow_with(Arc::new(flow), 0, std::iter::repeat(99)).unwrap();
        topology.add(talker.clone()).unwrap();
        topology.connect("t", "l", 1000.0).unwrap();
        env.install(topology).unwrap();
        executor.until(100.0).start(|_| async {}).unwrap();

        // The frame due at exactly 100us is never generated
        let starts: Vec<_> = talker
            .telemetry()
            .talker
            .iter()
            .map(|r| r.start_time.unwrap())
            .collect();
        assert_eq!(starts.len(), 10);
        assert_eq!(starts.last(), Some(&90.0));
        assert_eq!(listener.arrivals().len(), 10);
        assert_eq!(env.now(), 100.0);
    }

    #[test]
    fn test_send_queue_is_fifo_across_flows() {
        let (executor, context) = Executor::default();
        let (env, listener, mut topology) = setup(context);
        let talker = Talker::new(&env, "t", false);
        let path = Path::new(["t", "l"]).unwrap();
        let slow = Arc::new(Flow::new(1, path.clone(), 10.0, 0.0).unwrap());
        let fast = Arc::new(Flow::new(2, path, 1000.0, 0.0).unwrap());
        talker.add_flow_with(slow, 0, std::iter::repeat(74).take(2)).unwrap();
        talker.add_flow_with(fast, 7, std::iter::repeat(74).take(2)).unwrap();
        topology.add(talker.clone()).unwrap();
        topology.connect("t", "l", 100.0).unwrap();
        env.install(topology).unwrap();
        executor.until(1_000.0).start(|_| async {}).unwrap();

        // Frames leave in generation order regardless of priority
        let frames: Vec<_> = listener.arrivals().iter().map(|a| (a.flow, a.time)).collect();
        assert_eq!(frames, vec![(1, 8.0), (2, 16.0), (2, 24.0), (1, 88.0)]);
        assert!(talker.telemetry().talker.is_empty());
    }

    #[test]
    fn test_token_bucket_talker() {
        let (executor, context) = Executor::default();
        let (env, listener, mut topology) = setup(context);

        // Burst of two 8000-bit frames, then one every 80us
        let flow = Flow::new(1, Path::new(["t", "l"]).unwrap(), 100.0, 2000.0).unwrap();
        let talker = TokenBucketTalker::new(
            &env,
            "t",
            Arc::new(flow),
            5,
            std::iter::repeat(974).take(4),
            std::iter::repeat(1.0),
            true,
        )
        .unwrap();
        topology.add(talker.clone()).unwrap();
        topology.connect("t", "l", 1000.0).unwrap();
        env.install(topology).unwrap();
        executor.until(1_000.0).start(|_| async {}).unwrap();

        let starts: Vec<_> = talker
            .telemetry()
            .talker
            .iter()
            .map(|r| r.start_time.unwrap())
            .collect();
        assert_eq!(starts, vec![0.0, 8.0, 80.0, 160.0]);
        assert_eq!(listener.arrivals().len(), 4);
    }

    #[test]
    fn test_invalid_priority() {
        let (_, context) = Executor::default();
        let (env, _, _) = setup(context);
        let talker = Talker::new(&env, "t", false);
        let flow = Arc::new(Flow::new(1, Path::new(["t", "l"]).unwrap(), 1.0, 0.0).unwrap());
        assert!(matches!(
            talker.add_flow(flow, 8),
            Err(Error::InvalidPriority(8))
        ));
    }

    #[test]
    fn test_missing_route_fails_run() {
        let (executor, context) = Executor::default();
        let (env, _, mut topology) = setup(context);
        let talker = Talker::new(&env, "t", false);
        let flow = Flow::new(1, Path::new(["x", "l"]).unwrap(), 100.0, 0.0).unwrap();
        talker.add_flow(Arc::new(flow), 0).unwrap();
        topology.add(talker).unwrap();
        env.install(topology).unwrap();
        let _ = executor.until(1_000.0).start(|_| async {});
        assert!(matches!(env.take_failure(), Some(Error::NoRoute { .. })));
    }
}
