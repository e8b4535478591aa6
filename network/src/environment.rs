use crate::{
    link::{self, Sending},
    metrics::{self, Metrics},
    telemetry::Results,
    Address, Error, Frame, FrameId, Run, Topology,
};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};
use ubsim_runtime::{deterministic::Context, Clock, Metrics as _, Spawner};

struct Shared {
    run: Run,
    link: link::Config,
    metrics: Metrics,

    next_frame: Mutex<FrameId>,
    topology: Mutex<Option<Arc<Topology>>>,
    failure: Mutex<Option<Error>>,
}

/// Shared state of a single simulation run.
///
/// Every node holds a clone of the environment to read the virtual clock, allocate frame ids,
/// spawn tasks, and start transmissions toward its neighbors.
#[derive(Clone)]
pub struct Environment {
    context: Context,
    shared: Arc<Shared>,
}

impl Environment {
    pub(crate) fn new(context: Context, run: Run, link: link::Config) -> Self {
        let context = context.with_label("network");
        let metrics = Metrics::init(&context);
        Self {
            context,
            shared: Arc::new(Shared {
                run,
                link,
                metrics,
                next_frame: Mutex::new(0),
                topology: Mutex::new(None),
                failure: Mutex::new(None),
            }),
        }
    }

    /// Runtime context used to spawn node tasks.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Current virtual time in microseconds.
    pub fn now(&self) -> f64 {
        self.context.current()
    }

    /// Tag of the run this environment belongs to.
    pub fn run(&self) -> &Run {
        &self.shared.run
    }

    /// Link configuration shared by every transmission.
    pub fn link(&self) -> &link::Config {
        &self.shared.link
    }

    pub(crate) fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// Allocate the next frame id (0, 1, 2, ...).
    pub fn frame_id(&self) -> FrameId {
        let mut next = self.shared.next_frame.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }

    /// Install the wired topology. Can only be done once.
    pub fn install(&self, topology: Topology) -> Result<(), Error> {
        let mut installed = self.shared.topology.lock().unwrap();
        if installed.is_some() {
            return Err(Error::TopologyInstalled);
        }
        *installed = Some(Arc::new(topology));
        Ok(())
    }

    /// The installed topology.
    pub fn topology(&self) -> Result<Arc<Topology>, Error> {
        self.shared
            .topology
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::TopologyMissing)
    }

    /// Begin transmitting `frame` from `sender` to `receiver`.
    ///
    /// The frame is stamped with its start time (on its first transmission) and with
    /// `traffic_class` (or its priority, if none is given).
    pub fn send_frame(
        &self,
        sender: &Address,
        receiver: &Address,
        frame: Arc<Frame>,
        extra_bits: f64,
        traffic_class: Option<u8>,
    ) -> Result<Sending, Error> {
        let topology = self.topology()?;
        let node = topology.node(receiver)?.clone();
        let bandwidth = topology.bandwidth(sender, receiver)?;

        let now = self.now();
        let traffic_class = traffic_class.unwrap_or(frame.priority());
        frame.on_send(now, traffic_class);
        self.shared
            .metrics
            .frames_forwarded
            .get_or_create(&metrics::Link::new(sender, receiver))
            .inc();
        debug!(
            now,
            %sender,
            %receiver,
            frame = frame.id(),
            traffic_class,
            "send frame"
        );
        Ok(Sending::new(
            self,
            sender.clone(),
            node,
            frame,
            traffic_class,
            extra_bits,
            bandwidth,
        ))
    }

    /// Abort the run with `error`.
    ///
    /// Only the first failure is kept.
    pub fn fail(&self, error: Error) {
        error!(now = self.now(), %error, "simulation failed");
        {
            let mut failure = self.shared.failure.lock().unwrap();
            if failure.is_none() {
                *failure = Some(error);
            }
        }
        self.context.stop();
    }

    /// Returns true if the run was aborted.
    pub fn failed(&self) -> bool {
        self.shared.failure.lock().unwrap().is_some()
    }

    pub(crate) fn take_failure(&self) -> Option<Error> {
        self.shared.failure.lock().unwrap().take()
    }

    /// Collect the telemetry of every monitored node.
    pub fn collect(&self) -> Result<Results, Error> {
        let topology = self.topology()?;
        let mut results = Results::default();
        for node in topology.nodes().filter(|node| node.monitored()) {
            results.extend(node.telemetry());
        }
        Ok(results)
    }

    /// Encode the run's metrics in the Prometheus text format.
    pub fn encode_metrics(&self) -> String {
        self.context.encode()
    }

    /// Release the topology (and with it, the references between nodes).
    pub(crate) fn teardown(&self) {
        self.shared.topology.lock().unwrap().take();
    }
}
