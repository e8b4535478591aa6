use crate::{link::Sending, telemetry::Results, Address, Environment, Error, FlowId, Frame, FrameId};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// A participant in the simulated network.
pub trait Node: Send + Sync + 'static {
    /// Address of the node.
    fn address(&self) -> &Address;

    /// Environment the node runs in.
    fn environment(&self) -> &Environment;

    /// Handle a frame that finished arriving from `sender`, which forwarded it with
    /// `traffic_class`.
    fn on_frame_received(
        &self,
        frame: Arc<Frame>,
        sender: &Address,
        traffic_class: u8,
    ) -> Result<(), Error>;

    /// Deliver a frame to the node.
    ///
    /// Called by the link model once the last bit of `frame` has arrived. `traffic_class` is the
    /// class this link carried the frame with (a multicast frame may carry a different class on
    /// each branch).
    fn push_frame(
        &self,
        frame: Arc<Frame>,
        sender: &Address,
        traffic_class: u8,
    ) -> Result<(), Error> {
        self.on_frame_received(frame, sender, traffic_class)
    }

    /// Begin transmitting `frame` to `receiver`.
    ///
    /// The frame is forwarded with `traffic_class`, or with its priority if none is given.
    fn send_frame(
        &self,
        receiver: &Address,
        frame: Arc<Frame>,
        extra_bits: f64,
        traffic_class: Option<u8>,
    ) -> Result<Sending, Error> {
        self.environment()
            .send_frame(self.address(), receiver, frame, extra_bits, traffic_class)
    }

    /// Returns true if the node records telemetry.
    fn monitored(&self) -> bool {
        false
    }

    /// Snapshot of the telemetry recorded so far.
    fn telemetry(&self) -> Results {
        Results::default()
    }
}

/// A frame received by a [Listener].
#[derive(Clone, Debug, PartialEq)]
pub struct Arrival {
    pub frame: FrameId,
    pub flow: FlowId,
    pub sender: Address,
    pub traffic_class: u8,
    pub time: f64,
}

/// A sink that accepts every frame.
pub struct Listener {
    env: Environment,
    address: Address,
    arrivals: Mutex<Vec<Arrival>>,
}

impl Listener {
    pub fn new(env: &Environment, address: impl Into<Address>) -> Arc<Self> {
        Arc::new(Self {
            env: env.clone(),
            address: address.into(),
            arrivals: Mutex::new(Vec::new()),
        })
    }

    /// Frames received so far, in arrival order.
    pub fn arrivals(&self) -> Vec<Arrival> {
        self.arrivals.lock().unwrap().clone()
    }
}

impl Node for Listener {
    fn address(&self) -> &Address {
        &self.address
    }

    fn environment(&self) -> &Environment {
        &self.env
    }

    fn on_frame_received(
        &self,
        frame: Arc<Frame>,
        sender: &Address,
        traffic_class: u8,
    ) -> Result<(), Error> {
        let now = self.env.now();
        debug!(now, address = %self.address, frame = frame.id(), "received frame");
        self.arrivals.lock().unwrap().push(Arrival {
            frame: frame.id(),
            flow: frame.flow().id(),
            sender: sender.clone(),
            traffic_class,
            time: now,
        });
        Ok(())
    }
}
