use crate::{Address, Flow};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

/// Identifier of a [Frame], unique within a simulation run.
pub type FrameId = u64;

/// Default header size in bytes.
pub const DEFAULT_HEADER: usize = 26;

/// Mutable per-frame bookkeeping updated as the frame moves through the network.
#[derive(Debug, Default)]
struct State {
    traffic_class: u8,
    start_time: Option<f64>,
    hops: u32,
    delays: BTreeMap<Address, f64>,
}

/// One unit of data belonging to a [Flow].
///
/// A frame is shared (via [Arc]) between every queue and link that holds it, so a multicast
/// frame accumulates one delay entry per terminal of its flow's path.
#[derive(Debug)]
pub struct Frame {
    id: FrameId,
    flow: Arc<Flow>,
    payload: usize,
    header: usize,
    priority: u8,

    state: Mutex<State>,
}

impl Frame {
    /// Create a frame with the default header size.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is greater than [crate::MAX_PRIORITY].
    pub fn new(id: FrameId, flow: Arc<Flow>, payload: usize, priority: u8) -> Self {
        Self::with_header(id, flow, payload, DEFAULT_HEADER, priority)
    }

    /// Create a frame with an explicit header size.
    pub fn with_header(
        id: FrameId,
        flow: Arc<Flow>,
        payload: usize,
        header: usize,
        priority: u8,
    ) -> Self {
        assert!(priority <= crate::MAX_PRIORITY, "invalid priority");
        Self {
            id,
            flow,
            payload,
            header,
            priority,
            state: Mutex::new(State {
                traffic_class: priority,
                ..Default::default()
            }),
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    pub fn flow(&self) -> &Arc<Flow> {
        &self.flow
    }

    pub fn payload(&self) -> usize {
        self.payload
    }

    pub fn header(&self) -> usize {
        self.header
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Length on the wire in bytes.
    pub fn len(&self) -> usize {
        self.payload + self.header
    }

    /// Length on the wire in bits.
    pub fn bits(&self) -> f64 {
        (self.len() * 8) as f64
    }

    /// Traffic class the frame was last forwarded with.
    pub fn traffic_class(&self) -> u8 {
        self.state.lock().unwrap().traffic_class
    }

    /// Virtual time of the frame's first transmission, if it has been sent.
    pub fn start_time(&self) -> Option<f64> {
        self.state.lock().unwrap().start_time
    }

    /// Number of transmissions started for this frame (across all branches).
    pub fn hops(&self) -> u32 {
        self.state.lock().unwrap().hops
    }

    /// End-to-end delay recorded at `terminal`, if the frame arrived there.
    pub fn delay(&self, terminal: &Address) -> Option<f64> {
        self.state.lock().unwrap().delays.get(terminal).copied()
    }

    /// All recorded end-to-end delays, keyed by terminal address.
    pub fn delays(&self) -> BTreeMap<Address, f64> {
        self.state.lock().unwrap().delays.clone()
    }

    /// Record that a transmission of the frame begins at `now` with `traffic_class`.
    pub(crate) fn on_send(&self, now: f64, traffic_class: u8) {
        let mut state = self.state.lock().unwrap();
        state.start_time.get_or_insert(now);
        state.traffic_class = traffic_class;
        state.hops += 1;
    }

    /// Record the arrival of the frame at `receiver` at virtual time `now`.
    ///
    /// Only terminals of the flow's path (addresses with no next hop) record a delay.
    pub fn on_hop(&self, receiver: &Address, now: f64) {
        if !self.flow.path().is_terminal(receiver) {
            return;
        }
        let mut state = self.state.lock().unwrap();
        let start = state.start_time.unwrap_or(now);
        state.delays.insert(receiver.clone(), now - start);
    }
}
