//! Simulate urgency-based shaping and strict-priority forwarding across a switched network.
//!
//! Talkers generate [Frame]s for [Flow]s and push them across links toward switches. Each
//! switch routes an arriving frame along the flow's (possibly multicast) [Path] into one
//! [scheduler::Ubs] per egress port, where the frame waits in a shaped queue until its flow's
//! rate contract allows it into the pseudo queue of its traffic class. The egress port then
//! serves pseudo queues in strict priority order, one frame at a time, over a fixed-rate link.
//!
//! All activity runs as cooperative tasks on the [ubsim_runtime::deterministic] executor, so
//! virtual time is in microseconds and bandwidths and leaky rates are in bits per microsecond.
//!
//! # Example
//!
//! ```rust
//! use ubsim_network::{
//!     scheduler::Mode, switch, Flow, Listener, Path, PriorityMap, RunRegistry, Simulation,
//!     Switch, Talker, Topology,
//! };
//! use std::sync::Arc;
//!
//! let mut registry = RunRegistry::default();
//! let simulation = Simulation::new(Default::default(), &mut registry);
//! let env = simulation.environment().clone();
//!
//! // One flow from a talker through a switch to a listener
//! let path = Path::new(["talker", "switch", "listener"]).unwrap();
//! let flow = Arc::new(Flow::new(1, path, 100.0, 1500.0).unwrap());
//! let talker = Talker::new(&env, "talker", true);
//! talker.add_flow(flow, 3).unwrap();
//! let switch = Switch::new(
//!     &env,
//!     "switch",
//!     switch::Config::new(PriorityMap::new(2).unwrap(), Mode::Lrq),
//! );
//! let listener = Listener::new(&env, "listener");
//!
//! // Wire everything together
//! let mut topology = Topology::default();
//! topology.add(talker).unwrap();
//! topology.add(switch).unwrap();
//! topology.add(listener.clone()).unwrap();
//! topology.multi_connect("switch", 1000.0, ["talker", "listener"]).unwrap();
//! env.install(topology).unwrap();
//!
//! // Run for one millisecond of virtual time
//! let results = simulation.run(1_000.0).unwrap();
//! assert!(!results.talker.is_empty());
//! assert!(!listener.arrivals().is_empty());
//! ```

use std::{fmt, sync::Arc};
use thiserror::Error;

mod environment;
pub use environment::Environment;
mod flow;
pub use flow::{Flow, FlowId};
mod frame;
pub use frame::{Frame, FrameId, DEFAULT_HEADER};
pub mod link;
mod metrics;
mod node;
pub use node::{Arrival, Listener, Node};
mod path;
pub use path::Path;
mod priority;
pub use priority::{PriorityMap, MAX_PRIORITY};
pub mod scheduler;
mod simulation;
pub use simulation::{
    simulate_multiple, simulate_multiple_multiple, Config, Run, RunRegistry, Scenario, Simulation,
};
pub mod switch;
pub use switch::Switch;
mod talker;
pub use talker::{Talker, TokenBucketTalker, DEFAULT_PAYLOAD};
pub mod telemetry;
pub use telemetry::Results;
mod topology;
pub use topology::{Topology, DEFAULT_BANDWIDTH};

/// Errors that can occur while building or running a simulation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid traffic class count (must be in [1, 8]): {0}")]
    InvalidClassCount(u8),
    #[error("invalid priority (must be in [0, 7]): {0}")]
    InvalidPriority(u8),
    #[error("invalid traffic class {class} (only {classes} available)")]
    InvalidTrafficClass { class: u8, classes: u8 },
    #[error("invalid leaky rate (must be positive): {0}")]
    InvalidLeakyRate(f64),
    #[error("invalid burstiness (must not be negative): {0}")]
    InvalidBurstiness(f64),
    #[error("invalid bandwidth (must be positive): {0}")]
    InvalidBandwidth(f64),
    #[error("path cycles through {0}")]
    PathCycle(Address),
    #[error("path reaches {0} by more than one route")]
    PathMultipleRoutes(Address),
    #[error("duplicate node: {0}")]
    DuplicateNode(Address),
    #[error("unknown node: {0}")]
    UnknownNode(Address),
    #[error("unknown link: {0} -> {1}")]
    UnknownLink(Address, Address),
    #[error("no route from {address} for flow {flow}")]
    NoRoute { address: Address, flow: FlowId },
    #[error("frame id not unique: {0}")]
    DuplicateFrame(FrameId),
    #[error("topology not installed")]
    TopologyMissing,
    #[error("topology already installed")]
    TopologyInstalled,
    #[error("unknown mode: {0}")]
    UnknownMode(String),
    #[error("runtime error: {0}")]
    Runtime(#[from] ubsim_runtime::Error),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Address of a node in the simulated network.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Arc<str>);

impl Address {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self(value.into())
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(value.into())
    }
}

impl From<&Address> for Address {
    fn from(value: &Address) -> Self {
        value.clone()
    }
}

impl AsRef<str> for Address {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reason an idle task is woken.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wakeup {
    /// A frame was queued for the task.
    NewFrame,
}
