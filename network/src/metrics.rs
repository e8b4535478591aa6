use crate::Address;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
};

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Node {
    pub address: String,
}

impl Node {
    pub fn new(address: &Address) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct Link {
    pub origin: String,
    pub recipient: String,
}

impl Link {
    pub fn new(origin: &Address, recipient: &Address) -> Self {
        Self {
            origin: origin.to_string(),
            recipient: recipient.to_string(),
        }
    }
}

/// Frame counters shared by every node of a simulation.
#[derive(Clone, Default)]
pub struct Metrics {
    pub frames_generated: Family<Node, Counter>,
    pub frames_forwarded: Family<Link, Counter>,
    pub frames_delivered: Family<Node, Counter>,
}

impl Metrics {
    pub fn init<M: ubsim_runtime::Metrics>(context: &M) -> Self {
        let metrics = Self::default();
        context.register(
            "frames_generated",
            "frames generated by each talker",
            metrics.frames_generated.clone(),
        );
        context.register(
            "frames_forwarded",
            "frames transmitted over each link",
            metrics.frames_forwarded.clone(),
        );
        context.register(
            "frames_delivered",
            "frames delivered to each terminal",
            metrics.frames_delivered.clone(),
        );
        metrics
    }
}
