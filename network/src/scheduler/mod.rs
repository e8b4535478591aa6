//! Egress scheduling.
//!
//! An egress port holds one [Scheduler]. The [Ubs] scheduler implements urgency-based shaping:
//! arriving frames wait in a shaped queue per (traffic class, ingress) until their flow's rate
//! contract (see [Mode]) lets them into the pseudo queue of their traffic class, and the egress
//! port serves pseudo queues in strict priority order.

use crate::{telemetry::Results, Address, Error, Frame};
use std::{fmt, str::FromStr, sync::Arc};

mod shaper;
pub use shaper::{LeakyRate, Shapeless, Shaper, TokenBucket};
mod ubs;
pub use ubs::{Config, Ubs};

/// Shaping discipline applied to each shaped queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Leaky-rate queues: frames of a flow are spaced by exactly their size over the leaky rate.
    #[default]
    Lrq,
    /// Token-bucket emulation: bursts up to the flow's burstiness pass unshaped.
    Tbe,
    /// No shaping.
    Shapeless,
}

impl Mode {
    /// A fresh shaper implementing the discipline.
    pub fn shaper(&self) -> Box<dyn Shaper> {
        match self {
            Self::Lrq => Box::new(LeakyRate::default()),
            Self::Tbe => Box::new(TokenBucket::default()),
            Self::Shapeless => Box::new(Shapeless),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lrq => "lrq",
            Self::Tbe => "tbe",
            Self::Shapeless => "shapeless",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lrq" => Ok(Self::Lrq),
            "tbe" => Ok(Self::Tbe),
            "shapeless" => Ok(Self::Shapeless),
            _ => Err(Error::UnknownMode(s.to_string())),
        }
    }
}

/// How arriving frames are assigned to shaped queues.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Classification {
    /// One shaped queue per (traffic class, sending node).
    #[default]
    Sender,
    /// One shaped queue per (traffic class, sending node, upstream traffic class).
    SenderAndClass,
}

impl Classification {
    /// Shaped queue for a frame mapped to `traffic_class` that arrived from `sender` with
    /// `upstream` as its class on the incoming link.
    pub fn key(&self, traffic_class: u8, sender: &Address, upstream: u8) -> QueueKey {
        let ingress = match self {
            Self::Sender => Ingress::Sender(sender.clone()),
            Self::SenderAndClass => Ingress::Reclassified {
                sender: sender.clone(),
                traffic_class: upstream,
            },
        };
        QueueKey {
            traffic_class,
            ingress,
        }
    }
}

/// Where a frame entered the switch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Ingress {
    Sender(Address),
    Reclassified { sender: Address, traffic_class: u8 },
}

/// Identifies a shaped queue at an egress port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueKey {
    pub traffic_class: u8,
    pub ingress: Ingress,
}

impl fmt::Display for QueueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ingress {
            Ingress::Sender(sender) => write!(f, "{}-{}", self.traffic_class, sender),
            Ingress::Reclassified {
                sender,
                traffic_class,
            } => write!(f, "{}-{}-{}", self.traffic_class, sender, traffic_class),
        }
    }
}

/// Queueing discipline of one egress port.
pub trait Scheduler: Send + Sync + 'static {
    /// Queue a frame that arrived from `sender` with traffic class `upstream`.
    fn append_frame(&self, frame: Arc<Frame>, sender: &Address, upstream: u8)
        -> Result<(), Error>;

    /// The next frame to transmit, without removing it.
    fn peek_frame(&self) -> Option<Arc<Frame>>;

    /// Traffic class to forward `frame` with.
    fn traffic_class(&self, frame: &Frame) -> u8;

    /// Discard a frame that arrived from `sender`.
    fn drop_frame(&self, _frame: &Arc<Frame>, _sender: &Address) {}

    /// Called when the transmission of `frame` begins.
    fn start_transmission(&self, _frame: &Arc<Frame>) {}

    /// Called when the transmission of `frame` is paused.
    fn pause_transmission(&self, _frame: &Arc<Frame>) {}

    /// Called when `frame` has been fully transmitted.
    fn end_transmission(&self, frame: &Arc<Frame>);

    /// Snapshot of the telemetry recorded so far.
    fn telemetry(&self, _switch: &Address, _egress: &Address) -> Results {
        Results::default()
    }
}
