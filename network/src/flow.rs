use crate::{Error, Path};

/// Identifier of a [Flow].
pub type FlowId = u64;

/// A logical stream of frames sharing a route and a rate contract.
#[derive(Clone, Debug)]
pub struct Flow {
    id: FlowId,
    path: Path,
    leaky_rate: f64,
    burstiness: f64,
}

impl Flow {
    /// Create a flow that may sustain `leaky_rate` bits per microsecond with bursts of up to
    /// `burstiness` bytes.
    pub fn new(id: FlowId, path: Path, leaky_rate: f64, burstiness: f64) -> Result<Self, Error> {
        if !(leaky_rate > 0.0 && leaky_rate.is_finite()) {
            return Err(Error::InvalidLeakyRate(leaky_rate));
        }
        if !(burstiness >= 0.0 && burstiness.is_finite()) {
            return Err(Error::InvalidBurstiness(burstiness));
        }
        Ok(Self {
            id,
            path,
            leaky_rate,
            burstiness,
        })
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sustained rate in bits per microsecond.
    pub fn leaky_rate(&self) -> f64 {
        self.leaky_rate
    }

    /// Maximum burst in bytes.
    pub fn burstiness(&self) -> f64 {
        self.burstiness
    }

    /// Maximum burst in bits.
    pub fn burst_bits(&self) -> f64 {
        self.burstiness * 8.0
    }
}
