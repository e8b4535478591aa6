use crate::{Flow, FlowId};
use std::collections::HashMap;

/// Per-flow rate regulation.
///
/// A shaping loop asks for the [Shaper::delay] of the frame at the head of its queue, waits that
/// long, and then calls [Shaper::admit] once the frame is released.
pub trait Shaper: Send + 'static {
    /// Microseconds to wait before a frame of `bits` from `flow` may be released at `now`.
    fn delay(&mut self, flow: &Flow, bits: f64, now: f64) -> f64;

    /// Account for a frame of `bits` from `flow` released at `now`.
    fn admit(&mut self, flow: &Flow, bits: f64, now: f64);
}

/// Spaces the frames of each flow by their size over the flow's leaky rate.
#[derive(Clone, Debug, Default)]
pub struct LeakyRate {
    eligible: HashMap<FlowId, f64>,
}

impl Shaper for LeakyRate {
    fn delay(&mut self, flow: &Flow, _bits: f64, now: f64) -> f64 {
        let eligible = self.eligible.get(&flow.id()).copied().unwrap_or(0.0);
        (eligible - now).max(0.0)
    }

    fn admit(&mut self, flow: &Flow, bits: f64, now: f64) {
        self.eligible
            .insert(flow.id(), now + bits / flow.leaky_rate());
    }
}

#[derive(Clone, Copy, Debug)]
struct Bucket {
    credit: f64,
    updated: f64,
}

/// Lets each flow burst up to its burstiness and refills credit at its leaky rate.
///
/// Every bucket starts full. Credit is capped at the burst size when a frame is admitted.
#[derive(Clone, Debug, Default)]
pub struct TokenBucket {
    origin: f64,
    buckets: HashMap<FlowId, Bucket>,
}

impl TokenBucket {
    /// Create a shaper whose buckets start filling at `origin`.
    pub fn new(origin: f64) -> Self {
        Self {
            origin,
            buckets: HashMap::new(),
        }
    }

    fn available(&mut self, flow: &Flow, now: f64) -> f64 {
        let origin = self.origin;
        let bucket = self.buckets.entry(flow.id()).or_insert(Bucket {
            credit: flow.burst_bits(),
            updated: origin,
        });
        bucket.credit + (now - bucket.updated) * flow.leaky_rate()
    }
}

impl Shaper for TokenBucket {
    fn delay(&mut self, flow: &Flow, bits: f64, now: f64) -> f64 {
        let available = self.available(flow, now);
        if available >= bits {
            return 0.0;
        }
        (bits - available) / flow.leaky_rate()
    }

    fn admit(&mut self, flow: &Flow, bits: f64, now: f64) {
        let available = self.available(flow, now);
        self.buckets.insert(
            flow.id(),
            Bucket {
                credit: flow.burst_bits().min(available) - bits,
                updated: now,
            },
        );
    }
}

/// Releases every frame immediately.
#[derive(Clone, Copy, Debug, Default)]
pub struct Shapeless;

impl Shaper for Shapeless {
    fn delay(&mut self, _flow: &Flow, _bits: f64, _now: f64) -> f64 {
        0.0
    }

    fn admit(&mut self, _flow: &Flow, _bits: f64, _now: f64) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Path;

    fn flow(id: FlowId, leaky_rate: f64, burstiness: f64) -> Flow {
        Flow::new(id, Path::new(["a", "b"]).unwrap(), leaky_rate, burstiness).unwrap()
    }

    /// Release `count` frames of `bits` that are all ready at time zero.
    fn release(shaper: &mut dyn Shaper, flow: &Flow, bits: f64, count: usize) -> Vec<f64> {
        let mut now = 0.0;
        let mut released = Vec::new();
        for _ in 0..count {
            now += shaper.delay(flow, bits, now);
            shaper.admit(flow, bits, now);
            released.push(now);
        }
        released
    }

    #[test]
    fn test_leaky_rate_spacing() {
        let flow = flow(1, 100.0, 1500.0);
        let released = release(&mut LeakyRate::default(), &flow, 1000.0, 4);
        assert_eq!(released, vec![0.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_leaky_rate_flows_are_independent() {
        let (a, b) = (flow(1, 100.0, 0.0), flow(2, 10.0, 0.0));
        let mut shaper = LeakyRate::default();
        shaper.admit(&a, 1000.0, 0.0);
        shaper.admit(&b, 1000.0, 0.0);
        assert_eq!(shaper.delay(&a, 1000.0, 5.0), 5.0);
        assert_eq!(shaper.delay(&b, 1000.0, 5.0), 95.0);
        assert_eq!(shaper.delay(&a, 1000.0, 50.0), 0.0);
    }

    #[test]
    fn test_token_bucket_burst_then_rate() {
        // Room for three 1000-bit frames, then one every 10us
        let flow = flow(1, 100.0, 375.0);
        let released = release(&mut TokenBucket::default(), &flow, 1000.0, 6);
        assert_eq!(released, vec![0.0, 0.0, 0.0, 10.0, 20.0, 30.0]);
    }

    #[test]
    fn test_token_bucket_credit_is_capped() {
        let flow = flow(1, 100.0, 250.0);
        let mut shaper = TokenBucket::default();

        // A long idle period does not accumulate more than the burst
        shaper.admit(&flow, 1000.0, 1_000.0);
        assert_eq!(shaper.delay(&flow, 1000.0, 1_000.0), 0.0);
        shaper.admit(&flow, 1000.0, 1_000.0);
        assert_eq!(shaper.delay(&flow, 1000.0, 1_000.0), 10.0);
    }

    #[test]
    fn test_token_bucket_envelope() {
        let flow = flow(1, 50.0, 500.0);
        let bits = 1200.0;
        let released = release(&mut TokenBucket::default(), &flow, bits, 40);

        // Bits released in any window never exceed the burst plus the rate times the window
        for (i, start) in released.iter().enumerate() {
            for (j, end) in released.iter().enumerate().skip(i) {
                let sent = (j - i + 1) as f64 * bits;
                let bound = flow.burst_bits() + flow.leaky_rate() * (end - start);
                assert!(sent <= bound + 1e-6, "window {start}..{end}: {sent} > {bound}");
            }
        }
    }

    #[test]
    fn test_token_bucket_origin() {
        let flow = flow(1, 100.0, 125.0);
        let mut shaper = TokenBucket::new(50.0);
        shaper.admit(&flow, 1000.0, 50.0);

        // Empty at 50, refilled by 60
        assert_eq!(shaper.delay(&flow, 1000.0, 50.0), 10.0);
        assert_eq!(shaper.delay(&flow, 1000.0, 60.0), 0.0);
    }

    #[test]
    fn test_shapeless() {
        let flow = flow(1, 1.0, 0.0);
        let released = release(&mut Shapeless, &flow, 1000.0, 3);
        assert_eq!(released, vec![0.0, 0.0, 0.0]);
    }
}
