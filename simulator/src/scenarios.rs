//! Built-in scenarios.

use rand::Rng;
use rand_distr::{Distribution, Exp};
use std::{fmt, str::FromStr, sync::Arc};
use ubsim_network::{
    scheduler::{Classification, Mode},
    switch, Config, Environment, Error, Flow, Listener, Path, PriorityMap, RunRegistry,
    Simulation, Switch, Talker, TokenBucketTalker, Topology,
};

/// Bandwidth of every link (bits per microsecond).
const BANDWIDTH: f64 = 1000.0;

/// Burst tolerance of every flow (bytes).
const BURSTINESS: f64 = 3000.0;

/// Mean payload of randomly sized frames (bytes).
const MEAN_PAYLOAD: usize = 750;

/// Added to the seed after every run.
const SEED_OFFSET: u64 = 4546;

/// Scenarios that can be selected from the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// Two talkers, one high- and one low-priority flow, one switch.
    Simple,
    /// Two high-priority flows on one talker and a low-priority flow, two switches in series.
    Interleaved,
    /// Like [Kind::Interleaved], but the high-priority flows come from separate talkers.
    Separate,
    /// One token-bucket talker with exponential inter-arrival times, directly to a listener.
    TokenBucket,
}

impl Kind {
    pub const ALL: [&'static str; 4] = ["simple", "interleaved", "separate", "token-bucket"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Interleaved => "interleaved",
            Self::Separate => "separate",
            Self::TokenBucket => "token-bucket",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "simple" => Ok(Self::Simple),
            "interleaved" => Ok(Self::Interleaved),
            "separate" => Ok(Self::Separate),
            "token-bucket" => Ok(Self::TokenBucket),
            _ => Err(format!("unknown scenario: {s}")),
        }
    }
}

/// Knobs shared by every scenario.
#[derive(Clone, Debug)]
pub struct Params {
    pub mode: Mode,
    pub classes: u8,
    pub seed: u64,

    /// Share of the bandwidth reserved for high-priority traffic (or, for
    /// [Kind::TokenBucket], the offered load relative to the flow's leaky rate).
    pub share: f64,
}

/// A scenario that builds a fresh simulation (with the next seed) on every call.
pub fn scenario(
    kind: Kind,
    params: Params,
) -> impl FnMut(&mut RunRegistry) -> Result<Simulation, Error> {
    let name = format!("{kind}-{:.2}-{}", params.share, params.mode);
    let mut seed = params.seed;
    move |registry| {
        let cfg = Config {
            name: name.clone(),
            seed,
            ..Default::default()
        };
        seed = seed.wrapping_add(SEED_OFFSET);
        let simulation = Simulation::new(cfg, registry);
        let env = simulation.environment();
        let topology = match kind {
            Kind::Simple => simple(env, &params)?,
            Kind::Interleaved => two_switches(env, &params, true)?,
            Kind::Separate => two_switches(env, &params, false)?,
            Kind::TokenBucket => token_bucket(env, &params)?,
        };
        env.install(topology)?;
        Ok(simulation)
    }
}

/// Payload sizes drawn uniformly around [MEAN_PAYLOAD] from the run's generator.
fn payloads(env: &Environment) -> impl Iterator<Item = usize> + Send + 'static {
    let mut rng = env.context().clone();
    std::iter::repeat_with(move || rng.gen_range(2..=MEAN_PAYLOAD * 2 - 2))
}

/// Exponentially distributed gaps between frames of `bits` offered at `rate` bits per
/// microsecond.
fn gaps(
    env: &Environment,
    bits: f64,
    rate: f64,
) -> Result<impl Iterator<Item = f64> + Send + 'static, Error> {
    let exp = Exp::new(rate / bits).map_err(|_| Error::InvalidLeakyRate(rate))?;
    let mut rng = env.context().clone();
    Ok(std::iter::repeat_with(move || exp.sample(&mut rng)))
}

fn switch_config(params: &Params, classification: Classification) -> Result<switch::Config, Error> {
    let mut cfg = switch::Config::new(PriorityMap::new(params.classes)?, params.mode);
    cfg.classification = classification;
    cfg.monitor = true;
    Ok(cfg)
}

fn simple(env: &Environment, params: &Params) -> Result<Topology, Error> {
    let high = Flow::new(
        1,
        Path::new(["talker1", "switch", "listener"])?,
        BANDWIDTH * params.share,
        BURSTINESS,
    )?;
    let low = Flow::new(
        2,
        Path::new(["talker2", "switch", "listener"])?,
        0.999 * BANDWIDTH * (1.0 - params.share),
        BURSTINESS,
    )?;

    let talker1 = Talker::new(env, "talker1", true);
    talker1.add_flow_with(Arc::new(high), 3, payloads(env))?;
    let talker2 = Talker::new(env, "talker2", true);
    talker2.add_flow_with(Arc::new(low), 2, payloads(env))?;
    let switch = Switch::new(env, "switch", switch_config(params, Classification::Sender)?);

    let mut topology = Topology::default();
    topology.add(talker1)?;
    topology.add(talker2)?;
    topology.add(switch)?;
    topology.add(Listener::new(env, "listener"))?;
    topology.multi_connect("switch", BANDWIDTH, ["talker1", "talker2", "listener"])?;
    Ok(topology)
}

fn two_switches(env: &Environment, params: &Params, interleaved: bool) -> Result<Topology, Error> {
    let mut path = Path::new(["talker1", "switch1", "switch2", "listener"])?;
    path.append(["talker12", "switch1", "switch2", "listener"])?;
    let high_rate = BANDWIDTH * params.share / 2.0;
    let high1 = Arc::new(Flow::new(1, path.clone(), high_rate, BURSTINESS)?);
    let high2 = Arc::new(Flow::new(2, path, high_rate, BURSTINESS)?);
    let low = Arc::new(Flow::new(
        3,
        Path::new(["talker2", "switch1", "switch2", "listener"])?,
        0.999 * BANDWIDTH * (1.0 - params.share),
        BURSTINESS,
    )?);

    let talker1 = Talker::new(env, "talker1", true);
    let talker12 = Talker::new(env, "talker12", true);
    talker1.add_flow_with(high1, 3, payloads(env))?;
    if interleaved {
        talker1.add_flow_with(high2, 3, payloads(env))?;
    } else {
        talker12.add_flow_with(high2, 3, payloads(env))?;
    }
    let talker2 = Talker::new(env, "talker2", true);
    talker2.add_flow_with(low, 2, payloads(env))?;

    // The second hop keeps the upstream class apart
    let switch1 = Switch::new(env, "switch1", switch_config(params, Classification::Sender)?);
    let switch2 = Switch::new(
        env,
        "switch2",
        switch_config(params, Classification::SenderAndClass)?,
    );

    let mut topology = Topology::default();
    topology.add(talker1)?;
    topology.add(talker12)?;
    topology.add(talker2)?;
    topology.add(switch1)?;
    topology.add(switch2)?;
    topology.add(Listener::new(env, "listener"))?;
    topology.multi_connect(
        "switch1",
        BANDWIDTH,
        ["talker1", "talker12", "talker2", "switch2"],
    )?;
    topology.connect("switch2", "listener", BANDWIDTH)?;
    Ok(topology)
}

fn token_bucket(env: &Environment, params: &Params) -> Result<Topology, Error> {
    let payload = 599;
    let flow = Arc::new(Flow::new(
        1,
        Path::new(["talker", "listener"])?,
        BANDWIDTH * 0.05,
        1500.0,
    )?);
    let bits = ((payload + ubsim_network::DEFAULT_HEADER) * 8) as f64;
    let offered = flow.leaky_rate() * params.share;
    let talker = TokenBucketTalker::new(
        env,
        "talker",
        flow,
        0,
        std::iter::repeat(payload),
        gaps(env, bits, offered)?,
        true,
    )?;

    let mut topology = Topology::default();
    topology.add(talker)?;
    topology.add(Listener::new(env, "listener"))?;
    topology.connect("talker", "listener", BANDWIDTH)?;
    Ok(topology)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ubsim_network::simulate_multiple;

    fn params(mode: Mode) -> Params {
        Params {
            mode,
            classes: 8,
            seed: 7,
            share: 0.5,
        }
    }

    #[test]
    fn test_parse_kind() {
        for name in Kind::ALL {
            assert_eq!(name.parse::<Kind>().unwrap().as_str(), name);
        }
        assert!("fifo".parse::<Kind>().is_err());
    }

    #[test]
    fn test_scenarios_run() {
        let kinds = [
            Kind::Simple,
            Kind::Interleaved,
            Kind::Separate,
            Kind::TokenBucket,
        ];
        for kind in kinds {
            let mut scenario = scenario(kind, params(Mode::Lrq));
            let results = simulate_multiple(&mut scenario, 2, 2_000.0).unwrap();
            assert!(!results.talker.is_empty(), "{kind}");
            assert_eq!(results.metrics.len(), 2);
            if kind != Kind::TokenBucket {
                assert!(!results.switch.is_empty(), "{kind}");
                assert!(!results.queue.is_empty(), "{kind}");
            }
        }
    }

    #[test]
    fn test_reproducible() {
        let run = || {
            let mut scenario = scenario(Kind::Simple, params(Mode::Tbe));
            simulate_multiple(&mut scenario, 1, 1_000.0).unwrap().talker
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_seeds_advance() {
        let mut scenario = scenario(Kind::TokenBucket, params(Mode::Shapeless));
        let results = simulate_multiple(&mut scenario, 3, 500.0).unwrap();
        let mut seeds: Vec<_> = results.talker.iter().map(|r| (r.sim_id, r.seed)).collect();
        seeds.dedup();
        assert_eq!(seeds, vec![(1, 7), (2, 7 + SEED_OFFSET), (3, 7 + 2 * SEED_OFFSET)]);
    }

    #[test]
    fn test_invalid_share() {
        let mut params = params(Mode::Lrq);
        params.share = 1.0;
        let mut scenario = scenario(Kind::Simple, params);
        assert!(matches!(
            scenario(&mut RunRegistry::default()),
            Err(Error::InvalidLeakyRate(_))
        ));
    }
}
