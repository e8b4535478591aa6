//! Run simulations for a fixed virtual-time budget and aggregate their telemetry.

use crate::{link, telemetry::Results, Environment, Error};
use std::collections::HashMap;
use tracing::{debug, info};
use ubsim_runtime::{
    deterministic::{self, Executor},
    Runner as _,
};

/// Configuration of a single simulation run.
#[derive(Clone, Debug)]
pub struct Config {
    /// Name shared by every run of the same scenario.
    pub name: String,

    /// Seed of the run's random number generator.
    pub seed: u64,

    /// Transmission parameters shared by every link.
    pub link: link::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "no_name".into(),
            seed: 42,
            link: link::Config::default(),
        }
    }
}

/// Tag attached to every telemetry row of a run.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Run {
    pub name: String,
    pub id: u64,
    pub seed: u64,
}

/// Hands out sequential run ids per simulation name, starting at 1.
#[derive(Debug, Default)]
pub struct RunRegistry {
    ids: HashMap<String, u64>,
}

impl RunRegistry {
    pub fn register(&mut self, name: &str) -> u64 {
        let id = self.ids.entry(name.to_string()).or_insert(0);
        *id += 1;
        *id
    }
}

/// A simulation under construction.
///
/// Nodes are created against [Simulation::environment], wired into a [crate::Topology] and
/// installed with [Environment::install] before calling [Simulation::run].
pub struct Simulation {
    runner: deterministic::Runner,
    env: Environment,
}

impl Simulation {
    pub fn new(cfg: Config, registry: &mut RunRegistry) -> Self {
        let (runner, context) = Executor::seeded(cfg.seed);
        let run = crate::Run {
            id: registry.register(&cfg.name),
            name: cfg.name,
            seed: cfg.seed,
        };
        debug!(name = %run.name, id = run.id, seed = run.seed, "simulation created");
        let env = Environment::new(context, run, cfg.link);
        Self { runner, env }
    }

    pub fn environment(&self) -> &Environment {
        &self.env
    }

    /// Run for `runtime` microseconds of virtual time and collect the telemetry of every
    /// monitored node.
    ///
    /// Fails with the first error raised by a node during the run.
    pub fn run(self, runtime: f64) -> Result<Results, Error> {
        let Self { runner, env } = self;
        env.topology()?;
        let outcome = runner.until(runtime).start(|_| async {});
        if let Some(err) = env.take_failure() {
            env.teardown();
            return Err(err);
        }
        if let Err(err) = outcome {
            env.teardown();
            return Err(err.into());
        }

        let mut results = env.collect();
        if let Ok(results) = results.as_mut() {
            results.metrics.push(env.encode_metrics());
        }
        env.teardown();
        let run = env.run();
        info!(
            name = %run.name,
            id = run.id,
            seed = run.seed,
            now = env.now(),
            "simulation finished"
        );
        results
    }
}

/// Builds a fresh simulation for every run of a batch.
pub trait Scenario {
    fn build(&mut self, registry: &mut RunRegistry) -> Result<Simulation, Error>;
}

impl<F> Scenario for F
where
    F: FnMut(&mut RunRegistry) -> Result<Simulation, Error>,
{
    fn build(&mut self, registry: &mut RunRegistry) -> Result<Simulation, Error> {
        self(registry)
    }
}

fn run_batch<S: Scenario + ?Sized>(
    scenario: &mut S,
    registry: &mut RunRegistry,
    count: usize,
    runtime: f64,
) -> Result<Results, Error> {
    let mut results = Results::default();
    for _ in 0..count {
        let simulation = scenario.build(registry)?;
        results.extend(simulation.run(runtime)?);
    }
    Ok(results)
}

/// Build and run `count` simulations from `scenario`, concatenating their telemetry.
pub fn simulate_multiple<S: Scenario + ?Sized>(
    scenario: &mut S,
    count: usize,
    runtime: f64,
) -> Result<Results, Error> {
    run_batch(scenario, &mut RunRegistry::default(), count, runtime)
}

/// [simulate_multiple] over each scenario in turn, sharing one registry.
pub fn simulate_multiple_multiple(
    scenarios: &mut [Box<dyn Scenario>],
    count: usize,
    runtime: f64,
) -> Result<Results, Error> {
    let mut registry = RunRegistry::default();
    let mut results = Results::default();
    for scenario in scenarios.iter_mut() {
        results.extend(run_batch(scenario.as_mut(), &mut registry, count, runtime)?);
    }
    Ok(results)
}
