//! Run urgency-based shaping scenarios and export their telemetry.

use clap::{value_parser, Arg, Command};
use std::collections::BTreeMap;
use tracing::{error, info, Level};
use ubsim_network::{scheduler::Mode, simulate_multiple, Results};

mod scenarios;
use scenarios::{scenario, Kind, Params};

/// Command line arguments parsed from user input
struct Arguments {
    kind: Kind,
    params: Params,
    count: usize,
    runtime: f64,
    output: Option<String>,
    log_level: Level,
}

fn main() {
    let args = parse_arguments();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();
    info!(
        scenario = %args.kind,
        mode = %args.params.mode,
        count = args.count,
        runtime = args.runtime,
        seed = args.params.seed,
        "starting simulations"
    );

    // Run simulations
    let mut scenario = scenario(args.kind, args.params);
    let results = match simulate_multiple(&mut scenario, args.count, args.runtime) {
        Ok(results) => results,
        Err(err) => {
            error!(%err, "simulation failed");
            std::process::exit(1);
        }
    };
    summarize(&results);

    // Export telemetry
    if let Some(prefix) = args.output {
        if let Err(err) = results.write_csv(&prefix) {
            error!(%err, %prefix, "failed to write results");
            std::process::exit(1);
        }
        info!(%prefix, "results written");
    }
}

/// Parse command line arguments and return structured data
fn parse_arguments() -> Arguments {
    let matches = Command::new("ubsim-simulator")
        .about("Run urgency-based shaping scenarios and export their telemetry")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            Arg::new("scenario")
                .required(true)
                .value_parser(Kind::ALL)
                .help("Scenario to simulate"),
        )
        .arg(
            Arg::new("mode")
                .long("mode")
                .default_value("lrq")
                .value_parser(["lrq", "tbe", "shapeless"])
                .help("Shaping discipline of every switch"),
        )
        .arg(
            Arg::new("count")
                .long("count")
                .default_value("1")
                .value_parser(value_parser!(usize))
                .help("Number of runs"),
        )
        .arg(
            Arg::new("runtime")
                .long("runtime")
                .default_value("35000")
                .value_parser(value_parser!(f64))
                .help("Virtual time of each run in microseconds"),
        )
        .arg(
            Arg::new("seed")
                .long("seed")
                .default_value("48544")
                .value_parser(value_parser!(u64))
                .help("Seed of the first run (later runs derive theirs from it)"),
        )
        .arg(
            Arg::new("share")
                .long("share")
                .default_value("0.5")
                .value_parser(value_parser!(f64))
                .help("Share of the bandwidth used by high-priority flows"),
        )
        .arg(
            Arg::new("classes")
                .long("classes")
                .default_value("8")
                .value_parser(value_parser!(u8).range(1..=8))
                .help("Number of traffic classes"),
        )
        .arg(
            Arg::new("output")
                .long("output")
                .value_parser(value_parser!(String))
                .help("Write <output>_talker.csv, <output>_switch.csv and <output>_queue.csv"),
        )
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .default_value("info")
                .value_parser(value_parser!(Level))
                .help("Maximum level of log output"),
        )
        .get_matches();

    // Values are validated by their parsers
    let kind = matches
        .get_one::<String>("scenario")
        .unwrap()
        .parse()
        .unwrap();
    let mode: Mode = matches
        .get_one::<String>("mode")
        .unwrap()
        .parse()
        .unwrap();
    let runtime = *matches.get_one::<f64>("runtime").unwrap();
    assert!(runtime >= 0.0, "runtime must not be negative");
    Arguments {
        kind,
        params: Params {
            mode,
            classes: *matches.get_one::<u8>("classes").unwrap(),
            seed: *matches.get_one::<u64>("seed").unwrap(),
            share: *matches.get_one::<f64>("share").unwrap(),
        },
        count: *matches.get_one::<usize>("count").unwrap(),
        runtime,
        output: matches.get_one::<String>("output").cloned(),
        log_level: *matches.get_one::<Level>("log-level").unwrap(),
    }
}

/// Log the number of delivered frames and their mean end-to-end delay per flow.
fn summarize(results: &Results) {
    let mut flows: BTreeMap<u64, (usize, f64)> = BTreeMap::new();
    for record in &results.talker {
        let Some(delay) = record.delay else {
            continue;
        };
        let (frames, total) = flows.entry(record.flow_id).or_default();
        *frames += 1;
        *total += delay;
    }
    for (flow, (frames, total)) in flows {
        info!(flow, frames, mean_delay = total / frames as f64, "flow summary");
    }
    info!(
        talker = results.talker.len(),
        switch = results.switch.len(),
        queue = results.queue.len(),
        "telemetry collected"
    );
}
