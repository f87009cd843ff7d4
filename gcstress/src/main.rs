extern crate clap;
extern crate env_logger;
extern crate genheap;
extern crate log;
extern crate rand;

use std::process;
use std::str::FromStr;

use clap::{App, Arg, ArgMatches};

use genheap::{constants, GcConfig};

mod error;
mod workload;

use crate::error::{ErrorKind, StressError};
use crate::workload::{Options, Report, Workload};

/// Parse the value of a flag that has a default
fn parse<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<T, StressError> {
    let value = matches.value_of(name).unwrap_or_default();
    value.parse().map_err(|_| {
        StressError::new(ErrorKind::BadArgument(format!(
            "invalid value '{}' for --{}",
            value, name
        )))
    })
}

fn config_from(matches: &ArgMatches) -> Result<GcConfig, StressError> {
    let max_heap_mib: usize = parse(matches, "max-heap")?;
    let init_heap_mib: usize = parse(matches, "init-heap")?;

    Ok(GcConfig::default()
        .with_max_heap_size(max_heap_mib * 1024 * 1024)
        .with_init_heap_size(init_heap_mib * 1024 * 1024)
        .with_occupancy_target(parse(matches, "occupancy")?)
        .with_concurrent(!matches.is_present("incremental")))
}

fn options_from(matches: &ArgMatches) -> Result<Options, StressError> {
    let roots: usize = parse(matches, "roots")?;
    if roots == 0 {
        return Err(StressError::new(ErrorKind::BadArgument(String::from(
            "at least one root is needed",
        ))));
    }

    Ok(Options {
        iterations: parse(matches, "iterations")?,
        roots,
        symbols: parse(matches, "symbols")?,
        seed: parse(matches, "seed")?,
        collect_every: parse(matches, "collect-every")?,
        finalizer_ratio: parse(matches, "finalizers")?,
        large_ratio: parse(matches, "large")?,
    })
}

fn print_report(report: &Report) {
    println!("allocations:     {}", report.allocations);
    println!("finalized:       {}", report.finalized);
    println!("dead symbols:    {}", report.dead_symbols);
    println!("heap:            {}", report.info);
    println!("collector:       {}", report.stats);
}

fn run(matches: &ArgMatches) -> Result<Report, StressError> {
    let config = config_from(matches)?;
    let options = options_from(matches)?;
    if !(0.0..=1.0).contains(&options.finalizer_ratio) || !(0.0..=1.0).contains(&options.large_ratio) {
        return Err(StressError::new(ErrorKind::BadArgument(String::from(
            "ratios must be between 0 and 1",
        ))));
    }

    log::info!(
        "{} iterations over {} roots, seed {}, {} mode",
        options.iterations,
        options.roots,
        options.seed,
        if config.concurrent { "concurrent" } else { "incremental" }
    );

    Workload::new(config, options)?.run()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let max_heap = format!("{}", constants::DEFAULT_MAX_HEAP_SIZE / (1024 * 1024));

    let matches = App::new("gcstress")
        .about("Drive the generational collector with a random mutator workload")
        .arg(
            Arg::with_name("iterations")
                .short("n")
                .long("iterations")
                .takes_value(true)
                .default_value("200000")
                .help("Number of mutator steps"),
        )
        .arg(
            Arg::with_name("roots")
                .long("roots")
                .takes_value(true)
                .default_value("256")
                .help("Number of root slots the workload keeps graphs in"),
        )
        .arg(
            Arg::with_name("symbols")
                .long("symbols")
                .takes_value(true)
                .default_value("64")
                .help("Number of symbols stored in cells"),
        )
        .arg(
            Arg::with_name("seed")
                .long("seed")
                .takes_value(true)
                .default_value("1")
                .help("Workload random seed"),
        )
        .arg(
            Arg::with_name("collect-every")
                .long("collect-every")
                .takes_value(true)
                .default_value("20000")
                .help("Steps between explicit collections, 0 for none"),
        )
        .arg(
            Arg::with_name("finalizers")
                .long("finalizers")
                .takes_value(true)
                .default_value("0.1")
                .help("Fraction of objects allocated with a finalizer"),
        )
        .arg(
            Arg::with_name("large")
                .long("large")
                .takes_value(true)
                .default_value("0.001")
                .help("Fraction of byte allocations that are large objects"),
        )
        .arg(
            Arg::with_name("max-heap")
                .long("max-heap")
                .takes_value(true)
                .default_value(&max_heap)
                .help("Maximum heap size in MiB"),
        )
        .arg(
            Arg::with_name("init-heap")
                .long("init-heap")
                .takes_value(true)
                .default_value("1")
                .help("Initial old generation size in MiB"),
        )
        .arg(
            Arg::with_name("occupancy")
                .long("occupancy")
                .takes_value(true)
                .default_value("0.75")
                .help("Old generation occupancy that starts a collection cycle"),
        )
        .arg(
            Arg::with_name("incremental")
                .long("incremental")
                .help("Run old generation cycles on the mutator thread"),
        )
        .get_matches();

    match run(&matches) {
        Ok(report) => print_report(&report),
        Err(err) => {
            eprintln!("Terminated: {}", err);
            if let ErrorKind::BadArgument(_) = err.error_kind() {
                eprintln!("{}", matches.usage());
            }
            process::exit(1);
        }
    }
}
