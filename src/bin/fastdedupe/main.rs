//! The binary entrypoint for `fastdedupe`: logging init, argument parsing,
//! driving the four phases, and exit-code handling.
//!
//! `color_eyre`/`tracing_subscriber` setup lives only here; every library
//! error crosses this boundary as a typed `fastdedupe::DedupeError` and is
//! wrapped with `eyre::Context` for human-facing reporting.

use std::process::ExitCode;

use color_eyre::eyre::{Result, WrapErr};
use fastdedupe::cli::Cli;
use fastdedupe::gateway::LinuxGateway;
use fastdedupe::gateway::RECURSIVE_DEFAULT_MIN_SIZE;
use fastdedupe::index::PersistentIndex;
use fastdedupe::Driver;
use tracing::{info, instrument};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

fn main() -> ExitCode {
    init_logging();
    color_eyre::install().expect("install color-eyre once");

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_filter(filter))
        .init();
}

#[instrument]
fn run() -> Result<()> {
    let options = match Cli::parse_options(std::env::args()) {
        Ok(options) => options,
        Err(err) => {
            eprintln!(
                "Usage: fastdedupe [--db-file file] [--update-extents] [--dedupe] [--input input] [--recursive] file1 file2"
            );
            eprintln!("{err}");
            std::process::exit(1);
        }
    };

    let gateway = LinuxGateway::new(RECURSIVE_DEFAULT_MIN_SIZE);
    let persistent = PersistentIndex::open(&options.db_file).wrap_err("open persistent index")?;
    let mut driver = Driver::new(&gateway, persistent);

    let seeds: Vec<_> = options.seeds.iter().cloned().collect();
    info!("loading files...");
    let patterns = driver.discover(&seeds, options.recursive).wrap_err("discover phase")?;

    info!("reading from database...");
    driver.replay(&patterns).wrap_err("replay phase")?;

    driver.refresh(options.update_extents).wrap_err("refresh phase")?;

    if options.dedupe {
        info!("fetching duplicates...");
        let failures = driver.dedupe().wrap_err("dedupe phase")?;
        for (reference, destinations) in &failures {
            for (dest, reason) in destinations {
                eprintln!("Could not dedupe '{}' (reference {}): {reason}", dest.display(), reference.display());
            }
        }
    }

    driver.close().wrap_err("commit persistent index")?;
    Ok(())
}
