//! this binary starts the kvsub server
//!
//! `kvsub-server <JOBS_DIR> <MAX_THREADS> <MAX_BACKUPS> <FIFO_REGISTER_NAME>`
//!
//!     JOBS_DIR            directory containing the .job files to run
//!     MAX_THREADS         number of job-runner threads
//!     MAX_BACKUPS         ceiling on concurrent backup snapshots
//!     FIFO_REGISTER_NAME  path of the registration FIFO clients connect to
//!
//! Exits 0 on clean shutdown, non-zero on a configuration or
//! initialization failure.

use std::path::PathBuf;

use anyhow::Context;
use clap::{crate_version, App, Arg};
use kvsub::{Server, ServerConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

fn main() -> anyhow::Result<()> {
    // set up a tracing subscriber to log to STDERR
    subscriber_config();

    // parse command line args
    let matches = App::new("kvsub-server")
        .version(crate_version!())
        .author("strohs <strohs1@gmail.com>")
        .about("a multi-threaded key-value store server with key subscriptions")
        .arg(
            Arg::with_name("JOBS_DIR")
                .required(true)
                .index(1)
                .help("directory containing the .job files to run"),
        )
        .arg(
            Arg::with_name("MAX_THREADS")
                .required(true)
                .index(2)
                .help("number of job-runner threads"),
        )
        .arg(
            Arg::with_name("MAX_BACKUPS")
                .required(true)
                .index(3)
                .help("maximum number of concurrent backup snapshots"),
        )
        .arg(
            Arg::with_name("FIFO_REGISTER_NAME")
                .required(true)
                .index(4)
                .help("path of the registration FIFO clients connect to"),
        )
        .get_matches();

    let jobs_dir = PathBuf::from(matches.value_of("JOBS_DIR").unwrap());
    let max_threads: u32 = matches
        .value_of("MAX_THREADS")
        .unwrap()
        .parse()
        .context("Invalid max_threads value")?;
    let max_backups: u32 = matches
        .value_of("MAX_BACKUPS")
        .unwrap()
        .parse()
        .context("Invalid max_backups value")?;
    let registration_path = PathBuf::from(matches.value_of("FIFO_REGISTER_NAME").unwrap());

    let config = ServerConfig::build(jobs_dir, max_threads, max_backups, registration_path)
        .context("invalid server configuration")?;

    info!("kvsub-server {}", env!("CARGO_PKG_VERSION"));
    info!(
        "jobs dir: {}, job threads: {}, max backups: {}, registration FIFO: {}",
        config.jobs_dir.display(),
        config.max_threads,
        config.max_backups,
        config.registration_path.display()
    );

    Server::new(config).run()?;
    Ok(())
}

/// configures a tracing subscriber that will log to STDERR
fn subscriber_config() {
    let subscriber = FmtSubscriber::builder()
        // all spans/events with a level higher than TRACE (e.g, debug, info, warn, etc.)
        // will be written to stdout.
        .with_max_level(Level::INFO)
        // log to stderr instead of stdout
        .with_writer(std::io::stderr)
        // completes the builder.
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting tracing default subscriber failed");
}
