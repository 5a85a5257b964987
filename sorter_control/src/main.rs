//! # Sorter Control Binary
//!
//! Real-time orchestration core for the industrial sorter.
//!
//! # Usage
//!
//! ```bash
//! # Run against the simulation backend with the built-in demo config
//! sorter_control --simulate
//!
//! # Run with a configuration file
//! sorter_control --config /etc/sorter/sorter.toml --simulate
//!
//! # Verbose logging / JSON logs
//! sorter_control -c sorter.toml -s -v --json
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sorter_common::clock::MonotonicClock;
use sorter_common::config::SorterConfig;
use sorter_control::classifier::StubClassifier;
use sorter_control::orchestrator::{DispatchMode, Orchestrator};
use sorter_control::safety::ProcSampler;
use sorter_hal::gpio::SimBackend;

/// Sorter control plane - real-time trigger → classify → divert core
#[derive(Parser, Debug)]
#[command(name = "sorter_control")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Real-time orchestration core for the industrial sorter")]
#[command(long_about = None)]
struct Args {
    /// Path to the configuration file (sorter.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run against the simulation GPIO backend and stub classifier
    #[arg(short = 's', long)]
    simulate: bool,

    /// Start the belt immediately after initialization
    #[arg(long)]
    autostart: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,
}

fn main() {
    if let Err(e) = run() {
        error!("startup failed: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter = if args.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = match &args.config {
        Some(path) => SorterConfig::load(path)?,
        None => {
            info!("no config file given; using the built-in demo snapshot");
            SorterConfig::example()
        }
    };

    if !args.simulate {
        // GPIO/PWM primitives are provided by the platform integration;
        // this build only ships the simulation backend.
        return Err("no hardware GPIO driver available; run with --simulate".into());
    }

    let backend = Arc::new(SimBackend::new());
    let clock = Arc::new(MonotonicClock::new());
    let mut orchestrator = Orchestrator::build(
        config,
        backend,
        Box::new(StubClassifier::new()),
        clock,
        DispatchMode::Workers,
        Box::new(ProcSampler::new()),
    )?;

    orchestrator.initialize()?;
    info!("sorter control plane initialized");

    if args.autostart {
        orchestrator.start()?;
        info!("belt started");
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        handler_flag.store(true, Ordering::Relaxed);
    })?;

    orchestrator.run(shutdown)?;

    info!("sorter control plane shut down");
    Ok(())
}
