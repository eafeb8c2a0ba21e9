//! SWX switch process
//!
//! Brings up the EAL, creates one waiting data-plane thread per worker lcore
//! plus the main lcore executor, starts the fleet and then parks the main
//! thread in a signal loop.
//!
//! # Usage
//!
//! ```bash
//! # Defaults: dummy -n 4 -c 3 (main lcore 0, one worker on lcore 1)
//! swx-infra
//!
//! # Four lcores with a heartbeat on worker 2, from a config file
//! swx-infra --config swx.json --core-list 0-3
//!
//! # Dump worker states
//! kill -USR1 <pid>
//! ```

mod config;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use nix::sys::signal::{SigSet, Signal};
use swx_thread::Runtime;
use swx_thread::thread::block::{self, Block, Periodic};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "swx-infra")]
#[command(about = "SWX software switch worker runtime")]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Core mask in hex, replaces the configured core set
    #[arg(short = 'm', long, conflicts_with = "core_list")]
    core_mask: Option<String>,

    /// Core list (e.g. "0-3" or "0,2,4"), replaces the configured core set
    #[arg(short = 'l', long)]
    core_list: Option<String>,

    /// Number of memory channels
    #[arg(short = 'n', long)]
    memory_channels: Option<u32>,
}

fn load_config(args: Args) -> Result<Config, config::ConfigError> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(mask) = args.core_mask {
        config.set_core_mask(mask);
    }
    if let Some(list) = args.core_list {
        config.set_core_list(list);
    }
    if let Some(n) = args.memory_channels {
        config.eal.memory_channels = Some(n);
    }
    Ok(config)
}

fn heartbeat(worker: u32, config: &config::HeartbeatSection) -> Arc<dyn Block> {
    let beat = block::from_fn(move || {
        info!(worker, "Heartbeat");
        Ok(())
    })
    .named("heartbeat");
    Arc::new(Periodic::new(beat, config.period()))
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_ansi(false)
        .init();

    let args = Args::parse();
    info!("PID: {}", std::process::id());

    let config = match load_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // Only the signal loop below receives these; worker threads inherit the
    // blocked mask.
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGUSR1);
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    if let Err(e) = signals.thread_block() {
        error!(errno = %e, "Failed to block signals");
        return ExitCode::FAILURE;
    }

    let runtime = match Runtime::init(config.eal.builder(), config.threads) {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(errno = e.as_raw(), "Runtime initialization failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let eal = runtime.eal().config();
    info!(
        memory_channels = ?eal.memory_channels,
        passthrough = ?eal.passthrough,
        "EAL options left to the packet engine"
    );

    if let Some(worker) = config.heartbeat.thread_id {
        let block = heartbeat(worker, &config.heartbeat);
        let enabled = runtime.exec_on_main(move |ctx| ctx.registry().assign_block(block, worker));
        if let Err(e) = enabled.and_then(|res| res) {
            warn!(worker, "Heartbeat not enabled: {e}");
        }
    }

    if let Err(e) = runtime.start() {
        error!("Failed to start workers: {e}");
        runtime.shutdown(config.stop_timeout());
        return ExitCode::FAILURE;
    }
    info!(workers = runtime.registry().len(), "Workers started");

    loop {
        match signals.wait() {
            Ok(Signal::SIGUSR1) => {
                info!("Received SIGUSR1");
                for worker in runtime.registry().snapshot() {
                    info!("{worker}");
                }
            }
            Ok(signal) => {
                info!(%signal, "Shutting down");
                break;
            }
            Err(e) => {
                error!(errno = %e, "Signal wait failed");
                break;
            }
        }
    }

    runtime.shutdown(config.stop_timeout());
    ExitCode::SUCCESS
}
