//! Tether demo target - a scripted program that can be attached to
//!
//! Runs a few looping worker threads on the simulated engine and exposes
//! them to controllers in either direction.
//!
//! # Usage
//!
//! ```bash
//! # Wait for a controller on 127.0.0.1:5678
//! tether-target --listen 127.0.0.1:5678
//!
//! # Dial a listening controller, presenting a token
//! tether-target --connect 127.0.0.1:5678 --token s3cret
//! ```

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tether_core::{Address, AttachConfig};
use tether_target::{install_global, AttachOutcome, SimulatedEngine, Statement, TargetHost, ThreadScript};

/// Demo target for tether controllers
#[derive(Parser, Debug)]
#[command(name = "tether-target", version, about)]
struct Args {
    /// Accept controllers on this address
    #[arg(long, conflicts_with = "connect", default_value = "127.0.0.1:5678")]
    listen: Address,

    /// Dial a controller listening on this address instead
    #[arg(long)]
    connect: Option<Address>,

    /// Token presented when dialing a controller
    #[arg(long, requires = "connect")]
    token: Option<String>,

    /// Block until a controller is bound before starting the workers
    #[arg(long)]
    wait_for_client: bool,

    /// Write target logs to this file instead of stderr
    #[arg(long)]
    log_to: Option<PathBuf>,

    /// Number of worker threads
    #[arg(long, default_value_t = 2)]
    workers: u32,
}

fn worker(index: u32) -> ThreadScript {
    ThreadScript::new(format!("worker-{index}"), "demo.rs")
        .function("work")
        .var("running", "yes")
        .body(vec![
            Statement::print(10, format!("worker {index} tick")),
            Statement::sleep(11, Duration::from_millis(500)),
            Statement::breakpoint(12),
            Statement::exit_if(13, "running", "no"),
        ])
        .forever()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.log_to.is_none() {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env()
                    .add_directive("tether_target=info".parse()?)
                    .add_directive("tether_protocol=info".parse()?),
            )
            .with_writer(std::io::stderr)
            .init();
    }

    let mut config = match args.connect {
        Some(address) => {
            let config = AttachConfig::connect(address);
            match args.token {
                Some(token) => config.with_access_token(token),
                None => config,
            }
        }
        None => AttachConfig::listen(args.listen),
    };
    if let Some(path) = args.log_to {
        config = config.with_log_to(path);
    }

    let engine = SimulatedEngine::new();
    let host = install_global(Arc::new(TargetHost::new(Arc::new(engine.clone()))));
    info!(pid = process::id(), mode = %config.mode(), "Demo target starting");

    match host.attach(config).await.context("Attach failed")? {
        AttachOutcome::Listening { address } => println!("listening on {address}"),
        AttachOutcome::Connected { .. } => println!("connected to controller"),
    }

    if args.wait_for_client {
        host.wait_for_client(None).await;
    }
    for index in 0..args.workers {
        engine.spawn(worker(index));
    }

    let exit_code = tokio::select! {
        code = wait_for_exit(&engine) => code,
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Error waiting for Ctrl+C");
            }
            info!("Interrupted");
            0
        }
    };

    host.shutdown().await;
    info!(exit_code, "Demo target stopped");
    process::exit(exit_code);
}

async fn wait_for_exit(engine: &SimulatedEngine) -> i32 {
    loop {
        if let Some(code) = engine.wait_for_exit(Duration::from_secs(3600)).await {
            return code;
        }
    }
}
