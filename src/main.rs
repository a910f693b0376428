//! aiotaskq worker binary entrypoint.
//!
//! Parses the `worker <APP>` command, initializes structured logging, and
//! dispatches to the Worker Manager or, when re-exec'd with `--grunt`, a
//! single Grunt Worker. Top-level error aggregation uses `anyhow` on top of
//! the library's `thiserror` error types.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use aiotaskq::cli::{AppLoader, Cli, Command, EmptyAppLoader, WorkerArgs};
use aiotaskq::config::Config;
use aiotaskq::worker::manager::GruntSpawnArgs;
use aiotaskq::worker::{GruntWorker, WorkerManager};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(Config::log_level()))
        .init();

    let Command::Worker(args) = cli.command;

    let exit_code = match run_worker(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "worker exited with an error");
            1
        }
    };
    std::process::exit(exit_code);
}

async fn run_worker(args: WorkerArgs) -> Result<i32> {
    if args.concurrency_type != "multiprocessing" {
        tracing::error!(
            concurrency_type = %args.concurrency_type,
            "unsupported --concurrency-type, only `multiprocessing` is supported"
        );
        return Ok(1);
    }

    let broker_url = match args.broker_url.clone() {
        Some(url) => url,
        None => Config::from_env()
            .context("reading broker url from the environment")?
            .broker_url()
            .to_string(),
    };

    if args.grunt {
        return run_grunt(&args, &broker_url).await;
    }

    run_manager(&args, broker_url).await
}

async fn run_grunt(args: &WorkerArgs, broker_url: &str) -> Result<i32> {
    let loader: Arc<dyn AppLoader> = Arc::new(EmptyAppLoader);
    let registry = match loader.load(&args.app) {
        Ok(r) => r,
        Err(message) => {
            tracing::error!(app = %args.app, error = %message, "failed to resolve application");
            return Ok(1);
        }
    };

    let pid = std::process::id();
    let grunt = GruntWorker::new(
        pid,
        broker_url.to_string(),
        args.poll_interval_s,
        registry,
        args.worker_rate_limit,
    );

    spawn_signal_forwarder(grunt.shutdown_token());

    grunt.run().await.context("grunt worker terminated")?;
    Ok(0)
}

async fn run_manager(args: &WorkerArgs, broker_url: String) -> Result<i32> {
    let concurrency = args.concurrency.unwrap_or_else(num_cpus);
    let exe = std::env::current_exe().context("resolving own executable path")?;

    let spawn_args = GruntSpawnArgs {
        exe,
        app: args.app.clone(),
        broker_url: broker_url.clone(),
        poll_interval_s: args.poll_interval_s,
        worker_rate_limit: args.worker_rate_limit,
    };

    let manager = WorkerManager::start(broker_url, args.poll_interval_s, concurrency, spawn_args)
        .await
        .context("failed to start worker manager")?;

    spawn_signal_forwarder(manager.shutdown_token());

    manager.run().await.context("worker manager terminated")?;
    Ok(0)
}

/// Forward SIGTERM/SIGINT into a `CancellationToken` so the signal handler
/// itself only records the event; the scheduler drains in-flight work on
/// its own terms instead of running arbitrary code inside the handler.
fn spawn_signal_forwarder(token: tokio_util::sync::CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
        token.cancel();
    });
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
