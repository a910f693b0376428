//! Worker Manager: owns a fleet of Grunt Worker child processes, fans work
//! out to them round-robin, and propagates termination signals.
//!
//! The main loop is a `tokio::select!` between a shutdown signal and the
//! next inbound message, with a bounded drain-then-exit shutdown. Fan-out
//! targets a child OS process rather than an in-process task, so "join"
//! means waiting on `std::process::Child` handles.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::constants::{grunt_channel, TASKS_CHANNEL};
use crate::error::TransportError;
use crate::retry::calculate_backoff;
use crate::transport::{self, Transport};

/// Bounded wait for Grunts to exit after a terminate signal before they are
/// force-killed.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Reconnect attempts before `reconnect_until_ready` gives up and returns an
/// error instead of looping forever — bounds unrecoverable transport loss to
/// a finite retry window so `run` can propagate failure and let the process
/// exit, instead of stalling indefinitely.
const MAX_RECONNECT_ATTEMPTS: u32 = 20;

struct Grunt {
    pid: u32,
    child: Child,
}

/// Parameters needed to spawn a Grunt child process running this same
/// binary in grunt mode.
pub struct GruntSpawnArgs {
    pub exe: std::path::PathBuf,
    pub app: String,
    pub broker_url: String,
    pub poll_interval_s: f64,
    pub worker_rate_limit: i64,
}

/// Owns the Grunt fleet, the shared Transport, and the round-robin cursor.
pub struct WorkerManager {
    broker_url: String,
    poll_interval_s: f64,
    grunts: Vec<Grunt>,
    cursor: usize,
    shutdown: CancellationToken,
}

impl WorkerManager {
    /// Spawn `concurrency` Grunt child processes and subscribe to the shared
    /// task channel.
    pub async fn start(
        broker_url: String,
        poll_interval_s: f64,
        concurrency: usize,
        spawn: GruntSpawnArgs,
    ) -> Result<Self, TransportError> {
        let mut grunts = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            grunts.push(spawn_grunt(&spawn)?);
        }
        info!(count = grunts.len(), "worker manager: grunts spawned");

        Ok(Self {
            broker_url,
            poll_interval_s,
            grunts,
            cursor: 0,
            shutdown: CancellationToken::new(),
        })
    }

    /// A token that, when cancelled, causes `run` to begin graceful shutdown.
    /// Wired to SIGTERM/SIGINT in `main.rs`.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Poll the shared task channel, round-robin fan-out to a Grunt's
    /// private channel unchanged, until the shutdown token fires.
    pub async fn run(mut self) -> Result<(), TransportError> {
        let mut transport = self.reconnect_until_ready().await?;
        transport.subscribe(TASKS_CHANNEL).await?;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("worker manager: shutdown signal received");
                    break;
                }
                message = transport.poll() => {
                    match message {
                        Ok(payload) => {
                            let grunt_pid = self.next_grunt_pid();
                            let channel = grunt_channel(grunt_pid);
                            if let Err(e) = transport.publish(&channel, &payload).await {
                                error!(error = %e, "worker manager: failed to fan out to grunt, dropping message");
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "worker manager: transport error in main loop, reconnecting");
                            transport = self.reconnect_until_ready().await?;
                            transport.subscribe(TASKS_CHANNEL).await?;
                        }
                    }
                }
            }
        }

        self.shutdown_grunts().await;
        Ok(())
    }

    fn next_grunt_pid(&mut self) -> u32 {
        let pid = self.grunts[self.cursor % self.grunts.len()].pid;
        self.cursor = self.cursor.wrapping_add(1);
        pid
    }

    /// Reconnect with capped exponential backoff, giving up with an error
    /// once `MAX_RECONNECT_ATTEMPTS` is exceeded rather than retrying
    /// forever — unrecoverable transport loss is meant to terminate the
    /// worker, not stall it silently.
    async fn reconnect_until_ready(&self) -> Result<crate::transport::RedisTransport, TransportError> {
        let mut attempt = 0;
        loop {
            match transport::connect(&self.broker_url, self.poll_interval_s).await {
                Ok(t) => return Ok(t),
                Err(e) => {
                    if attempt >= MAX_RECONNECT_ATTEMPTS {
                        error!(error = %e, attempt, "worker manager: broker still unavailable, giving up");
                        return Err(e);
                    }
                    error!(error = %e, attempt, "worker manager: broker unavailable, backing off");
                    tokio::time::sleep(calculate_backoff(attempt, MAX_RECONNECT_BACKOFF)).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Send a terminate signal to every Grunt, wait with a bounded timeout,
    /// then force-kill any stragglers.
    async fn shutdown_grunts(mut self) {
        for grunt in &self.grunts {
            // SAFETY: sending SIGTERM to a child this process spawned.
            unsafe {
                libc::kill(grunt.pid as libc::pid_t, libc::SIGTERM);
            }
        }

        let deadline = tokio::time::Instant::now() + SHUTDOWN_TIMEOUT;
        for grunt in &mut self.grunts {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match tokio::time::timeout(remaining, grunt.child.wait()).await {
                Ok(Ok(status)) => info!(pid = grunt.pid, ?status, "grunt exited"),
                Ok(Err(e)) => warn!(pid = grunt.pid, error = %e, "error waiting on grunt"),
                Err(_) => {
                    warn!(pid = grunt.pid, "grunt did not exit in time, killing");
                    let _ = grunt.child.kill().await;
                }
            }
        }
    }
}

fn spawn_grunt(args: &GruntSpawnArgs) -> Result<Grunt, TransportError> {
    let mut command = Command::new(&args.exe);
    command
        .arg("worker")
        .arg(&args.app)
        .arg("--grunt")
        .arg("--broker-url")
        .arg(&args.broker_url)
        .arg("--poll-interval-s")
        .arg(args.poll_interval_s.to_string())
        .arg("--worker-rate-limit")
        .arg(args.worker_rate_limit.to_string())
        .stdin(Stdio::null())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|e| TransportError::Unavailable {
        url: args.broker_url.clone(),
        message: format!("failed to spawn grunt process: {e}"),
    })?;
    let pid = child.id().ok_or_else(|| TransportError::Unavailable {
        url: args.broker_url.clone(),
        message: "spawned grunt process has no pid".to_string(),
    })?;
    Ok(Grunt { pid, child })
}
