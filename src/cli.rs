//! `worker <APP>` command-line surface.
//!
//! Uses `clap`'s derive macros, with env fallbacks on the flags that also
//! have an environment-variable form (concurrency, broker url).

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "aiotaskq-worker", version, about = "Distributed task queue worker")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Start a Worker Manager (default) or, internally, a single Grunt.
    Worker(WorkerArgs),
}

#[derive(Debug, clap::Args)]
pub struct WorkerArgs {
    /// Import-path-like string identifying the application to load.
    /// Resolution itself is an external collaborator; this crate only
    /// carries the string through to an `AppLoader`.
    pub app: String,

    #[arg(long, env = "AIOTASKQ_CONCURRENCY")]
    pub concurrency: Option<usize>,

    #[arg(long = "poll-interval-s", env = "AIOTASKQ_POLL_INTERVAL_S", default_value_t = 0.01)]
    pub poll_interval_s: f64,

    #[arg(long = "concurrency-type", default_value = "multiprocessing")]
    pub concurrency_type: String,

    #[arg(long = "worker-rate-limit", default_value_t = -1)]
    pub worker_rate_limit: i64,

    #[arg(long, env = "BROKER_URL")]
    pub broker_url: Option<String>,

    /// Internal flag set on the child command line by the Worker Manager
    /// when it re-execs itself to run a single Grunt Worker instead of the
    /// Manager. Not part of the public CLI surface.
    #[arg(long, hide = true)]
    pub grunt: bool,
}

/// Resolves `<APP>` to a populated `TaskRegistry`. Task-module discovery and
/// application bootstrap are external collaborators; this trait is the seam
/// a real bootstrap implementation plugs into. The only implementation this
/// crate ships is `EmptyAppLoader`, which resolves every app path to an
/// empty registry — enough to exercise the Manager and Grunt runtime paths
/// without depending on an external task-module loader.
pub trait AppLoader: Send + Sync {
    fn load(&self, app: &str) -> Result<crate::registry::TaskRegistry, String>;
}

pub struct EmptyAppLoader;

impl AppLoader for EmptyAppLoader {
    fn load(&self, _app: &str) -> Result<crate::registry::TaskRegistry, String> {
        Ok(crate::registry::TaskRegistry::new())
    }
}
