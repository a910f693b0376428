//! aiotaskq — distributed task queue.
//!
//! A client publishes a named call over a Redis-backed pub/sub [`transport`];
//! a [`worker::WorkerManager`] fans it out round-robin to one of its
//! [`worker::GruntWorker`] child processes, which resolves the call against
//! its [`registry::TaskRegistry`], executes it, and reports the outcome back
//! through a per-call result channel, consulting the [`retry`] engine on
//! failure.
//!
//! ## Module structure
//!
//! - `error`: error kinds raised across the client, transport, and worker runtime
//! - `config`: environment-driven configuration
//! - `constants`: channel name / key templates
//! - `transport`: pub/sub abstraction and its Redis implementation
//! - `codec`: wire format encode/decode
//! - `task`: `Task`, `AsyncResult`, `apply_async`
//! - `registry`: per-process task registry
//! - `retry`: retry counter storage and policy evaluation
//! - `worker`: Worker Manager / Grunt Worker runtime
//! - `cli`: `worker <APP>` command-line surface

pub mod cli;
pub mod codec;
pub mod config;
pub mod constants;
pub mod error;
pub mod registry;
pub mod retry;
pub mod task;
pub mod transport;
pub mod worker;

pub use config::Config;
pub use error::{ClientError, TaskExecutionError, TransportError};
pub use registry::TaskRegistry;
pub use task::{AsyncResult, RetryOptions, Task};
