//! Error kinds raised across the client, transport, and worker runtime.
//!
//! Each variant here corresponds to one row of the Error Kinds table in the
//! system specification: validation errors stay local to the caller, while
//! `TaskExecutionError` variants are the ones a Grunt Worker may turn into
//! either a retry or a terminal `AsyncResult`.

use thiserror::Error;

/// Errors raised locally by `Task::apply_async`, before anything is published.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid arguments for task {qualified_name}: {message}")]
    InvalidArgument {
        qualified_name: String,
        message: String,
    },

    #[error("invalid retry options: `on` must not be empty")]
    InvalidRetryOptions,

    #[error("no worker is subscribed to the shared task channel")]
    WorkerNotReady,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("task call failed: {0}")]
    Task(EncodedError),
}

/// Errors raised by a `Transport` implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker at {url} is unavailable: {message}")]
    Unavailable { url: String, message: String },

    #[error("unsupported broker url scheme: {0}")]
    UrlUnsupported(String),
}

/// Errors raised while encoding/decoding wire messages.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unknown wire format tag: {0:?}")]
    UnknownTag(String),

    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("message is missing the `{0}` tag separator")]
    MissingTagSeparator,
}

/// Errors raised while a Grunt Worker resolves and runs a task body.
#[derive(Debug, Error)]
pub enum TaskExecutionError {
    #[error("task `{0}` is not registered on this worker")]
    TaskNotRegistered(String),

    #[error("task raised an error: {0}")]
    User(EncodedError),
}

/// The opaque, wire-serializable encoding of an error kind plus a human
/// message, used for the `error` field of an `AsyncResult` and for a user
/// task's raised exception.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct EncodedError {
    pub kind: String,
    pub message: String,
}

impl std::fmt::Display for EncodedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl EncodedError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn task_not_registered(qualified_name: &str) -> Self {
        Self::new(
            "TaskNotRegistered",
            format!("task `{qualified_name}` is not registered on this worker"),
        )
    }
}

impl TaskExecutionError {
    /// The stable tag used to match this error against a retry policy's `on` set.
    pub fn tag(&self) -> &str {
        match self {
            TaskExecutionError::TaskNotRegistered(_) => "TaskNotRegistered",
            TaskExecutionError::User(e) => &e.kind,
        }
    }

    pub fn into_encoded(self) -> EncodedError {
        match self {
            TaskExecutionError::TaskNotRegistered(name) => EncodedError::task_not_registered(&name),
            TaskExecutionError::User(e) => e,
        }
    }
}
