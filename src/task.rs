//! Task model and client-side `apply_async` flow: validate arguments
//! locally, copy-on-write for per-call overrides, generate a fresh call id,
//! publish, then subscribe-and-poll for the reply.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::codec::{self, FuncRef, TaskRequest, WireRetryOptions, WireTaskOptions};
use crate::constants::{results_channel, TASKS_CHANNEL};
use crate::error::{ClientError, EncodedError};
use crate::transport::{RedisTransportFactory, TransportFactory};

/// `{max_retries, on}` — attempt count limit and exception-class filter.
/// `on` must be non-empty whenever a `RetryOptions` is set, enforced at both
/// definition time (`Task::new`) and per-call override (`Task::with_retry`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOptions {
    pub max_retries: u32,
    pub on: BTreeSet<String>,
}

impl RetryOptions {
    pub fn new(max_retries: u32, on: impl IntoIterator<Item = String>) -> Result<Self, ClientError> {
        let on: BTreeSet<String> = on.into_iter().collect();
        if on.is_empty() {
            return Err(ClientError::InvalidRetryOptions);
        }
        Ok(Self { max_retries, on })
    }

    fn to_wire(&self) -> WireRetryOptions {
        WireRetryOptions {
            max_retries: self.max_retries,
            on: self.on.clone(),
        }
    }
}

/// Terminal outcome of a call: either a result value or an encoded error.
#[derive(Debug, Clone)]
pub struct AsyncResult {
    pub call_id: String,
    pub ready: bool,
    pub result: Option<Value>,
    pub error: Option<EncodedError>,
}

impl AsyncResult {
    /// Consume the `AsyncResult`, returning its value or the encoded error
    /// as a `ClientError::Task`.
    pub fn into_result(self) -> Result<Value, ClientError> {
        match self.error {
            Some(e) => Err(ClientError::Task(e)),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// A named, registrable function together with an optional retry policy.
/// A `Task` instance is immutable on the client side; `with_retry` returns
/// a copy, never mutates in place.
#[derive(Clone)]
pub struct Task {
    module: Arc<str>,
    qualname: Arc<str>,
    retry: Option<RetryOptions>,
    /// Number of positional arguments the underlying function declares, if
    /// known. Used to bind-check `args` — the closest equivalent available
    /// without runtime reflection over a Rust function's signature.
    arity: Option<usize>,
}

impl Task {
    /// Define a new task bound to `module.qualname`, the registry lookup key
    /// a worker will use to resolve it.
    pub fn new(module: impl Into<Arc<str>>, qualname: impl Into<Arc<str>>) -> Self {
        Self {
            module: module.into(),
            qualname: qualname.into(),
            retry: None,
            arity: None,
        }
    }

    /// Declare the number of positional arguments the underlying function
    /// expects, enabling `apply_async` to reject a mismatched call locally
    /// before publishing.
    pub fn with_arity(mut self, arity: usize) -> Self {
        self.arity = Some(arity);
        self
    }

    /// Attach a definition-time retry policy. Fails if `on` is empty.
    pub fn with_definition_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.qualname)
    }

    /// Bind-check `args` against the declared `arity`. A task with no
    /// declared arity accepts any positional argument list.
    fn validate_arity(&self, args: &Value) -> Result<(), ClientError> {
        let Some(expected) = self.arity else {
            return Ok(());
        };
        let actual = match args {
            Value::Array(items) => items.len(),
            Value::Null => 0,
            _ => {
                return Err(ClientError::InvalidArgument {
                    qualified_name: self.qualified_name(),
                    message: "args must serialize to a JSON array".to_string(),
                })
            }
        };
        if actual != expected {
            return Err(ClientError::InvalidArgument {
                qualified_name: self.qualified_name(),
                message: format!("expected {expected} positional argument(s), got {actual}"),
            });
        }
        Ok(())
    }

    /// Return a copy of this task with a per-call retry override. `on` must
    /// be non-empty.
    pub fn with_retry(
        &self,
        max_retries: u32,
        on: impl IntoIterator<Item = String>,
    ) -> Result<Self, ClientError> {
        let retry = RetryOptions::new(max_retries, on)?;
        let mut copy = self.clone();
        copy.retry = Some(retry);
        Ok(copy)
    }

    /// Call this task asynchronously: validate, generate a call id, publish
    /// to the shared task channel, then await the reply on the per-call
    /// result channel.
    ///
    /// `args`/`kwargs` are serialized as provided; argument-binding against
    /// the underlying function's declared signature is expected to have
    /// already happened via a typed wrapper generated at the call site —
    /// this crate validates only that `args`/`kwargs` serialize, which is
    /// the boundary a systems-language binding can enforce without runtime
    /// introspection of a dynamically-typed signature.
    pub async fn apply_async<A: Serialize, K: Serialize>(
        &self,
        broker_url: &str,
        poll_interval_s: f64,
        args: &A,
        kwargs: &K,
    ) -> Result<AsyncResult, ClientError> {
        let factory = RedisTransportFactory::new(broker_url, poll_interval_s);
        self.apply_async_via(&factory, args, kwargs).await
    }

    /// Same flow as `apply_async`, but connects via an injected
    /// `TransportFactory` instead of dialing Redis directly — this is what
    /// lets the client/registry/retry-engine flow be exercised in tests
    /// against an in-memory broker (`transport::InMemoryBroker`) rather
    /// than a live Redis instance.
    pub async fn apply_async_via<A: Serialize, K: Serialize>(
        &self,
        transport_factory: &dyn TransportFactory,
        args: &A,
        kwargs: &K,
    ) -> Result<AsyncResult, ClientError> {
        let args_value = serde_json::to_value(args).map_err(|e| ClientError::InvalidArgument {
            qualified_name: self.qualified_name(),
            message: e.to_string(),
        })?;
        let kwargs_value =
            serde_json::to_value(kwargs).map_err(|e| ClientError::InvalidArgument {
                qualified_name: self.qualified_name(),
                message: e.to_string(),
            })?;

        self.validate_arity(&args_value)?;

        let call_id = Uuid::new_v4().to_string();

        let request = TaskRequest {
            func: FuncRef {
                module: self.module.to_string(),
                qualname: self.qualname.to_string(),
            },
            task_id: Some(call_id.clone()),
            args: Some(args_value),
            kwargs: Some(kwargs_value),
            options: WireTaskOptions {
                retry: self.retry.as_ref().map(RetryOptions::to_wire),
            },
        };

        let mut publish_transport = transport_factory.connect().await?;
        let ready = publish_transport.num_subscribers(TASKS_CHANNEL).await?;
        if ready == 0 {
            return Err(ClientError::WorkerNotReady);
        }

        let payload = codec::encode_task_request(&request);
        publish_transport.publish(TASKS_CHANNEL, &payload).await?;

        let mut result_transport = transport_factory.connect().await?;
        let channel = results_channel(&call_id);
        result_transport.subscribe(&channel).await?;
        let message = result_transport.poll().await?;

        let wire_result = codec::decode_async_result(&message)?;
        Ok(AsyncResult {
            call_id: wire_result.task_id,
            ready: wire_result.ready,
            result: wire_result.result,
            error: wire_result.error,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_options_reject_empty_on() {
        let err = RetryOptions::new(2, Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, ClientError::InvalidRetryOptions));
    }

    #[test]
    fn with_retry_copies_without_mutating_original() {
        let base = Task::new("myapp.tasks", "add");
        let overridden = base
            .clone()
            .with_retry(3, vec!["E1".to_string()])
            .unwrap();
        assert!(base.retry.is_none());
        assert!(overridden.retry.is_some());
    }

    #[test]
    fn with_retry_rejects_empty_on() {
        let base = Task::new("myapp.tasks", "add");
        let err = base.with_retry(3, Vec::<String>::new()).unwrap_err();
        assert!(matches!(err, ClientError::InvalidRetryOptions));
    }

    #[tokio::test]
    async fn apply_async_rejects_arity_mismatch_before_publishing() {
        let task = Task::new("myapp.tasks", "add").with_arity(2);
        let err = task
            .apply_async("redis://127.0.0.1:6399", 0.01, &serde_json::json!([1]), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument { .. }));
    }

    #[test]
    fn async_result_surfaces_error() {
        let result = AsyncResult {
            call_id: "c1".to_string(),
            ready: true,
            result: None,
            error: Some(EncodedError::new("E1", "boom")),
        };
        assert!(result.into_result().is_err());
    }

    #[test]
    fn async_result_surfaces_value() {
        let result = AsyncResult {
            call_id: "c1".to_string(),
            ready: true,
            result: Some(Value::from(42)),
            error: None,
        };
        assert_eq!(result.into_result().unwrap(), Value::from(42));
    }
}
