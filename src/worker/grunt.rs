//! Grunt Worker: single-process executor. Subscribes to its private
//! channel, decodes each call, executes it, consults the retry engine on
//! failure, and publishes a result.
//!
//! Execution is fire-and-forget `tokio::spawn` per unit of work, gated by an
//! `Arc`-shared semaphore: the permit count *is* the concurrency limit,
//! acquired before polling rather than just tracked after spawn.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::codec::{self, WireAsyncResult};
use crate::constants::{grunt_channel, results_channel, TASKS_CHANNEL};
use crate::error::{EncodedError, TaskExecutionError, TransportError};
use crate::registry::TaskRegistry;
use crate::retry::{self, calculate_backoff, RedisRetryStoreFactory, RetryDecision, RetryStore, RetryStoreFactory};
use crate::transport::{RedisTransportFactory, Transport, TransportFactory};
use crate::worker::UNLIMITED_RATE;

const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Reconnect attempts before `reconnect_until_ready` gives up and returns an
/// error instead of looping forever. With backoff capped at
/// `MAX_RECONNECT_BACKOFF` this bounds the retry window to a couple of
/// minutes of elapsed time rather than an unbounded wait.
const MAX_RECONNECT_ATTEMPTS: u32 = 20;

/// A single-process task executor. Owns its registry and, for its lifetime,
/// a rate-limiting semaphore.
pub struct GruntWorker {
    pid: u32,
    transport_factory: Arc<dyn TransportFactory>,
    retry_store_factory: Arc<dyn RetryStoreFactory>,
    registry: Arc<TaskRegistry>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl GruntWorker {
    /// `worker_rate_limit <= 0` disables the limit, realized as a large
    /// sentinel permit count rather than an unbounded semaphore.
    pub fn new(
        pid: u32,
        broker_url: String,
        poll_interval_s: f64,
        registry: TaskRegistry,
        worker_rate_limit: i64,
    ) -> Self {
        let transport_factory = Arc::new(RedisTransportFactory::new(broker_url.clone(), poll_interval_s));
        let retry_store_factory = Arc::new(RedisRetryStoreFactory::new(broker_url));
        Self::new_with_factories(pid, transport_factory, retry_store_factory, registry, worker_rate_limit)
    }

    /// Same as `new`, but connects via injected factories instead of dialing
    /// Redis directly — lets tests exercise the full Grunt execution path
    /// against an in-memory broker and retry store.
    pub fn new_with_factories(
        pid: u32,
        transport_factory: Arc<dyn TransportFactory>,
        retry_store_factory: Arc<dyn RetryStoreFactory>,
        registry: TaskRegistry,
        worker_rate_limit: i64,
    ) -> Self {
        let permits = if worker_rate_limit > 0 {
            worker_rate_limit as usize
        } else {
            UNLIMITED_RATE
        };
        Self {
            pid,
            transport_factory,
            retry_store_factory,
            registry: Arc::new(registry),
            permits: Arc::new(Semaphore::new(permits)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Subscribe to this Grunt's private channel and run the poll loop until
    /// the shutdown token fires.
    pub async fn run(self) -> Result<(), TransportError> {
        let own_channel = grunt_channel(self.pid);
        let mut transport = reconnect_until_ready(self.transport_factory.as_ref()).await?;
        transport.subscribe(&own_channel).await?;
        info!(pid = self.pid, channel = %own_channel, "grunt worker: ready");

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!(pid = self.pid, "grunt worker: shutdown signal received");
                    break;
                }
                permit = self.permits.clone().acquire_owned() => {
                    permit.expect("semaphore is never closed")
                }
            };

            let message = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    drop(permit);
                    info!(pid = self.pid, "grunt worker: shutdown signal received");
                    break;
                }
                message = transport.poll() => message,
            };

            let payload = match message {
                Ok(payload) => payload,
                Err(e) => {
                    drop(permit);
                    warn!(pid = self.pid, error = %e, "grunt worker: transport error, reconnecting");
                    transport = reconnect_until_ready(self.transport_factory.as_ref()).await?;
                    transport.subscribe(&own_channel).await?;
                    continue;
                }
            };

            let registry = self.registry.clone();
            let transport_factory = self.transport_factory.clone();
            let retry_store_factory = self.retry_store_factory.clone();
            tokio::spawn(async move {
                execute_call(&payload, &registry, &transport_factory, &retry_store_factory).await;
                drop(permit);
            });
        }

        Ok(())
    }
}

/// Decode, resolve, run, and settle one call. Detached from the main poll
/// loop so the Grunt keeps polling while this runs.
async fn execute_call(
    payload: &[u8],
    registry: &TaskRegistry,
    transport_factory: &Arc<dyn TransportFactory>,
    retry_store_factory: &Arc<dyn RetryStoreFactory>,
) {
    let request = match codec::decode_task_request(payload) {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "grunt worker: malformed task request, dropping");
            return;
        }
    };

    let Some(call_id) = request.task_id.clone() else {
        error!("grunt worker: task request missing task_id, dropping");
        return;
    };

    let qualified_name = request.func.qualified_name();
    let args = request.args.clone().unwrap_or(serde_json::Value::Null);
    let kwargs = request.kwargs.clone().unwrap_or(serde_json::Value::Null);

    let outcome = match registry.resolve(&qualified_name) {
        Ok(task) => (task.dispatch)(args, kwargs).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(result) => {
            publish_result(
                transport_factory,
                &call_id,
                WireAsyncResult {
                    task_id: call_id.clone(),
                    ready: true,
                    result: Some(result),
                    error: None,
                },
            )
            .await
        }
        Err(e) => handle_failure(transport_factory, retry_store_factory, &call_id, &request, e).await,
    }
}

/// Consult the retry policy on failure: republish unchanged on the shared
/// task channel and bump the broker-held counter, or publish a terminal
/// error.
async fn handle_failure(
    transport_factory: &Arc<dyn TransportFactory>,
    retry_store_factory: &Arc<dyn RetryStoreFactory>,
    call_id: &str,
    request: &crate::codec::TaskRequest,
    error: TaskExecutionError,
) {
    // Failure to resolve the call against the registry is fatal regardless
    // of the wire-carried retry policy — an unregistered task is a separate
    // error class from a matched-and-raised one. Consult this before the
    // retry-policy branch so a policy whose `on` set happens to include the
    // literal tag `"TaskNotRegistered"` can never republish it.
    if matches!(error, TaskExecutionError::TaskNotRegistered(_)) {
        publish_terminal(transport_factory, call_id, error.into_encoded()).await;
        return;
    }

    let tag = error.tag().to_string();

    if let Some(policy) = &request.options.retry {
        let mut store = match retry_store_factory.connect().await {
            Ok(s) => s,
            Err(e) => {
                error!(call_id, error = %e, "grunt worker: retry store unavailable, publishing terminal error");
                publish_terminal(transport_factory, call_id, error.into_encoded()).await;
                return;
            }
        };

        let current_count = match store.get_count(call_id).await {
            Ok(c) => c,
            Err(e) => {
                error!(call_id, error = %e, "grunt worker: failed to read retry counter");
                publish_terminal(transport_factory, call_id, error.into_encoded()).await;
                return;
            }
        };

        let decision = retry::decide(policy.max_retries, &policy.on, &tag, current_count);
        match decision {
            RetryDecision::Republish { next_count } => {
                if let Err(e) = store.set_count(call_id, next_count).await {
                    warn!(call_id, error = %e, "grunt worker: failed to persist retry counter, republishing anyway");
                }
                republish(transport_factory, call_id, request).await;
                return;
            }
            RetryDecision::Terminal => {}
        }
    }

    publish_terminal(transport_factory, call_id, error.into_encoded()).await;
}

async fn republish(
    transport_factory: &Arc<dyn TransportFactory>,
    call_id: &str,
    request: &crate::codec::TaskRequest,
) {
    let payload = codec::encode_task_request(request);
    let mut transport = match reconnect_until_ready(transport_factory.as_ref()).await {
        Ok(t) => t,
        Err(e) => {
            error!(call_id, error = %e, "grunt worker: broker unreachable, failed to republish, call is now stuck");
            return;
        }
    };
    match transport.publish(TASKS_CHANNEL, &payload).await {
        Ok(()) => info!(call_id, "grunt worker: republished for retry"),
        Err(e) => error!(call_id, error = %e, "grunt worker: failed to republish, call is now stuck"),
    }
}

async fn publish_terminal(
    transport_factory: &Arc<dyn TransportFactory>,
    call_id: &str,
    error: EncodedError,
) {
    publish_result(
        transport_factory,
        call_id,
        WireAsyncResult {
            task_id: call_id.to_string(),
            ready: true,
            result: None,
            error: Some(error),
        },
    )
    .await;
}

async fn publish_result(
    transport_factory: &Arc<dyn TransportFactory>,
    call_id: &str,
    result: WireAsyncResult,
) {
    let channel = results_channel(call_id);
    let payload = codec::encode_async_result(&result);
    let mut transport = match reconnect_until_ready(transport_factory.as_ref()).await {
        Ok(t) => t,
        Err(e) => {
            error!(call_id, channel = %channel, error = %e, "grunt worker: broker unreachable, failed to publish result");
            return;
        }
    };
    match transport.publish(&channel, &payload).await {
        Ok(()) => {}
        Err(e) => error!(call_id, channel = %channel, error = %e, "grunt worker: failed to publish result"),
    }
}

/// Reconnect with capped exponential backoff, giving up with an error once
/// `MAX_RECONNECT_ATTEMPTS` is exceeded rather than retrying forever —
/// unrecoverable transport loss is meant to terminate the worker, not stall
/// it silently.
async fn reconnect_until_ready(
    transport_factory: &dyn TransportFactory,
) -> Result<Box<dyn Transport>, TransportError> {
    let mut attempt = 0;
    loop {
        match transport_factory.connect().await {
            Ok(t) => return Ok(t),
            Err(e) => {
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    error!(error = %e, attempt, "grunt worker: broker still unavailable, giving up");
                    return Err(e);
                }
                error!(error = %e, attempt, "grunt worker: broker unavailable, backing off");
                tokio::time::sleep(calculate_backoff(attempt, MAX_RECONNECT_BACKOFF)).await;
                attempt += 1;
            }
        }
    }
}
