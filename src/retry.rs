//! Retry engine: broker-held retry counters plus the decision of whether a
//! failed call should be republished or terminated.
//!
//! The counter lives in the broker's key/value side channel, not on the
//! pub/sub `Transport` — a second, narrow surface. `RetryStore` keeps that
//! surface separate from `Transport` the same way plain key/value commands
//! are kept on a multiplexed connection distinct from the pub/sub
//! connection.

use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::constants::{retry_counter_key, RETRY_COUNTER_TTL_SECONDS};
use crate::error::TransportError;

/// Read-modify-write access to broker-side retry counters.
#[async_trait]
pub trait RetryStore: Send {
    /// Read the current retry count for `call_id`, defaulting to 0 if unset.
    async fn get_count(&mut self, call_id: &str) -> Result<u32, TransportError>;

    /// Store `count` for `call_id` and refresh its TTL.
    async fn set_count(&mut self, call_id: &str, count: u32) -> Result<(), TransportError>;
}

/// Builds fresh `RetryStore` connections on demand, the same way
/// `transport::TransportFactory` builds `Transport` connections — one per
/// logical flow, swappable between a live Redis store and an in-memory one
/// in tests.
#[async_trait]
pub trait RetryStoreFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RetryStore>, TransportError>;
}

pub struct RedisRetryStore {
    conn: redis::aio::MultiplexedConnection,
}

impl RedisRetryStore {
    pub async fn connect(url: &str) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| TransportError::Unavailable {
            url: url.to_string(),
            message: e.to_string(),
        })?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Unavailable {
                url: url.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl RetryStore for RedisRetryStore {
    async fn get_count(&mut self, call_id: &str) -> Result<u32, TransportError> {
        let value: Option<u32> =
            redis::AsyncCommands::get(&mut self.conn, retry_counter_key(call_id))
                .await
                .map_err(|e| TransportError::Unavailable {
                    url: "redis".to_string(),
                    message: e.to_string(),
                })?;
        Ok(value.unwrap_or(0))
    }

    async fn set_count(&mut self, call_id: &str, count: u32) -> Result<(), TransportError> {
        let key = retry_counter_key(call_id);
        redis::AsyncCommands::set::<_, _, ()>(&mut self.conn, &key, count)
            .await
            .map_err(|e| TransportError::Unavailable {
                url: "redis".to_string(),
                message: e.to_string(),
            })?;
        redis::AsyncCommands::expire::<_, ()>(&mut self.conn, &key, RETRY_COUNTER_TTL_SECONDS)
            .await
            .map_err(|e| TransportError::Unavailable {
                url: "redis".to_string(),
                message: e.to_string(),
            })
    }
}

/// Connects to a fixed Redis URL, one fresh `RedisRetryStore` per
/// `connect()` call.
pub struct RedisRetryStoreFactory {
    url: String,
}

impl RedisRetryStoreFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl RetryStoreFactory for RedisRetryStoreFactory {
    async fn connect(&self) -> Result<Box<dyn RetryStore>, TransportError> {
        Ok(Box::new(RedisRetryStore::connect(&self.url).await?))
    }
}

/// In-memory retry counter store, used to unit-test the retry protocol
/// without a live Redis. Uses the same `Arc<Mutex<..>>`-shared-state
/// pattern as `transport::mock::InMemoryBroker`. TTL is a no-op here: an
/// in-memory test broker is dropped at the end of the test that owns it,
/// which already bounds the counter's lifetime.
#[derive(Clone, Default)]
pub struct InMemoryRetryStoreFactory {
    counts: Arc<Mutex<HashMap<String, u32>>>,
}

impl InMemoryRetryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RetryStoreFactory for InMemoryRetryStoreFactory {
    async fn connect(&self) -> Result<Box<dyn RetryStore>, TransportError> {
        Ok(Box::new(InMemoryRetryStore {
            counts: self.counts.clone(),
        }))
    }
}

pub struct InMemoryRetryStore {
    counts: Arc<Mutex<HashMap<String, u32>>>,
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn get_count(&mut self, call_id: &str) -> Result<u32, TransportError> {
        Ok(self
            .counts
            .lock()
            .expect("mock retry store lock poisoned")
            .get(call_id)
            .copied()
            .unwrap_or(0))
    }

    async fn set_count(&mut self, call_id: &str, count: u32) -> Result<(), TransportError> {
        self.counts
            .lock()
            .expect("mock retry store lock poisoned")
            .insert(call_id.to_string(), count);
        Ok(())
    }
}

/// The outcome of evaluating a failure against a call's retry policy and
/// current counter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Republish the original Task-request unchanged; this is the new count
    /// that was written to the broker.
    Republish { next_count: u32 },
    /// Retry budget exhausted, or the error does not match the policy:
    /// publish a terminal error result.
    Terminal,
}

/// Decide whether `error_tag` should trigger a retry, given `max_retries`
/// and the exception-class tags the call's retry policy matches on, and the
/// current broker-held count for this call.
///
/// A policy-mismatched error is always terminal, and a matching error is
/// republished only while `current_count < max_retries`.
pub fn decide(
    max_retries: u32,
    on: &std::collections::BTreeSet<String>,
    error_tag: &str,
    current_count: u32,
) -> RetryDecision {
    if !on.contains(error_tag) {
        return RetryDecision::Terminal;
    }
    if current_count < max_retries {
        RetryDecision::Republish {
            next_count: current_count + 1,
        }
    } else {
        RetryDecision::Terminal
    }
}

/// Exponential backoff with jitter for transport reconnect attempts in the
/// Manager/Grunt main loops. Not used for the task retry protocol itself,
/// which republishes immediately — this is for broker-connection loss only.
/// Capped so reconnect attempts don't grow unbounded.
pub fn calculate_backoff(attempt: u32, cap: Duration) -> Duration {
    let base_ms = 2u64.saturating_pow(attempt.min(16)) * 100;
    let jitter_ms = rand::rng().random_range(0..=100);
    Duration::from_millis(base_ms + jitter_ms).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn on(tags: &[&str]) -> BTreeSet<String> {
        tags.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn republishes_while_under_budget() {
        let decision = decide(2, &on(&["E1"]), "E1", 0);
        assert_eq!(decision, RetryDecision::Republish { next_count: 1 });

        let decision = decide(2, &on(&["E1"]), "E1", 1);
        assert_eq!(decision, RetryDecision::Republish { next_count: 2 });
    }

    #[test]
    fn terminal_once_budget_exhausted() {
        let decision = decide(2, &on(&["E1"]), "E1", 2);
        assert_eq!(decision, RetryDecision::Terminal);
    }

    #[test]
    fn terminal_on_mismatched_exception_class() {
        let decision = decide(2, &on(&["E1"]), "E2", 0);
        assert_eq!(decision, RetryDecision::Terminal);
    }

    #[tokio::test]
    async fn in_memory_retry_store_shares_counts_across_connections() {
        let factory = InMemoryRetryStoreFactory::new();

        let mut writer = factory.connect().await.unwrap();
        assert_eq!(writer.get_count("call-1").await.unwrap(), 0);
        writer.set_count("call-1", 1).await.unwrap();

        let mut reader = factory.connect().await.unwrap();
        assert_eq!(reader.get_count("call-1").await.unwrap(), 1);
        assert_eq!(reader.get_count("call-2").await.unwrap(), 0);
    }

    #[test]
    fn backoff_is_capped() {
        let cap = Duration::from_secs(5);
        for attempt in 0..20 {
            assert!(calculate_backoff(attempt, cap) <= cap);
        }
    }
}
