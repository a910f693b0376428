//! Pub/sub transport abstraction.
//!
//! A `Transport` is a scoped, single-owner connection: callers construct one
//! per logical flow (a client call, a Grunt's main loop, the Manager's
//! fan-out loop) rather than sharing a process-wide singleton.

mod redis;
pub mod mock;

pub use mock::{InMemoryBroker, InMemoryTransport, InMemoryTransportFactory};
pub use redis::RedisTransport;

use async_trait::async_trait;

use crate::error::TransportError;

/// Abstract publish/subscribe primitive with scoped lifetime and polling
/// semantics.
///
/// Delivery is at-most-once per subscriber at the broker level; messages
/// published while no subscriber is present on a channel are lost. Callers
/// needing at-least-once semantics for task requests rely on the retry
/// engine, not on this trait.
#[async_trait]
pub trait Transport: Send {
    /// Publish `payload` to `channel`.
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Start subscribing to `channel`. Idempotent per connection.
    async fn subscribe(&mut self, channel: &str) -> Result<(), TransportError>;

    /// Block cooperatively until a message arrives on any subscribed
    /// channel, ignoring subscription acknowledgements, polling on an
    /// internal interval.
    async fn poll(&mut self) -> Result<Vec<u8>, TransportError>;

    /// Return the number of subscribers currently on `channel`, used by the
    /// client for a readiness check before publishing a task request.
    async fn num_subscribers(&mut self, channel: &str) -> Result<u64, TransportError>;
}

/// Builds fresh `Transport` connections on demand. Each logical flow (a
/// client call, a Grunt's main loop, the Manager's fan-out loop) asks its
/// factory for a new connection rather than sharing one, preserving
/// `Transport`'s single-owner contract while still letting callers swap the
/// underlying broker — a live Redis in production, an in-process
/// `InMemoryBroker` in tests (see `mock`).
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError>;
}

/// Connects to a fixed Redis URL, one fresh connection per `connect()` call.
pub struct RedisTransportFactory {
    url: String,
    poll_interval_s: f64,
}

impl RedisTransportFactory {
    pub fn new(url: impl Into<String>, poll_interval_s: f64) -> Self {
        Self {
            url: url.into(),
            poll_interval_s,
        }
    }
}

#[async_trait]
impl TransportFactory for RedisTransportFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(connect(&self.url, self.poll_interval_s).await?))
    }
}

/// Construct the `Transport` implementation appropriate for `url`.
///
/// Currently only `redis://` and `rediss://` URLs are supported; any other
/// scheme fails fast with `TransportError::UrlUnsupported`.
pub async fn connect(url: &str, poll_interval_s: f64) -> Result<RedisTransport, TransportError> {
    if !(url.starts_with("redis://") || url.starts_with("rediss://") || url.starts_with("redis+unix://")) {
        return Err(TransportError::UrlUnsupported(url.to_string()));
    }
    RedisTransport::connect(url, poll_interval_s).await
}
