//! In-process `Transport` implementation used to unit-test the client,
//! registry, and retry-engine flows without a live Redis broker.
//!
//! An `Arc<Mutex<..>>`-guarded in-memory queue stands in for the real
//! backend, shared between every `Transport` handle connected to the same
//! broker, the way separate Redis clients share state through the same
//! server.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::TransportError;
use crate::transport::{Transport, TransportFactory};

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, VecDeque<Vec<u8>>>,
    subscribers: HashMap<String, u64>,
}

/// Shared in-memory broker. Every `InMemoryTransport` built from the same
/// broker (via `factory`) sees the same channels and subscriber counts.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a `TransportFactory` that hands out fresh connections onto
    /// this broker.
    pub fn factory(&self, poll_interval_s: f64) -> InMemoryTransportFactory {
        InMemoryTransportFactory {
            broker: self.clone(),
            poll_interval: Duration::from_secs_f64(poll_interval_s.max(0.0)),
        }
    }
}

/// Builds `InMemoryTransport` handles connected to one `InMemoryBroker`.
#[derive(Clone)]
pub struct InMemoryTransportFactory {
    broker: InMemoryBroker,
    poll_interval: Duration,
}

#[async_trait]
impl TransportFactory for InMemoryTransportFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>, TransportError> {
        Ok(Box::new(InMemoryTransport {
            broker: self.broker.clone(),
            subscribed: Vec::new(),
            poll_interval: self.poll_interval,
        }))
    }
}

/// A single connection-like handle onto an `InMemoryBroker`, implementing
/// the same contract as `RedisTransport`: publishing to a channel with no
/// subscriber drops the message, and `poll` only ever returns messages on
/// channels this handle has subscribed to.
pub struct InMemoryTransport {
    broker: InMemoryBroker,
    subscribed: Vec<String>,
    poll_interval: Duration,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut state = self.broker.state.lock().expect("mock broker lock poisoned");
        if state.subscribers.get(channel).copied().unwrap_or(0) == 0 {
            return Ok(());
        }
        state
            .queues
            .entry(channel.to_string())
            .or_default()
            .push_back(payload.to_vec());
        Ok(())
    }

    async fn subscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        if self.subscribed.iter().any(|c| c == channel) {
            return Ok(());
        }
        let mut state = self.broker.state.lock().expect("mock broker lock poisoned");
        *state.subscribers.entry(channel.to_string()).or_insert(0) += 1;
        self.subscribed.push(channel.to_string());
        Ok(())
    }

    async fn poll(&mut self) -> Result<Vec<u8>, TransportError> {
        loop {
            {
                let mut state = self.broker.state.lock().expect("mock broker lock poisoned");
                for channel in &self.subscribed {
                    if let Some(payload) = state.queues.get_mut(channel).and_then(VecDeque::pop_front) {
                        return Ok(payload);
                    }
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn num_subscribers(&mut self, channel: &str) -> Result<u64, TransportError> {
        let state = self.broker.state.lock().expect("mock broker lock poisoned");
        Ok(state.subscribers.get(channel).copied().unwrap_or(0))
    }
}

impl Drop for InMemoryTransport {
    fn drop(&mut self) {
        if let Ok(mut state) = self.broker.state.lock() {
            for channel in &self.subscribed {
                if let Some(count) = state.subscribers.get_mut(channel) {
                    *count = count.saturating_sub(1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_is_dropped_without_a_subscriber() {
        let broker = InMemoryBroker::new();
        let factory = broker.factory(0.001);
        let mut publisher = factory.connect().await.unwrap();
        publisher.publish("chan", b"hello").await.unwrap();
        assert_eq!(publisher.num_subscribers("chan").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn subscribe_then_publish_delivers() {
        let broker = InMemoryBroker::new();
        let factory = broker.factory(0.001);
        let mut subscriber = factory.connect().await.unwrap();
        subscriber.subscribe("chan").await.unwrap();

        let mut publisher = factory.connect().await.unwrap();
        assert_eq!(publisher.num_subscribers("chan").await.unwrap(), 1);
        publisher.publish("chan", b"hello").await.unwrap();

        let payload = subscriber.poll().await.unwrap();
        assert_eq!(payload, b"hello");
    }

    #[tokio::test]
    async fn dropping_a_subscriber_decrements_the_count() {
        let broker = InMemoryBroker::new();
        let factory = broker.factory(0.001);
        let subscriber = factory.connect().await.unwrap();
        let mut subscriber = subscriber;
        subscriber.subscribe("chan").await.unwrap();
        drop(subscriber);

        let mut observer = factory.connect().await.unwrap();
        assert_eq!(observer.num_subscribers("chan").await.unwrap(), 0);
    }
}
