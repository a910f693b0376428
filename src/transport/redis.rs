//! Redis implementation of `Transport`.
//!
//! Splits Redis access between a dedicated `get_async_pubsub()` connection
//! (subscribed and polled in a loop) and a multiplexed connection for
//! one-shot commands. The pubsub connection is lazily created on first
//! `subscribe`/`poll`, and the separate multiplexed connection handles
//! `publish`/`num_subscribers`, which are plain Redis commands rather than
//! pubsub operations.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};

use crate::error::TransportError;
use crate::transport::Transport;

pub struct RedisTransport {
    client: redis::Client,
    url: String,
    poll_interval: Duration,
    command_conn: MultiplexedConnection,
    pubsub: Option<PubSub>,
}

impl RedisTransport {
    pub async fn connect(url: &str, poll_interval_s: f64) -> Result<Self, TransportError> {
        let client = redis::Client::open(url).map_err(|e| TransportError::Unavailable {
            url: url.to_string(),
            message: e.to_string(),
        })?;

        let command_conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| TransportError::Unavailable {
                url: url.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            url: url.to_string(),
            poll_interval: Duration::from_secs_f64(poll_interval_s.max(0.0)),
            command_conn,
            pubsub: None,
        })
    }

    async fn ensure_pubsub(&mut self) -> Result<&mut PubSub, TransportError> {
        if self.pubsub.is_none() {
            let ps = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| TransportError::Unavailable {
                    url: self.url.clone(),
                    message: e.to_string(),
                })?;
            self.pubsub = Some(ps);
        }
        Ok(self.pubsub.as_mut().expect("just inserted"))
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&mut self, channel: &str, payload: &[u8]) -> Result<(), TransportError> {
        redis::AsyncCommands::publish::<_, _, ()>(&mut self.command_conn, channel, payload)
            .await
            .map_err(|e| TransportError::Unavailable {
                url: self.url.clone(),
                message: e.to_string(),
            })
    }

    async fn subscribe(&mut self, channel: &str) -> Result<(), TransportError> {
        let url = self.url.clone();
        let pubsub = self.ensure_pubsub().await?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| TransportError::Unavailable {
                url,
                message: e.to_string(),
            })
    }

    async fn poll(&mut self) -> Result<Vec<u8>, TransportError> {
        let poll_interval = self.poll_interval;
        let url = self.url.clone();
        let pubsub = self.ensure_pubsub().await?;
        let mut stream = pubsub.on_message();
        loop {
            if let Some(msg) = stream.next().await {
                let payload: Vec<u8> = msg.get_payload().map_err(|e| TransportError::Unavailable {
                    url: url.clone(),
                    message: e.to_string(),
                })?;
                return Ok(payload);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    async fn num_subscribers(&mut self, channel: &str) -> Result<u64, TransportError> {
        // PUBSUB NUMSUB <channel> replies with a flat [channel, count] pair.
        let (_, count): (String, u64) = redis::cmd("PUBSUB")
            .arg("NUMSUB")
            .arg(channel)
            .query_async(&mut self.command_conn)
            .await
            .map_err(|e| TransportError::Unavailable {
                url: self.url.clone(),
                message: e.to_string(),
            })?;
        Ok(count)
    }
}
