//! Environment-driven configuration, gathered behind a single façade rather
//! than scattered `std::env::var(...)` reads across the codebase.

use std::env;

use crate::error::ClientError;

const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_POLL_INTERVAL_S: f64 = 0.01;

/// Supported wire serializations. Only `json` exists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationType {
    Json,
}

impl SerializationType {
    fn from_env_value(value: &str) -> Result<Self, ClientError> {
        match value.to_ascii_lowercase().as_str() {
            "json" => Ok(SerializationType::Json),
            other => Err(ClientError::InvalidArgument {
                qualified_name: "AIOTASKQ_SERIALIZATION".to_string(),
                message: format!("unsupported serialization type `{other}`"),
            }),
        }
    }
}

/// Process-wide configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    broker_url: String,
    serialization: SerializationType,
    poll_interval_s: f64,
}

impl Config {
    /// Build configuration from the environment.
    pub fn from_env() -> Result<Self, ClientError> {
        let broker_url = env::var("BROKER_URL")
            .or_else(|_| env::var("REDIS_URL"))
            .unwrap_or_else(|_| DEFAULT_REDIS_URL.to_string());

        let serialization = match env::var("AIOTASKQ_SERIALIZATION") {
            Ok(value) => SerializationType::from_env_value(&value)?,
            Err(_) => SerializationType::Json,
        };

        let poll_interval_s = DEFAULT_POLL_INTERVAL_S;

        Ok(Self {
            broker_url,
            serialization,
            poll_interval_s,
        })
    }

    pub fn broker_url(&self) -> &str {
        &self.broker_url
    }

    pub fn serialization(&self) -> SerializationType {
        self.serialization
    }

    pub fn poll_interval_s(&self) -> f64 {
        self.poll_interval_s
    }

    /// Return the `tracing_subscriber::EnvFilter` directive for
    /// `AIOTASKQ_LOG_LEVEL`, defaulting to `info`.
    pub fn log_level() -> String {
        env::var("AIOTASKQ_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // `Config::from_env` reads process-global env vars, and `cargo test`
    // runs tests in this module on separate threads by default. Without this
    // lock, `defaults_without_env` and `rejects_unsupported_serialization`
    // race on `AIOTASKQ_SERIALIZATION` and fail intermittently.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_without_env() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: no other thread touches these vars while `_guard` is held.
        unsafe {
            env::remove_var("BROKER_URL");
            env::remove_var("REDIS_URL");
            env::remove_var("AIOTASKQ_SERIALIZATION");
        }
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.broker_url(), DEFAULT_REDIS_URL);
        assert_eq!(cfg.serialization(), SerializationType::Json);
    }

    #[test]
    fn rejects_unsupported_serialization() {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: no other thread touches these vars while `_guard` is held.
        unsafe {
            env::set_var("AIOTASKQ_SERIALIZATION", "protobuf");
        }
        let result = Config::from_env();
        unsafe {
            env::remove_var("AIOTASKQ_SERIALIZATION");
        }
        assert!(result.is_err());
    }
}
