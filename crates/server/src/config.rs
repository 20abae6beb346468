//! Application configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::websocket::{ClientOptions, DispatcherConfig, ShutdownPolicy};

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Clients
    pub heartbeat_interval_secs: u64,
    pub client_send_buffer: usize,

    // Dispatcher
    pub dispatcher_queue_capacity: usize,
    pub shutdown_policy: ShutdownPolicy,
    pub shutdown_drain_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Clients
            heartbeat_interval_secs: positive("HEARTBEAT_INTERVAL_SECS", 30)?,
            client_send_buffer: positive("CLIENT_SEND_BUFFER", 256)?,

            // Dispatcher
            dispatcher_queue_capacity: positive("DISPATCHER_QUEUE_CAPACITY", 1000)?,
            shutdown_policy: match env::var("SHUTDOWN_POLICY") {
                Ok(raw) => raw
                    .parse()
                    .map_err(|_| ConfigError::Invalid("SHUTDOWN_POLICY", raw))?,
                Err(_) => ShutdownPolicy::Drain,
            },
            shutdown_drain_timeout_ms: parse_or("SHUTDOWN_DRAIN_TIMEOUT_MS", 5000)?,
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: self.dispatcher_queue_capacity,
            shutdown_policy: self.shutdown_policy,
            drain_timeout: Duration::from_millis(self.shutdown_drain_timeout_ms),
        }
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            send_buffer: self.client_send_buffer,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            heartbeat_interval_secs: 30,
            client_send_buffer: 256,
            dispatcher_queue_capacity: 1000,
            shutdown_policy: ShutdownPolicy::Drain,
            shutdown_drain_timeout_ms: 5000,
        }
    }
}

/// Parse a variable, falling back to `default` when it is unset
fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(key, raw)),
        Err(_) => Ok(default),
    }
}

/// Like [`parse_or`] but rejects zero
fn positive<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + Default + ToString,
{
    let value = parse_or(key, default)?;
    if value == T::default() {
        return Err(ConfigError::Invalid(key, value.to_string()));
    }
    Ok(value)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {0}: {1:?}")]
    Invalid(&'static str, String),
}
