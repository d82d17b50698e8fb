//! Settings of the server and of the demo client.
//!
//! Both binaries fill these from command line flags and the environment.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resilience::RetryPolicy;

/// Address both versions are served on, and dialed by the client
pub const DEFAULT_ADDR: &str = "127.0.0.1:5144";

/// Settings of `catalog-server`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// `host:port` to listen on
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
        }
    }
}

/// Settings of `catalog-client` and of the [CallDriver](crate::driver::CallDriver)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// `host:port` of the server
    pub addr: String,
    /// Retry policy for pings
    pub retry: RetryPolicy,
    /// Text of the pings
    pub ping_message: String,
    /// Interval the watch asks for
    pub watch_interval_ms: i32,
    /// Number of updates the watch asks for
    pub watch_updates: i32,
    /// Events per upload
    pub upload_events: usize,
    /// Messages per chat
    pub chat_messages: usize,
    /// Pause after each chat message
    pub chat_pause_ms: u64,
}

impl ClientConfig {
    /// Pause after each chat message
    pub fn chat_pause(&self) -> Duration {
        Duration::from_millis(self.chat_pause_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            retry: RetryPolicy::default(),
            ping_message: "hello from client".to_string(),
            watch_interval_ms: 300,
            watch_updates: 5,
            upload_events: 5,
            chat_messages: 3,
            chat_pause_ms: 200,
        }
    }
}
