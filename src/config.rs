//! Client configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// SIP methods the client is willing to send.
pub const ALLOWED_METHODS: [&str; 10] = [
    "CANCEL",
    "NOTIFY",
    "INVITE",
    "BYE",
    "REFER",
    "OPTIONS",
    "SUBSCRIBE",
    "MESSAGE",
    "PUBLISH",
    "REGISTER",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Explicit dotted-quad source address. When unset the address is
    /// derived from the host, rejecting loopback.
    pub src_ip: Option<String>,
    /// Inclusive source-port range shared with other client processes.
    pub min_port: u16,
    pub max_port: u16,
    /// Explicit source port; bypasses the shared registry entirely.
    /// 0 lets the OS pick.
    pub fixed_port: Option<u16>,
    /// Shared port registry location.
    pub registry_path: PathBuf,
    /// Keep the registry file around once the leased set becomes empty.
    pub persistent_registry: bool,
    /// How long to wait for a final response.
    pub final_response_timer: Duration,
    /// How long a single datagram send may take.
    pub send_timeout: Duration,
    pub user_agent: String,
    /// Emit one-line start-line summaries of each message at info level.
    pub debug: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// In server mode `listen` auto-replies 200 OK to non-matching
    /// requests instead of erroring after a bounded number of them.
    pub server_mode: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            src_ip: None,
            min_port: 5065,
            max_port: 5265,
            fixed_port: None,
            registry_path: std::env::temp_dir().join("sipling.ports"),
            persistent_registry: true,
            final_response_timer: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            user_agent: concat!("sipling/", env!("CARGO_PKG_VERSION")).to_string(),
            debug: false,
            username: None,
            password: None,
            server_mode: false,
        }
    }
}

impl ClientConfig {
    /// Check a method against the allowed set.
    pub fn is_allowed_method(method: &str) -> bool {
        ALLOWED_METHODS.contains(&method)
    }
}
