//! sipling - a small SIP user-agent client over UDP
//!
//! One [`SipClient`] drives one dialog at a time: configure identity and
//! target, call [`SipClient::send`] and get the final status back.
//! Digest authentication, the provisional wait, ACK emission and
//! cross-process source-port leasing are handled internally.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod message;
pub mod ports;
pub mod sdp;
pub mod transport;

// Re-export commonly used types
pub use client::SipClient;
pub use config::ClientConfig;
pub use error::{Error, Result};
