//! Crate errors

use thiserror::Error;

/// Crate result type
pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy for the client.
///
/// Every operation reports its failure through one of these four kinds:
/// invalid caller-supplied configuration, socket/DNS trouble, SIP-level
/// protocol violations, and shared port-registry trouble.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Resource error: {0}")]
    Resource(String),
}
