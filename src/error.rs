//! Error types for closbgp.
//!
//! Errors local to one peer session live next to the session
//! (`bgp::session::SessionError`); this module holds the crate-level types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type for closbgp operations.
#[derive(Error, Debug)]
pub enum ClosError {
    /// Configuration error; fatal to the process.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// RIB error.
    #[error("RIB error: {0}")]
    Rib(#[from] RibError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised while loading or resolving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    /// A single peer could not be resolved; other peers are unaffected.
    #[error("peer {peer}: {reason}")]
    Peer { peer: String, reason: String },

    #[error("no usable local address: no peer resolved and no prefixes configured")]
    NoLocalAddress,
}

/// Errors that can occur talking to the RIB engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RibError {
    /// The engine task has stopped and its channel is closed.
    #[error("RIB engine is not running")]
    EngineClosed,
}
