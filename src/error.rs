//! Error types for the detailer-pwa library.

use thiserror::Error;

use crate::worker::state::{LifecycleEvent, WorkerState};

/// Errors that can occur across the cache host, coordinator and release tool.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error during file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML configuration or state file could not be parsed.
    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// TOML configuration or state file could not be written.
    #[error("TOML write error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    /// A version string is not valid semantic versioning.
    #[error("invalid version: {0}")]
    Version(#[from] semver::Error),

    /// A URL could not be parsed or joined.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// The version manifest is malformed or violates its ordering rules.
    #[error("version manifest: {0}")]
    Manifest(String),

    /// A precache asset could not be fetched, aborting installation.
    #[error("precache of {path} failed: {reason}")]
    Precache {
        /// Path of the asset that failed.
        path: String,
        /// Why it failed.
        reason: String,
    },

    /// A worker instance was asked to make a lifecycle move it cannot make.
    #[error("cannot apply {event:?} to a worker in state {from:?}")]
    InvalidTransition {
        /// State the worker was in.
        from: WorkerState,
        /// Event that was rejected.
        event: LifecycleEvent,
    },

    /// A cache bucket name is empty or contains path separators.
    #[error("invalid cache bucket name: {0:?}")]
    InvalidBucket(String),

    /// The worker script could not be interpreted.
    #[error("worker script: {0}")]
    Script(String),

    /// The release tool could not plan or apply a release.
    #[error("release: {0}")]
    Release(String),
}

/// A specialized `Result` type for detailer-pwa operations.
pub type Result<T> = std::result::Result<T, Error>;
