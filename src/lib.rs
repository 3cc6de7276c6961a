//! detailer-pwa - offline cache host, update coordinator and release tool for
//! the detailer web app.
//!
//! The crate models the app's update pipeline end to end:
//!
//! - [`worker`]: the background Cache Controller and the registration that
//!   hosts its instances (installing, waiting, activating, activated, redundant).
//! - [`coordinator`]: the page-side Update Coordinator that raises the
//!   "update available" signal and performs the confirmed activation.
//! - [`manifest`]: the version manifest both sides agree on.
//! - [`release`]: the version bump that rewrites every file carrying the version.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use detailer_pwa::worker::{
//!     HttpNetwork, HttpScriptSource, MemoryCacheStorage, Registration, Request,
//! };
//! use detailer_pwa::CacheConfig;
//!
//! # async fn example() -> detailer_pwa::Result<()> {
//! let scope = url::Url::parse("http://127.0.0.1:8080/")?;
//! let client = reqwest::Client::new();
//!
//! let registration = Registration::new(
//!     scope.clone(),
//!     CacheConfig::default(),
//!     Arc::new(HttpNetwork::new(client.clone(), &scope)),
//!     Arc::new(MemoryCacheStorage::new()),
//!     Arc::new(HttpScriptSource::new(client, scope.join("/sw.js")?)),
//! );
//! registration.register().await?;
//!
//! let outcome = registration.fetch(&Request::navigate(scope.join("/jobs")?)).await;
//! println!("served from {:?}", outcome.source());
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod config;
pub mod coordinator;
pub mod error;
pub mod format;
pub mod manifest;
pub mod release;
#[cfg(feature = "server")]
pub mod server;
pub mod storage;
pub mod worker;

// Re-export main types for convenience
pub use config::{
    AppConfig, CacheConfig, CoordinatorConfig, PathConfig, ReleaseConfig, ServerConfig,
};
pub use coordinator::{ConfirmOutcome, CoordinatorEvent, PageHost, UpdateCoordinator, WorkerRegistry};
pub use error::{Error, Result};
pub use format::{format_bytes, release_summary};
pub use manifest::{
    BumpKind, HttpManifestSource, ManifestSource, NoteCategory, ReleaseEntry, ReleaseNote,
    VersionManifest,
};
pub use storage::{DurableStore, FileStore, MemoryStore, UPDATE_PENDING_KEY};
