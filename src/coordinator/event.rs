//! Notices the Update Coordinator emits for the page's notification layer.

use semver::Version;
use serde::Serialize;

use crate::worker::GenerationTag;

/// Events sent from the coordinator to whatever renders notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    /// The previous page load confirmed an update; shown once.
    UpdateSucceeded,
    /// The newest release entry was read from the version manifest.
    ReleaseNote { version: Version, title: String },
    /// The version manifest could not be fetched or parsed.
    ManifestUnavailable { error: String },
    /// A new worker instance is installed and waiting for confirmation.
    UpdateAvailable { tag: GenerationTag },
    /// A confirmed update is about to reload the page.
    Reloading { acknowledged: bool },
}
