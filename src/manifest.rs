//! Version manifest: the current app version plus its release history.
//!
//! The manifest is written by the release tool and fetched by the page at
//! startup. Its history is ordered newest-first and the top-level `version`
//! always mirrors the first entry.

use std::fmt;

use async_trait::async_trait;
use chrono::NaiveDate;
use semver::Version;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// How far a release moves the semantic version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BumpKind {
    Major,
    Minor,
    #[default]
    Patch,
}

impl BumpKind {
    /// Returns the version following `current` for this kind of bump.
    ///
    /// Pre-release and build metadata are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Release`] if the bumped component is already at its
    /// maximum value.
    pub fn apply(self, current: &Version) -> Result<Version> {
        let overflow = || Error::Release(format!("cannot apply a {self} bump to {current}"));
        Ok(match self {
            Self::Major => Version::new(current.major.checked_add(1).ok_or_else(overflow)?, 0, 0),
            Self::Minor => Version::new(
                current.major,
                current.minor.checked_add(1).ok_or_else(overflow)?,
                0,
            ),
            Self::Patch => Version::new(
                current.major,
                current.minor,
                current.patch.checked_add(1).ok_or_else(overflow)?,
            ),
        })
    }
}

impl fmt::Display for BumpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Major => "major",
            Self::Minor => "minor",
            Self::Patch => "patch",
        })
    }
}

impl std::str::FromStr for BumpKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "major" => Ok(Self::Major),
            "minor" => Ok(Self::Minor),
            "patch" => Ok(Self::Patch),
            other => Err(Error::Release(format!(
                "unknown bump kind {other:?} (expected major, minor or patch)"
            ))),
        }
    }
}

/// Category of a single release note line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NoteCategory {
    #[serde(rename = "feat")]
    Feature,
    #[serde(rename = "fix")]
    Fix,
    #[serde(rename = "ui")]
    Ui,
    #[serde(rename = "sec")]
    Security,
}

impl NoteCategory {
    /// Short tag used on the wire and in console output.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Feature => "feat",
            Self::Fix => "fix",
            Self::Ui => "ui",
            Self::Security => "sec",
        }
    }

    /// Parses a category from its tag or its long name.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "feat" | "feature" => Some(Self::Feature),
            "fix" => Some(Self::Fix),
            "ui" => Some(Self::Ui),
            "sec" | "security" => Some(Self::Security),
            _ => None,
        }
    }
}

/// One line of release notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseNote {
    #[serde(rename = "type")]
    pub category: NoteCategory,
    pub text: String,
}

impl ReleaseNote {
    #[must_use]
    pub fn new(category: NoteCategory, text: impl Into<String>) -> Self {
        Self {
            category,
            text: text.into(),
        }
    }
}

/// A published release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub version: Version,
    pub date: NaiveDate,
    pub title: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: BumpKind,
    #[serde(default)]
    pub notes: Vec<ReleaseNote>,
}

/// The document served at the manifest path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionManifest {
    pub version: Version,
    pub release_date: NaiveDate,
    #[serde(default)]
    pub releases: Vec<ReleaseEntry>,
}

impl VersionManifest {
    /// Creates an empty manifest at `version`.
    #[must_use]
    pub const fn new(version: Version, release_date: NaiveDate) -> Self {
        Self {
            version,
            release_date,
            releases: Vec::new(),
        }
    }

    /// Parses a manifest from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid manifest document.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Serializes the manifest as pretty-printed JSON with a trailing newline.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        let mut text = serde_json::to_string_pretty(self)?;
        text.push('\n');
        Ok(text)
    }

    /// The newest release, if any.
    #[must_use]
    pub fn latest(&self) -> Option<&ReleaseEntry> {
        self.releases.first()
    }

    /// Prepends `entry` and moves the top-level version and date to it.
    pub fn publish(&mut self, entry: ReleaseEntry) {
        self.version = entry.version.clone();
        self.release_date = entry.date;
        self.releases.insert(0, entry);
    }

    /// Checks the manifest's ordering rules.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Manifest`] if the top-level version differs from the
    /// newest entry or the history is not strictly newest-first.
    pub fn validate(&self) -> Result<()> {
        if let Some(latest) = self.latest()
            && latest.version != self.version
        {
            return Err(Error::Manifest(format!(
                "top-level version {} does not match newest release {}",
                self.version, latest.version
            )));
        }
        for pair in self.releases.windows(2) {
            if pair[0].version <= pair[1].version {
                return Err(Error::Manifest(format!(
                    "release {} is listed before older-or-equal release {}",
                    pair[0].version, pair[1].version
                )));
            }
        }
        Ok(())
    }
}

/// Anything that can produce the current version manifest.
#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Fetches and parses the manifest.
    async fn fetch_manifest(&self) -> Result<VersionManifest>;
}

/// Fetches the manifest over HTTP, cache-busted with a timestamp query.
#[derive(Debug, Clone)]
pub struct HttpManifestSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpManifestSource {
    /// Creates a source for the manifest at `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if `url` is not a valid absolute URL.
    pub fn new(client: reqwest::Client, url: &str) -> Result<Self> {
        Ok(Self {
            client,
            url: Url::parse(url)?,
        })
    }

    fn busted_url(&self) -> Url {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("t", &chrono::Utc::now().timestamp_millis().to_string());
        url
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    async fn fetch_manifest(&self) -> Result<VersionManifest> {
        let response = self
            .client
            .get(self.busted_url())
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .send()
            .await?
            .error_for_status()?;
        let text = response.text().await?;
        VersionManifest::from_json(&text)
    }
}
