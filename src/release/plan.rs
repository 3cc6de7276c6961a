//! Planning and applying a release across every file that carries the version.
//!
//! Planning reads and rewrites everything in memory. Applying writes every
//! new file next to its target first and only then renames them into place,
//! so a failure while writing leaves all targets untouched.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use semver::Version;

use super::draft::ReleaseDraft;
use super::rewrite;
use crate::config::ReleaseConfig;
use crate::error::{Error, Result};
use crate::manifest::{BumpKind, ReleaseEntry, VersionManifest};
use crate::worker::GenerationTag;

/// The four artifacts a release touches.
#[derive(Debug, Clone)]
pub struct ReleaseTargets {
    pub package_file: PathBuf,
    pub manifest_file: PathBuf,
    pub version_file: PathBuf,
    pub worker_file: PathBuf,
    /// Bucket prefix written into the worker's generation tag.
    pub cache_prefix: String,
}

impl ReleaseTargets {
    /// Resolves the configured paths against the project `root`.
    #[must_use]
    pub fn from_config(root: &Path, config: &ReleaseConfig, cache_prefix: &str) -> Self {
        Self {
            package_file: root.join(&config.package_file),
            manifest_file: root.join(&config.manifest_file),
            version_file: root.join(&config.version_file),
            worker_file: root.join(&config.worker_file),
            cache_prefix: cache_prefix.to_string(),
        }
    }
}

/// New contents for one target.
#[derive(Debug, Clone)]
pub struct FileChange {
    pub label: &'static str,
    pub path: PathBuf,
    pub contents: String,
}

/// Everything a release will write, computed but not yet applied.
#[derive(Debug, Clone)]
pub struct ReleasePlan {
    pub previous: Version,
    pub entry: ReleaseEntry,
    pub generation: GenerationTag,
    pub changes: Vec<FileChange>,
    /// Targets skipped because they were missing or lacked their pattern.
    pub warnings: Vec<String>,
}

/// Outcome of [`ReleasePlan::apply`].
#[derive(Debug, Clone)]
pub struct AppliedRelease {
    pub version: Version,
    pub written: Vec<(&'static str, PathBuf)>,
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Computes the next release without touching the disk.
///
/// The package descriptor is required: it is the source of the current
/// version. A missing manifest starts a new history. The client version file
/// and the worker script are rewritten when their pattern is present and
/// otherwise skipped with a warning.
///
/// # Errors
///
/// Returns an error if the package descriptor cannot be read or has no valid
/// version, the bump would overflow a version component, the existing
/// manifest is malformed, or the new manifest would break its ordering rules.
pub fn plan_release(
    targets: &ReleaseTargets,
    kind: BumpKind,
    draft: ReleaseDraft,
    today: NaiveDate,
) -> Result<ReleasePlan> {
    let package = std::fs::read_to_string(&targets.package_file).map_err(|e| {
        Error::Release(format!(
            "cannot read {}: {e}",
            targets.package_file.display()
        ))
    })?;
    let previous = rewrite::package_version(&package)?;
    let version = kind.apply(&previous)?;
    let generation = GenerationTag::for_version(&targets.cache_prefix, &version);

    let mut manifest = match read_optional(&targets.manifest_file)? {
        Some(text) => VersionManifest::from_json(&text)?,
        None => VersionManifest::new(previous.clone(), today),
    };
    let entry = ReleaseEntry {
        version: version.clone(),
        date: today,
        title: draft.title,
        description: draft.description,
        kind,
        notes: draft.notes,
    };
    manifest.publish(entry.clone());
    manifest.validate()?;

    let mut changes = Vec::with_capacity(4);
    let mut warnings = Vec::new();

    let package = rewrite::set_package_version(&package, &version).ok_or_else(|| {
        Error::Release("package descriptor lost its version field".to_string())
    })?;
    changes.push(FileChange {
        label: "package descriptor",
        path: targets.package_file.clone(),
        contents: package,
    });
    changes.push(FileChange {
        label: "version manifest",
        path: targets.manifest_file.clone(),
        contents: manifest.to_json_pretty()?,
    });

    let client = read_optional(&targets.version_file)?
        .map(|text| rewrite::set_app_version(&text, &version));
    let worker = read_optional(&targets.worker_file)?
        .map(|text| rewrite::set_cache_name(&text, &generation));
    for (label, path, rewritten) in [
        ("client version constant", &targets.version_file, client),
        ("worker generation tag", &targets.worker_file, worker),
    ] {
        match rewritten {
            Some(Some(contents)) => changes.push(FileChange {
                label,
                path: path.clone(),
                contents,
            }),
            Some(None) => warnings.push(format!(
                "{label}: pattern not found in {}, skipped",
                path.display()
            )),
            None => warnings.push(format!("{label}: {} not found, skipped", path.display())),
        }
    }

    for warning in &warnings {
        log::warn!("{warning}");
    }

    Ok(ReleasePlan {
        previous,
        entry,
        generation,
        changes,
        warnings,
    })
}

fn staging_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map_or_else(|| "release".into(), |n| n.to_string_lossy().into_owned());
    path.with_file_name(format!(".{name}.release-tmp"))
}

impl ReleasePlan {
    #[must_use]
    pub const fn version(&self) -> &Version {
        &self.entry.version
    }

    /// Writes every planned file.
    ///
    /// # Errors
    ///
    /// Returns an error if any staged file cannot be written (no target is
    /// modified in that case) or a rename fails. Staged files that were not
    /// renamed into place are removed either way.
    pub fn apply(&self) -> Result<AppliedRelease> {
        let mut staged: Vec<PathBuf> = Vec::with_capacity(self.changes.len());
        for change in &self.changes {
            let tmp = staging_path(&change.path);
            let written = change
                .path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::write(&tmp, &change.contents));
            if let Err(e) = written {
                let _ = std::fs::remove_file(&tmp);
                for path in &staged {
                    let _ = std::fs::remove_file(path);
                }
                return Err(Error::Release(format!(
                    "cannot write {}: {e}",
                    change.path.display()
                )));
            }
            staged.push(tmp);
        }

        let mut written = Vec::with_capacity(self.changes.len());
        for (i, (change, tmp)) in self.changes.iter().zip(&staged).enumerate() {
            if let Err(e) = std::fs::rename(tmp, &change.path) {
                for path in &staged[i..] {
                    let _ = std::fs::remove_file(path);
                }
                return Err(Error::Release(format!(
                    "cannot replace {}: {e}",
                    change.path.display()
                )));
            }
            written.push((change.label, change.path.clone()));
        }

        log::info!("Released {} ({})", self.entry.version, self.generation);
        Ok(AppliedRelease {
            version: self.entry.version.clone(),
            written,
        })
    }
}
