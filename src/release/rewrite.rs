//! Pattern-based rewrites of the version strings embedded in project files.
//!
//! Each rewrite returns `None` when its pattern is absent so the caller can
//! warn and skip that file.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use semver::Version;

use crate::error::{Error, Result};
use crate::worker::GenerationTag;

static PACKAGE_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"("version"\s*:\s*")([^"]*)(")"#).expect("valid regex")
});

static APP_VERSION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(APP_VERSION\s*=\s*['"])([^'"]*)(['"])"#).expect("valid regex")
});

static CACHE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(CACHE_NAME\s*=\s*['"])([^'"]*)(['"])"#).expect("valid regex")
});

/// Reads the version from a package descriptor.
///
/// # Errors
///
/// Returns an error if no `"version"` field exists or it is not semver.
pub fn package_version(text: &str) -> Result<Version> {
    let caps = PACKAGE_VERSION_RE
        .captures(text)
        .ok_or_else(|| Error::Release("package descriptor has no \"version\" field".to_string()))?;
    Ok(Version::parse(&caps[2])?)
}

/// Replaces the first match's middle group, keeping the quoting intact.
fn replace_first(re: &Regex, text: &str, value: &str) -> Option<String> {
    if !re.is_match(text) {
        return None;
    }
    Some(
        re.replacen(text, 1, |caps: &Captures<'_>| {
            format!("{}{value}{}", &caps[1], &caps[3])
        })
        .into_owned(),
    )
}

/// Sets the first `"version": "..."` field.
#[must_use]
pub fn set_package_version(text: &str, version: &Version) -> Option<String> {
    replace_first(&PACKAGE_VERSION_RE, text, &version.to_string())
}

/// Sets the client's `APP_VERSION = '...'` constant.
#[must_use]
pub fn set_app_version(text: &str, version: &Version) -> Option<String> {
    replace_first(&APP_VERSION_RE, text, &version.to_string())
}

/// Sets the worker's `CACHE_NAME = '...'` generation tag.
#[must_use]
pub fn set_cache_name(text: &str, tag: &GenerationTag) -> Option<String> {
    replace_first(&CACHE_NAME_RE, text, tag.as_str())
}
