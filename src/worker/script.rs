//! The deployed worker script: its digest decides whether an update exists,
//! its embedded `CACHE_NAME` names the cache generation.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::header::{CACHE_CONTROL, HeaderValue};
use sha2::{Digest, Sha256};
use url::Url;

use super::controller::GenerationTag;
use crate::error::{Error, Result};

static CACHE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"CACHE_NAME\s*=\s*['"]([^'"]+)['"]"#).expect("valid cache-name regex")
});

/// One deployed revision of the worker script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerScript {
    pub generation: GenerationTag,
    /// Hex SHA-256 of the script bytes.
    pub digest: String,
}

impl WorkerScript {
    /// Reads the generation tag from script source and fingerprints it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Script`] when the script is not UTF-8 or has no
    /// `CACHE_NAME` assignment.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let source = std::str::from_utf8(bytes)
            .map_err(|e| Error::Script(format!("not valid UTF-8: {e}")))?;
        let generation = CACHE_NAME_RE
            .captures(source)
            .and_then(|caps| caps.get(1))
            .map(|m| GenerationTag::new(m.as_str()))
            .ok_or_else(|| Error::Script("no CACHE_NAME assignment found".to_string()))?;

        Ok(Self {
            generation,
            digest: format!("{:x}", Sha256::digest(bytes)),
        })
    }
}

/// Where the registration looks for the current worker script.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn fetch_script(&self) -> Result<WorkerScript>;
}

/// Fetches the script over HTTP, bypassing intermediary caches.
#[derive(Debug, Clone)]
pub struct HttpScriptSource {
    client: reqwest::Client,
    url: Url,
}

impl HttpScriptSource {
    #[must_use]
    pub const fn new(client: reqwest::Client, url: Url) -> Self {
        Self { client, url }
    }
}

#[async_trait]
impl ScriptSource for HttpScriptSource {
    async fn fetch_script(&self) -> Result<WorkerScript> {
        let bytes = self
            .client
            .get(self.url.clone())
            .header(CACHE_CONTROL, HeaderValue::from_static("no-cache"))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        WorkerScript::parse(&bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = "const CACHE_NAME = 'detailer-v1.3.7';\n\
        const PRECACHE = ['/', '/manifest.json', '/icon-192.svg'];\n";

    #[test]
    fn reads_generation_tag() {
        let script = WorkerScript::parse(SCRIPT.as_bytes()).unwrap();
        assert_eq!(script.generation.as_str(), "detailer-v1.3.7");
        assert_eq!(script.digest.len(), 64);
    }

    #[test]
    fn double_quotes_are_accepted() {
        let script = WorkerScript::parse(br#"var CACHE_NAME="detailer-v2.0.0";"#).unwrap();
        assert_eq!(script.generation.as_str(), "detailer-v2.0.0");
    }

    #[test]
    fn any_byte_change_changes_digest() {
        let a = WorkerScript::parse(SCRIPT.as_bytes()).unwrap();
        let b = WorkerScript::parse(format!("{SCRIPT}// rebuilt\n").as_bytes()).unwrap();
        assert_eq!(a.generation, b.generation);
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn missing_cache_name_is_an_error() {
        let err = WorkerScript::parse(b"self.addEventListener('fetch', () => {});").unwrap_err();
        assert!(matches!(err, Error::Script(_)));
        assert!(WorkerScript::parse(&[0xff, 0xfe]).is_err());
    }
}
