//! The Cache Controller: one worker instance's cache generation and fetch policy.

use std::fmt;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use super::cache::{self, CacheStorage};
use super::clients::ClientTable;
use super::network::Network;
use super::request::{Request, Response, cache_key, cache_key_ignoring_query};
use super::routing::{Route, Router};
use crate::config::CacheConfig;
use crate::error::{Error, Result};

/// Version tag naming one cache generation, e.g. `detailer-v1.4.0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationTag(String);

impl GenerationTag {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The tag the release tool writes for `version`.
    #[must_use]
    pub fn for_version(prefix: &str, version: &Version) -> Self {
        Self(format!("{prefix}v{version}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this generation belongs to the application owning `prefix`.
    #[must_use]
    pub fn belongs_to(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for GenerationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a response handed back to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Network,
    Cache,
    /// The cached root document, served for an offline navigation.
    RootFallback,
}

impl ResponseSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Cache => "cache",
            Self::RootFallback => "root_fallback",
        }
    }
}

/// Result of routing one intercepted request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the caller performs the request itself.
    Passthrough,
    /// Answered by the controller.
    Respond {
        response: Response,
        source: ResponseSource,
    },
    /// Network unreachable and nothing suitable cached.
    Failed(String),
}

impl FetchOutcome {
    #[must_use]
    pub const fn source(&self) -> Option<ResponseSource> {
        match self {
            Self::Respond { source, .. } => Some(*source),
            Self::Passthrough | Self::Failed(_) => None,
        }
    }
}

/// Cache generation owner and fetch handler of one worker instance.
pub struct CacheController {
    worker: Uuid,
    tag: GenerationTag,
    prefix: String,
    precache: Vec<String>,
    router: Router,
    network: Arc<dyn Network>,
    storage: Arc<dyn CacheStorage>,
}

impl fmt::Debug for CacheController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheController")
            .field("worker", &self.worker)
            .field("tag", &self.tag)
            .field("scope", &self.router.scope().as_str())
            .finish_non_exhaustive()
    }
}

impl CacheController {
    #[must_use]
    pub fn new(
        worker: Uuid,
        tag: GenerationTag,
        scope: Url,
        config: &CacheConfig,
        network: Arc<dyn Network>,
        storage: Arc<dyn CacheStorage>,
    ) -> Self {
        Self {
            worker,
            tag,
            prefix: config.prefix.clone(),
            precache: config.precache.clone(),
            router: Router::new(scope, config),
            network,
            storage,
        }
    }

    #[must_use]
    pub const fn tag(&self) -> &GenerationTag {
        &self.tag
    }

    /// Opens this generation's bucket and fills it with the precache list.
    ///
    /// Every asset is fetched before any is stored, so a single failure leaves
    /// the bucket without partial precache entries.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Precache`] if any asset is unreachable or not `200`.
    pub async fn install(&self) -> Result<()> {
        self.storage.open(self.tag.as_str()).await?;

        let fetches = self.precache.iter().map(|path| async move {
            let url = self
                .router
                .scope()
                .join(path)
                .map_err(|e| precache_error(path, e))?;
            let response = self
                .network
                .fetch(&Request::get(url.clone()))
                .await
                .map_err(|e| precache_error(path, e))?;
            if !(200..300).contains(&response.status) {
                return Err(precache_error(
                    path,
                    format!("status {}", response.status),
                ));
            }
            Ok::<_, Error>((cache_key(&url), response))
        });
        let fetched = futures::future::try_join_all(fetches).await?;

        for (key, response) in &fetched {
            self.storage.put(self.tag.as_str(), key, response).await?;
        }
        log::info!(
            "Installed cache generation {} ({} assets)",
            self.tag,
            fetched.len()
        );
        Ok(())
    }

    /// Claims every open client, then deletes this application's stale buckets.
    ///
    /// Returns the number of buckets evicted.
    ///
    /// A bucket that cannot be deleted is logged and left for the next
    /// activation; the remaining stale buckets are still evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the bucket list cannot be read.
    pub async fn activate(&self, clients: &mut ClientTable) -> Result<usize> {
        let claimed = clients.claim(self.worker);
        log::debug!("{} claimed {claimed} client(s)", self.tag);

        let mut evicted = 0;
        for bucket in self.storage.buckets().await? {
            if !bucket.starts_with(&self.prefix) || bucket == self.tag.as_str() {
                continue;
            }
            match self.storage.delete(&bucket).await {
                Ok(true) => {
                    evicted += 1;
                    log::info!("Evicted stale cache generation {bucket}");
                }
                Ok(false) => {}
                Err(e) => log::warn!("Could not evict stale cache generation {bucket}: {e}"),
            }
        }
        Ok(evicted)
    }

    /// Routes one intercepted request. Network failures never escape as errors.
    pub async fn handle_fetch(&self, request: &Request) -> FetchOutcome {
        match self.router.classify(request) {
            Route::Passthrough => FetchOutcome::Passthrough,
            Route::Manifest => self.fetch_manifest(request).await,
            Route::NetworkFirst => self.fetch_network_first(request).await,
        }
    }

    async fn fetch_manifest(&self, request: &Request) -> FetchOutcome {
        let error = match self.network.fetch(request).await {
            Ok(response) => {
                return FetchOutcome::Respond {
                    response,
                    source: ResponseSource::Network,
                };
            }
            Err(e) => e,
        };

        let key = cache_key_ignoring_query(&request.url);
        match cache::match_any(self.storage.as_ref(), &self.prefix, &key).await {
            Ok(Some(response)) => FetchOutcome::Respond {
                response,
                source: ResponseSource::Cache,
            },
            Ok(None) => FetchOutcome::Failed(error.to_string()),
            Err(e) => {
                log::warn!("Cache lookup for {key} failed: {e}");
                FetchOutcome::Failed(error.to_string())
            }
        }
    }

    async fn fetch_network_first(&self, request: &Request) -> FetchOutcome {
        let key = request.cache_key();
        let error = match self.network.fetch(request).await {
            Ok(response) => {
                if response.is_cacheable()
                    && let Err(e) = self.storage.put(self.tag.as_str(), &key, &response).await
                {
                    log::warn!("Write-through of {key} failed: {e}");
                }
                return FetchOutcome::Respond {
                    response,
                    source: ResponseSource::Network,
                };
            }
            Err(e) => e,
        };
        log::debug!("Network failed for {key}, trying cache: {error}");

        if let Some(response) = self.lookup(&key).await {
            return FetchOutcome::Respond {
                response,
                source: ResponseSource::Cache,
            };
        }

        if request.is_navigation() {
            let root = self
                .router
                .scope()
                .join("/")
                .map_or_else(|_| self.router.scope().to_string(), |u| cache_key(&u));
            if let Some(response) = self.lookup(&root).await {
                return FetchOutcome::Respond {
                    response,
                    source: ResponseSource::RootFallback,
                };
            }
        }

        FetchOutcome::Failed(error.to_string())
    }

    async fn lookup(&self, key: &str) -> Option<Response> {
        match self.storage.get(self.tag.as_str(), key).await {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Cache lookup for {key} failed: {e}");
                None
            }
        }
    }
}

fn precache_error(path: &str, reason: impl ToString) -> Error {
    Error::Precache {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
