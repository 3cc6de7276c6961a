//! Request classification for the Cache Controller.
//!
//! Rules are checked in priority order: requests that are not `GET` over HTTP,
//! then the version manifest, then API and data-service traffic, and finally
//! everything else (static assets and navigations).

use reqwest::Method;
use url::Url;

use super::request::Request;
use crate::config::CacheConfig;

/// How the Cache Controller treats one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Not intercepted: left to default network handling.
    Passthrough,
    /// The version manifest: network only, cached copy as a last resort.
    Manifest,
    /// Network first with write-through, cache fallback when offline.
    NetworkFirst,
}

/// Classifies requests against the configured scope.
#[derive(Debug, Clone)]
pub struct Router {
    scope: Url,
    manifest_path: String,
    api_prefixes: Vec<String>,
    data_service_hosts: Vec<String>,
}

impl Router {
    #[must_use]
    pub fn new(scope: Url, config: &CacheConfig) -> Self {
        Self {
            scope,
            manifest_path: config.manifest_path.clone(),
            api_prefixes: config.api_prefixes.clone(),
            data_service_hosts: config
                .data_service_hosts
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
        }
    }

    /// Origin and base path this router serves.
    #[must_use]
    pub const fn scope(&self) -> &Url {
        &self.scope
    }

    #[must_use]
    pub fn classify(&self, request: &Request) -> Route {
        if request.method != Method::GET || !matches!(request.url.scheme(), "http" | "https") {
            return Route::Passthrough;
        }

        let url = &request.url;
        let same_origin = url.origin() == self.scope.origin();

        if same_origin && url.path() == self.manifest_path {
            return Route::Manifest;
        }

        if self.is_data_service(url)
            || (same_origin && self.api_prefixes.iter().any(|p| url.path().starts_with(p)))
        {
            return Route::Passthrough;
        }

        Route::NetworkFirst
    }

    fn is_data_service(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.to_ascii_lowercase();
        self.data_service_hosts.iter().any(|known| {
            host == *known
                || host
                    .strip_suffix(known.as_str())
                    .is_some_and(|rest| rest.ends_with('.'))
        })
    }
}
