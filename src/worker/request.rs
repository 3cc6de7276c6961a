//! Request and response snapshots passed through the Cache Controller.

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderMap;
use serde::{Deserialize, Serialize};
use url::Url;

/// How the page issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// A top-level page navigation.
    Navigate,
    /// A subresource or script-initiated fetch.
    #[default]
    Subresource,
}

/// An intercepted request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Request {
    /// A plain `GET` subresource request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            mode: RequestMode::Subresource,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// A `GET` page navigation.
    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Key under which this request's response is cached.
    #[must_use]
    pub fn cache_key(&self) -> String {
        cache_key(&self.url)
    }

    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }
}

/// Cache key for a URL: the full URL without its fragment.
#[must_use]
pub fn cache_key(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.to_string()
}

/// Cache key for a URL with both query and fragment removed.
#[must_use]
pub fn cache_key_ignoring_query(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    url.set_query(None);
    url.to_string()
}

/// Response type as the page would observe it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
    /// Same-origin response.
    Basic,
    /// Cross-origin response with CORS.
    Cors,
    /// Cross-origin response without CORS.
    Opaque,
}

/// A snapshot of a response, cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub url: String,
    pub status: u16,
    pub kind: ResponseKind,
    pub headers: Vec<(String, String)>,
    #[serde(skip)]
    pub body: Bytes,
}

impl Response {
    /// A same-origin `200 OK` response.
    #[must_use]
    pub fn ok(url: &Url, body: impl Into<Bytes>) -> Self {
        Self {
            url: url.to_string(),
            status: 200,
            kind: ResponseKind::Basic,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Only `200` same-origin responses are written to the cache.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 && self.kind == ResponseKind::Basic
    }

    /// First header value with the given (case-insensitive) name.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}
