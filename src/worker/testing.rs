//! In-process fakes for the network and worker-script seams.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use url::Url;

use super::controller::GenerationTag;
use super::network::Network;
use super::request::{Request, Response, cache_key};
use super::script::{ScriptSource, WorkerScript};
use crate::error::{Error, Result};

pub const SCOPE: &str = "http://app.test/";

pub fn scope() -> Url {
    Url::parse(SCOPE).unwrap()
}

pub fn url(path: &str) -> Url {
    scope().join(path).unwrap()
}

/// A network that serves a fixed set of routes and can be taken offline.
#[derive(Debug)]
pub struct FakeNetwork {
    routes: Mutex<HashMap<String, Response>>,
    online: AtomicBool,
    requests: AtomicUsize,
}

impl FakeNetwork {
    pub fn new() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        }
    }

    /// A network already serving the default precache list and a manifest.
    pub fn with_site(body: &str) -> Self {
        let network = Self::new();
        for path in ["/", "/manifest.json", "/icon-192.svg"] {
            network.serve(path, format!("{body} {path}"));
        }
        network.serve("/version.json", r#"{"version":"1.0.0","releaseDate":"2026-01-01","releases":[]}"#);
        network
    }

    pub fn serve(&self, path: &str, body: impl Into<String>) {
        let url = url(path);
        self.put(&url, Response::ok(&url, body.into()));
    }

    pub fn put(&self, url: &Url, response: Response) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key(url), response);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Network for FakeNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if !self.online.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "offline",
            )));
        }
        let routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(routes
            .get(&request.cache_key())
            .cloned()
            .unwrap_or_else(|| Response::ok(&request.url, "not found").with_status(404)))
    }
}

/// A worker script that can be "redeployed" between update checks.
#[derive(Debug)]
pub struct FakeScript {
    current: Mutex<WorkerScript>,
}

impl FakeScript {
    pub fn new(tag: &str) -> Self {
        Self {
            current: Mutex::new(Self::script(tag)),
        }
    }

    fn script(tag: &str) -> WorkerScript {
        WorkerScript {
            generation: GenerationTag::new(tag),
            digest: format!("digest-of-{tag}"),
        }
    }

    pub fn deploy(&self, tag: &str) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Self::script(tag);
    }
}

#[async_trait]
impl ScriptSource for FakeScript {
    async fn fetch_script(&self) -> Result<WorkerScript> {
        Ok(self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }
}
