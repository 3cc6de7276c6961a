//! HTTP host: fronts the app origin as a caching proxy driven by the worker
//! registration, and exposes the page-side update flow under `/__pwa/`.

pub mod origin;
pub mod page;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, header};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use url::Url;

use crate::config::AppConfig;
use crate::coordinator::{ConfirmOutcome, CoordinatorEvent, CoordinatorStatus, UpdateCoordinator};
use crate::error::Result;
use crate::manifest::HttpManifestSource;
use crate::storage::FileStore;
use crate::worker::{
    DiskCacheStorage, FetchOutcome, HttpNetwork, HttpScriptSource, Network, Registration,
    RegistrationStatus, Request, RequestMode, Response, ResponseSource, WorkerMessage,
};

pub use origin::{run_origin, serve_origin};
use page::{Notices, PageDeps, run_pages};

/// Largest request body the proxy buffers.
const MAX_BODY: usize = 16 * 1024 * 1024;

/// Response header naming where a proxied response came from.
pub const SOURCE_HEADER: &str = "x-pwa-source";

#[derive(Clone)]
struct HostState {
    registration: Arc<Registration>,
    network: Arc<dyn Network>,
    origin: Url,
    page: watch::Receiver<Option<Arc<UpdateCoordinator>>>,
    notices: Notices,
}

impl HostState {
    fn coordinator(&self) -> Option<Arc<UpdateCoordinator>> {
        self.page.borrow().clone()
    }
}

#[derive(Serialize)]
struct StatusResponse {
    registration: RegistrationStatus,
    page: Option<CoordinatorStatus>,
    notices: Vec<CoordinatorEvent>,
}

#[derive(Serialize)]
struct UpdateResponse {
    installed: bool,
}

#[derive(Serialize)]
struct MessageResponse {
    applied: bool,
}

#[derive(Serialize)]
struct ConfirmResponse {
    outcome: ConfirmOutcome,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn error_response(status: StatusCode, error: impl ToString) -> HttpResponse {
    (
        status,
        axum::Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn pwa_status(State(state): State<HostState>) -> impl IntoResponse {
    let notices = state
        .notices
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .cloned()
        .collect();
    axum::Json(StatusResponse {
        registration: state.registration.status().await,
        page: state.coordinator().map(|c| c.status()),
        notices,
    })
}

async fn pwa_update(State(state): State<HostState>) -> HttpResponse {
    match state.registration.update().await {
        Ok(installed) => axum::Json(UpdateResponse { installed }).into_response(),
        Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
    }
}

/// Posts a message to the waiting instance, as a page would via
/// `registration.waiting.postMessage`.
async fn pwa_message(
    State(state): State<HostState>,
    axum::Json(message): axum::Json<WorkerMessage>,
) -> HttpResponse {
    let Some(target) = state.registration.waiting() else {
        return axum::Json(MessageResponse { applied: false }).into_response();
    };
    match state.registration.post_message(&target, message).await {
        Ok(applied) => axum::Json(MessageResponse { applied }).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

async fn pwa_confirm(State(state): State<HostState>) -> HttpResponse {
    let Some(coordinator) = state.coordinator() else {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "page not loaded");
    };
    let outcome = coordinator.confirm_update().await;
    axum::Json(ConfirmResponse { outcome }).into_response()
}

fn is_navigation(method: &Method, headers: &HeaderMap) -> bool {
    if let Some(mode) = headers.get("sec-fetch-mode") {
        return mode == "navigate";
    }
    *method == Method::GET
        && headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|accept| accept.contains("text/html"))
}

fn to_http(response: Response, source: Option<ResponseSource>) -> HttpResponse {
    let mut builder = axum::http::Response::builder().status(response.status);
    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_str());
    }
    if let Some(source) = source {
        builder = builder.header(SOURCE_HEADER, source.as_str());
    }
    builder
        .body(Body::from(response.body))
        .unwrap_or_else(|e| error_response(StatusCode::BAD_GATEWAY, e))
}

/// Every request outside `/__pwa/` goes through the active worker first.
async fn proxy(State(state): State<HostState>, request: axum::extract::Request) -> HttpResponse {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path_and_query().map_or("/", |p| p.as_str());
    let url = match state.origin.join(path) {
        Ok(url) => url,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e),
    };
    let body = match axum::body::to_bytes(body, MAX_BODY).await {
        Ok(body) => body,
        Err(e) => return error_response(StatusCode::PAYLOAD_TOO_LARGE, e),
    };
    let mode = if is_navigation(&parts.method, &parts.headers) {
        RequestMode::Navigate
    } else {
        RequestMode::Subresource
    };
    let request = Request {
        method: parts.method,
        url,
        mode,
        headers: parts.headers,
        body,
    };

    match state.registration.fetch(&request).await {
        FetchOutcome::Respond { response, source } => to_http(response, Some(source)),
        FetchOutcome::Passthrough => match state.network.fetch(&request).await {
            Ok(response) => to_http(response, None),
            Err(e) => error_response(StatusCode::BAD_GATEWAY, e),
        },
        FetchOutcome::Failed(reason) => {
            log::debug!("Offline miss for {}: {reason}", request.url);
            (StatusCode::SERVICE_UNAVAILABLE, "Offline").into_response()
        }
    }
}

/// Builds the HTTP client used for origin, manifest and script requests.
fn build_http_client() -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(30))
        .build()
}

/// Runs the host on `listener` until `token` is cancelled.
///
/// # Errors
///
/// Returns an error if the configured origin, worker script or manifest URL
/// is invalid, or the server fails.
pub async fn serve_host(
    listener: TcpListener,
    config: AppConfig,
    token: CancellationToken,
) -> Result<()> {
    let client = build_http_client()?;
    let origin = Url::parse(&config.server.origin)?;
    let script_url = origin.join(&config.server.worker_script)?;

    let network: Arc<dyn Network> = Arc::new(HttpNetwork::new(client.clone(), &origin));
    let registration = Arc::new(Registration::new(
        origin.clone(),
        config.cache.clone(),
        Arc::clone(&network),
        Arc::new(DiskCacheStorage::new(&config.paths.cache_dir)),
        Arc::new(HttpScriptSource::new(client.clone(), script_url)),
    ));

    let (page_tx, page_rx) = watch::channel(None);
    let notices: Notices = Arc::new(Mutex::new(VecDeque::new()));

    let state = HostState {
        registration: Arc::clone(&registration),
        network,
        origin: origin.clone(),
        page: page_rx,
        notices: Arc::clone(&notices),
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/__pwa/status", get(pwa_status))
        .route("/__pwa/update", post(pwa_update))
        .route("/__pwa/message", post(pwa_message))
        .route("/__pwa/confirm", post(pwa_confirm))
        .fallback(proxy)
        .layer(cors)
        .with_state(state);

    log::info!(
        "Cache host on {} fronting {origin}",
        listener.local_addr()?
    );

    // The page fetches its manifest through this host, so start serving first.
    let shutdown = token.clone().cancelled_owned();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    });

    let deps = PageDeps {
        config: config.coordinator.clone(),
        registration,
        manifests: Arc::new(HttpManifestSource::new(
            client,
            &config.coordinator.manifest_url,
        )?),
        store: Arc::new(FileStore::in_dir(&config.paths.state_dir)),
        notices,
    };
    run_pages(deps, page_tx, token.clone()).await;

    match server.await {
        Ok(result) => result?,
        Err(e) => log::error!("Host server task failed: {e}"),
    }
    log::info!("Cache host stopped");
    Ok(())
}

/// Binds the configured address and runs the host until `token` is cancelled.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the host fails.
pub async fn run_host(config: AppConfig, token: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind((config.server.host.as_str(), config.server.port)).await?;
    serve_host(listener, config, token).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_site(dir: &Path, tag: &str) {
        std::fs::write(dir.join("index.html"), format!("<html>{tag}</html>")).unwrap();
        std::fs::write(dir.join("manifest.json"), r#"{"name":"Detailer"}"#).unwrap();
        std::fs::write(dir.join("icon-192.svg"), "<svg/>").unwrap();
        std::fs::write(
            dir.join("sw.js"),
            format!("const CACHE_NAME = '{tag}';\n"),
        )
        .unwrap();
        std::fs::write(
            dir.join("version.json"),
            r#"{"version":"1.0.0","releaseDate":"2026-03-01","releases":[{"version":"1.0.0","date":"2026-03-01","title":"First","description":"","type":"major","notes":[]}]}"#,
        )
        .unwrap();
    }

    async fn bind() -> (TcpListener, SocketAddr) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        (listener, addr)
    }

    async fn json(response: reqwest::Response) -> serde_json::Value {
        serde_json::from_str(&response.text().await.unwrap()).unwrap()
    }

    async fn status(client: &reqwest::Client, host: SocketAddr) -> serde_json::Value {
        json(
            client
                .get(format!("http://{host}/__pwa/status"))
                .send()
                .await
                .unwrap(),
        )
        .await
    }

    async fn post(client: &reqwest::Client, host: SocketAddr, path: &str) -> serde_json::Value {
        json(
            client
                .post(format!("http://{host}{path}"))
                .send()
                .await
                .unwrap(),
        )
        .await
    }

    async fn wait_for_active(client: &reqwest::Client, host: SocketAddr, tag: &str) {
        for _ in 0..100 {
            let s = status(client, host).await;
            if s["registration"]["active"]["tag"] == tag {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{tag} never became active");
    }

    #[tokio::test]
    async fn update_flow_through_host() {
        let public = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        write_site(public.path(), "detailer-v1.0.0");

        let origin_token = CancellationToken::new();
        let (origin_listener, origin_addr) = bind().await;
        let origin_task = tokio::spawn(serve_origin(
            origin_listener,
            public.path().to_path_buf(),
            origin_token.clone(),
        ));

        let (host_listener, host_addr) = bind().await;
        let mut config = AppConfig::new();
        config.server.origin = format!("http://{origin_addr}/");
        config.coordinator.manifest_url = format!("http://{host_addr}/version.json");
        config.coordinator.dev_mode = true;
        config.paths.cache_dir = state.path().join("buckets");
        config.paths.state_dir = state.path().join("state");
        config.cache.precache = vec!["/".into(), "/manifest.json".into(), "/icon-192.svg".into()];

        let host_token = CancellationToken::new();
        let host_task = tokio::spawn(serve_host(host_listener, config, host_token.clone()));
        let client = reqwest::Client::new();

        wait_for_active(&client, host_addr, "detailer-v1.0.0").await;
        let s = status(&client, host_addr).await;
        assert_eq!(s["page"]["releaseNote"]["version"], "1.0.0");
        assert_eq!(s["page"]["updateAvailable"], false);

        let root = client.get(format!("http://{host_addr}/")).send().await.unwrap();
        assert_eq!(root.headers()[SOURCE_HEADER], "network");

        // Nothing waiting yet.
        let confirm = post(&client, host_addr, "/__pwa/confirm").await;
        assert_eq!(confirm["outcome"], "nothing_to_apply");

        // Deploy a new worker script and check for it.
        write_site(public.path(), "detailer-v1.1.0");
        let update = post(&client, host_addr, "/__pwa/update").await;
        assert_eq!(update["installed"], true);
        let s = status(&client, host_addr).await;
        assert_eq!(s["registration"]["waiting"]["tag"], "detailer-v1.1.0");
        assert_eq!(s["registration"]["active"]["tag"], "detailer-v1.0.0");

        let confirm = post(&client, host_addr, "/__pwa/confirm").await;
        assert_eq!(confirm["outcome"], "reloaded");
        wait_for_active(&client, host_addr, "detailer-v1.1.0").await;

        let buckets: Vec<_> = std::fs::read_dir(state.path().join("buckets"))
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(buckets, vec!["detailer-v1.1.0".to_string()]);

        // Take the origin down: precached assets and navigations still work.
        origin_token.cancel();
        origin_task.await.unwrap().unwrap();

        let icon = client
            .get(format!("http://{host_addr}/icon-192.svg"))
            .send()
            .await
            .unwrap();
        assert_eq!(icon.status(), 200);
        assert_eq!(icon.headers()[SOURCE_HEADER], "cache");

        let nav = client
            .get(format!("http://{host_addr}/jobs/7"))
            .header(header::ACCEPT, "text/html")
            .send()
            .await
            .unwrap();
        assert_eq!(nav.headers()[SOURCE_HEADER], "root_fallback");
        assert_eq!(nav.text().await.unwrap(), "<html>detailer-v1.1.0</html>");

        let missing = client
            .get(format!("http://{host_addr}/assets/never.js"))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::SERVICE_UNAVAILABLE);

        host_token.cancel();
        host_task.await.unwrap().unwrap();
    }

    #[test]
    fn navigation_detection() {
        let mut headers = HeaderMap::new();
        assert!(!is_navigation(&Method::GET, &headers));
        headers.insert(header::ACCEPT, "text/html,application/xhtml+xml".parse().unwrap());
        assert!(is_navigation(&Method::GET, &headers));
        assert!(!is_navigation(&Method::POST, &headers));
        headers.insert("sec-fetch-mode", "cors".parse().unwrap());
        assert!(!is_navigation(&Method::GET, &headers));
    }
}
