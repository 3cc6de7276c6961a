//! Network access used by the Cache Controller.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use url::{Origin, Url};

use super::request::{Request, Response, ResponseKind};
use crate::error::Result;

/// Headers that describe a single hop and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "host",
    "keep-alive",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Abstraction over the network for testability.
#[async_trait]
pub trait Network: Send + Sync {
    /// Performs `request`. An `Err` means the network was unreachable;
    /// HTTP error statuses are returned as ordinary responses.
    async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// Default network implementation using `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpNetwork {
    client: reqwest::Client,
    origin: Origin,
}

impl HttpNetwork {
    /// Creates a network whose same-origin responses are those from `scope`.
    #[must_use]
    pub fn new(client: reqwest::Client, scope: &Url) -> Self {
        Self {
            client,
            origin: scope.origin(),
        }
    }

    fn kind_for(&self, url: &Url) -> ResponseKind {
        if url.origin() == self.origin {
            ResponseKind::Basic
        } else {
            ResponseKind::Cors
        }
    }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();
    for name in HOP_BY_HOP {
        forwarded.remove(*name);
    }
    forwarded
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(forwardable(&request.headers));
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }

        let response = builder.send().await?;
        let url = response.url().clone();
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;

        Ok(Response {
            url: url.to_string(),
            status,
            kind: self.kind_for(&url),
            headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header;

    #[test]
    fn same_origin_is_basic() {
        let scope = Url::parse("http://127.0.0.1:8080/").unwrap();
        let network = HttpNetwork::new(reqwest::Client::new(), &scope);

        assert_eq!(
            network.kind_for(&Url::parse("http://127.0.0.1:8080/assets/app.js").unwrap()),
            ResponseKind::Basic
        );
        assert_eq!(
            network.kind_for(&Url::parse("https://cdn.example.com/font.woff2").unwrap()),
            ResponseKind::Cors
        );
        assert_eq!(
            network.kind_for(&Url::parse("http://127.0.0.1:9000/").unwrap()),
            ResponseKind::Cors
        );
    }

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, "proxy.local".parse().unwrap());
        headers.insert(header::CONNECTION, "keep-alive".parse().unwrap());
        headers.insert(header::ACCEPT, "text/html".parse().unwrap());

        let forwarded = forwardable(&headers);
        assert!(forwarded.get(header::HOST).is_none());
        assert!(forwarded.get(header::CONNECTION).is_none());
        assert_eq!(forwarded.get(header::ACCEPT).unwrap(), "text/html");
    }

    #[tokio::test]
    async fn unreachable_host_is_an_error() {
        let scope = Url::parse("http://127.0.0.1:1/").unwrap();
        let network = HttpNetwork::new(reqwest::Client::new(), &scope);
        let result = network.fetch(&Request::get(scope.clone())).await;
        assert!(result.is_err());
    }
}
