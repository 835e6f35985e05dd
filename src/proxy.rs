//! Reverse proxy to the local upstream process
//!
//! Requests that passed the access policies are forwarded to
//! `http://127.0.0.1:<upstream_port>` with the same method, path, query and
//! body. Configured static headers are appended; hop-by-hop headers are
//! dropped in both directions. Bodies are streamed both ways. No retries,
//! no load balancing.

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

// RFC 9110 section 7.6.1, plus the legacy proxy variants
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Forwards admitted requests to the single upstream
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
    upstream: String,
    headers: Vec<(HeaderName, HeaderValue)>,
}

impl Forwarder {
    /// Create a forwarder for `127.0.0.1:<upstream_port>`
    pub fn new(upstream_port: u16, headers: &[(String, String)]) -> Result<Self> {
        let headers = headers
            .iter()
            .map(|(k, v)| {
                let name = HeaderName::try_from(k.as_str())
                    .map_err(|e| Error::Config(format!("invalid header name {k:?}: {e}")))?;
                let value = HeaderValue::try_from(v.as_str())
                    .map_err(|e| Error::Config(format!("invalid value for header {k}: {e}")))?;
                Ok((name, value))
            })
            .collect::<Result<Vec<_>>>()?;

        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            upstream: format!("http://127.0.0.1:{upstream_port}"),
            headers,
        })
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    async fn forward(&self, request: Request) -> Response {
        let client_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let (parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let url = format!("{}{}", self.upstream, path_and_query);

        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);

        // HTTP/2 requests carry the host in the URI authority
        let host = headers
            .remove(header::HOST)
            .or_else(|| parts.uri.authority().and_then(|a| HeaderValue::try_from(a.as_str()).ok()));
        if let Some(host) = host {
            headers.insert(X_FORWARDED_HOST, host);
        }
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("https"));
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut headers, addr);
        }
        for (name, value) in &self.headers {
            headers.append(name.clone(), value.clone());
        }

        debug!(method = %parts.method, %url, "forwarding request");
        let upstream = match self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
        {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!("upstream request failed: {}", e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

/// Fallback handler proxying everything not served by the shim itself
pub async fn forward(State(forwarder): State<Arc<Forwarder>>, request: Request) -> Response {
    forwarder.forward(request).await
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // headers named in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::try_from(name.trim()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::try_from(value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use tower::ServiceExt;

    /// Upstream that echoes what it received
    async fn spawn_upstream() -> u16 {
        let app = Router::new().fallback(|request: Request| async move {
            let h = |name: &str| {
                request
                    .headers()
                    .get_all(name)
                    .iter()
                    .map(|v| v.to_str().unwrap_or_default().to_string())
                    .collect::<Vec<_>>()
                    .join(";")
            };
            let line = format!(
                "{} {} inject={} xfh={} xff={} conn={}",
                request.method(),
                request.uri(),
                h("x-inject"),
                h(X_FORWARDED_HOST),
                h(X_FORWARDED_FOR),
                h("x-drop-me"),
            );
            ([("x-upstream", "yes"), ("keep-alive", "timeout=5")], line)
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn proxy_app(forwarder: Forwarder) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(Arc::new(forwarder))
    }

    #[tokio::test]
    async fn test_forwards_to_upstream() {
        let port = spawn_upstream().await;
        let forwarder = Forwarder::new(port, &[("X-Inject".into(), "static".into())]).unwrap();
        assert_eq!(forwarder.upstream(), format!("http://127.0.0.1:{port}"));

        let mut request = Request::builder()
            .method("POST")
            .uri("/v1/chat?stream=true")
            .header(header::HOST, "shim.example.com")
            .header("x-inject", "client")
            .header(header::CONNECTION, "x-drop-me")
            .header("x-drop-me", "secret")
            .body(Body::from("hello"))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo("203.0.113.7:5555".parse::<SocketAddr>().unwrap()));

        let resp = proxy_app(forwarder).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["x-upstream"], "yes");
        assert!(resp.headers().get("keep-alive").is_none());

        let body = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(
            body,
            "POST /v1/chat?stream=true inject=client;static xfh=shim.example.com xff=203.0.113.7 conn="
        );
    }

    #[tokio::test]
    async fn test_large_body_streamed_upstream() {
        let app = Router::new().fallback(|request: Request| async move {
            let body = axum::body::to_bytes(request.into_body(), usize::MAX)
                .await
                .unwrap();
            let sum: u64 = body.iter().map(|b| *b as u64).sum();
            format!("{} {}", body.len(), sum)
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let len = 40 * 1024 * 1024;
        let request = Request::builder()
            .method("PUT")
            .uri("/upload")
            .body(Body::from(vec![3u8; len]))
            .unwrap();
        let resp = proxy_app(Forwarder::new(port, &[]).unwrap())
            .oneshot(request)
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(body, format!("{} {}", len, 3 * len as u64));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_bad_gateway() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let forwarder = Forwarder::new(port, &[]).unwrap();
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = proxy_app(forwarder).oneshot(request).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_invalid_header_config() {
        let err = Forwarder::new(8080, &[("bad header".into(), "v".into())]).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("10.0.0.1"));
        append_forwarded_for(&mut headers, "192.0.2.1:443".parse().unwrap());
        assert_eq!(headers[X_FORWARDED_FOR], "10.0.0.1, 192.0.2.1");
    }
}
