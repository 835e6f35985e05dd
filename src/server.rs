//! HTTPS front end
//!
//! | Path | Method | Behavior |
//! |---|---|---|
//! | `/.well-known/tinfoil-attestation` | `OPTIONS` | 200, empty body (CORS preflight) |
//! | `/.well-known/tinfoil-attestation` | other | 200, attestation document as JSON |
//! | anything else | `OPTIONS` | 200, empty body (CORS preflight) |
//! | anything else | other | access policies, then forwarded upstream |
//!
//! Every response carries wildcard CORS headers.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, map_response, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tower::Service;
use tracing::{debug, error, warn};

use crate::attestation::ATTESTATION_PATH;
use crate::gate::{self, AllowedPaths};
use crate::key::Verifier;
use crate::proxy::{self, Forwarder};
use crate::state::Generation;

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Access policies applied to proxied requests
#[derive(Debug, Clone, Default)]
pub struct Policies {
    pub allowed_paths: AllowedPaths,
    pub api_keys: Option<Verifier>,
}

/// Set the wildcard CORS headers, replacing any existing values
pub fn cors(headers: &mut HeaderMap) {
    let any = HeaderValue::from_static("*");
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_METHODS, any.clone());
    headers.insert(header::ACCESS_CONTROL_ALLOW_HEADERS, any);
}

async fn with_cors(mut response: Response) -> Response {
    cors(response.headers_mut());
    response
}

/// Answer CORS preflights on proxied paths without consulting the gates
///
/// Browsers never attach credentials to a preflight, so it must not reach
/// the API key check.
async fn answer_preflight(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        return StatusCode::OK.into_response();
    }
    next.run(request).await
}

/// Serve the current attestation document
async fn attestation(
    State(current): State<watch::Receiver<Arc<Generation>>>,
    method: Method,
) -> Response {
    let mut headers = HeaderMap::new();
    cors(&mut headers);

    if method == Method::OPTIONS {
        return (StatusCode::OK, headers).into_response();
    }

    let body = current.borrow().document.to_json();
    match body {
        Ok(body) => {
            headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
            (StatusCode::OK, headers, body).into_response()
        }
        Err(e) => {
            error!("failed to encode attestation document: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, headers).into_response()
        }
    }
}

/// Build the application router
pub fn router(
    current: watch::Receiver<Arc<Generation>>,
    forwarder: Arc<Forwarder>,
    policies: Policies,
) -> Router {
    let mut proxied = Router::new().fallback(proxy::forward).with_state(forwarder);

    // added last runs first: preflight, path gate, then API key
    if let Some(verifier) = policies.api_keys {
        proxied = proxied.layer(from_fn_with_state(Arc::new(verifier), gate::require_api_key));
    }
    if !policies.allowed_paths.is_empty() {
        proxied = proxied.layer(from_fn_with_state(
            Arc::new(policies.allowed_paths),
            gate::require_allowed_path,
        ));
    }
    let proxied = proxied
        .layer(from_fn(answer_preflight))
        .layer(map_response(with_cors));

    Router::new()
        .route(ATTESTATION_PATH, any(attestation))
        .with_state(current)
        .fallback_service(proxied)
}

/// Accept TLS connections and serve `app` on each, one task per connection
pub async fn serve(listener: TcpListener, tls: Arc<rustls::ServerConfig>, app: Router) {
    let acceptor = TlsAcceptor::from(tls);

    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let stream = match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    debug!(%addr, "TLS handshake failed: {}", e);
                    return;
                }
                Err(_) => {
                    debug!(%addr, "TLS handshake timed out");
                    return;
                }
            };

            let service = hyper::service::service_fn(move |mut request: hyper::Request<Incoming>| {
                request.extensions_mut().insert(ConnectInfo(addr));
                app.clone().call(request)
            });

            if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .await
            {
                debug!(%addr, "connection error: {}", e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{sev, AttestationDocument, PredicateType};
    use crate::key::Issuer;
    use crate::state::tests::test_publisher;
    use crate::tls;
    use axum::body::Body;
    use axum::extract::Request;
    use base64::Engine;
    use ed25519_dalek::SigningKey;
    use tower::ServiceExt;

    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn spawn_upstream() -> u16 {
        let app = Router::new().fallback(|| async { "from upstream" });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    fn request(method: &str, uri: &str) -> Request {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn assert_cors(headers: &HeaderMap) {
        for name in [
            header::ACCESS_CONTROL_ALLOW_ORIGIN,
            header::ACCESS_CONTROL_ALLOW_METHODS,
            header::ACCESS_CONTROL_ALLOW_HEADERS,
        ] {
            let values: Vec<_> = headers.get_all(&name).iter().collect();
            assert_eq!(values, vec!["*"], "{name}");
        }
    }

    #[test]
    fn test_cors_never_duplicates() {
        let mut headers = HeaderMap::new();
        headers.append(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("https://a"));
        cors(&mut headers);
        cors(&mut headers);
        assert_cors(&headers);
    }

    #[tokio::test]
    async fn test_attestation_document_served() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _) = test_publisher(dir.path()).await;
        let app = router(
            publisher.subscribe(),
            Arc::new(Forwarder::new(closed_port(), &[]).unwrap()),
            Policies::default(),
        );

        for method in ["GET", "POST"] {
            let resp = app.clone().oneshot(request(method, ATTESTATION_PATH)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/json");
            assert_cors(resp.headers());

            let body = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
            let doc: AttestationDocument = serde_json::from_slice(&body).unwrap();
            assert_eq!(doc, publisher.current().document);
            assert_eq!(doc.format, PredicateType::SevGuestV1);
        }
    }

    #[tokio::test]
    async fn test_attestation_preflight() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _) = test_publisher(dir.path()).await;
        let app = router(
            publisher.subscribe(),
            Arc::new(Forwarder::new(closed_port(), &[]).unwrap()),
            Policies::default(),
        );

        let resp = app.oneshot(request("OPTIONS", ATTESTATION_PATH)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_cors(resp.headers());
        assert!(resp.headers().get(header::CONTENT_TYPE).is_none());
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_path_gate_routes() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _) = test_publisher(dir.path()).await;
        let policies = Policies {
            allowed_paths: AllowedPaths::new(vec!["/api".into()]),
            api_keys: None,
        };
        let app = router(
            publisher.subscribe(),
            Arc::new(Forwarder::new(spawn_upstream().await, &[]).unwrap()),
            policies,
        );

        let resp = app.clone().oneshot(request("GET", "/api")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_cors(resp.headers());
        let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"from upstream");

        for denied in ["/api/x", "/", "/api/"] {
            let resp = app.clone().oneshot(request("GET", denied)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::FORBIDDEN, "{denied}");
            assert_cors(resp.headers());
        }

        // the attestation endpoint is not subject to the allow-list
        let resp = app.oneshot(request("GET", ATTESTATION_PATH)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_policies_compose() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _) = test_publisher(dir.path()).await;
        let issuer = Issuer::from_signing_key(SigningKey::from_bytes(&[5u8; 32]));
        let policies = Policies {
            allowed_paths: AllowedPaths::new(vec!["/api".into()]),
            api_keys: Some(issuer.verifier()),
        };
        let app = router(
            publisher.subscribe(),
            Arc::new(Forwarder::new(spawn_upstream().await, &[]).unwrap()),
            policies,
        );

        // path gate answers first
        let resp = app.clone().oneshot(request("GET", "/other")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);

        let resp = app.clone().oneshot(request("GET", "/api")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let key = issuer.issue(Duration::from_secs(60));
        let authed = Request::builder()
            .uri("/api")
            .header(header::AUTHORIZATION, format!("Bearer {key}"))
            .body(Body::empty())
            .unwrap();
        let resp = app.clone().oneshot(authed).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        // attestation never needs an API key
        let resp = app.oneshot(request("GET", ATTESTATION_PATH)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_preflight_skips_gates() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _) = test_publisher(dir.path()).await;
        let issuer = Issuer::from_signing_key(SigningKey::from_bytes(&[6u8; 32]));
        let policies = Policies {
            allowed_paths: AllowedPaths::new(vec!["/api".into()]),
            api_keys: Some(issuer.verifier()),
        };
        let app = router(
            publisher.subscribe(),
            Arc::new(Forwarder::new(closed_port(), &[]).unwrap()),
            policies,
        );

        for path in ["/api", "/other"] {
            let preflight = Request::builder()
                .method("OPTIONS")
                .uri(path)
                .header(header::ORIGIN, "https://chat.example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "authorization")
                .body(Body::empty())
                .unwrap();
            let resp = app.clone().oneshot(preflight).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK, "{path}");
            assert_cors(resp.headers());
            let body = axum::body::to_bytes(resp.into_body(), 1024).await.unwrap();
            assert!(body.is_empty());
        }

        // the actual request is still gated
        let resp = app.oneshot(request("POST", "/api")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_cors(resp.headers());
    }

    #[tokio::test]
    async fn test_tls_certificate_matches_attestation() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _) = test_publisher(dir.path()).await;
        let leaf = publisher.current().certified_key.cert[0].clone();

        let app = router(
            publisher.subscribe(),
            Arc::new(Forwarder::new(closed_port(), &[]).unwrap()),
            Policies::default(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener, tls::server_config(publisher.subscribe()), app));

        let client = reqwest::Client::builder()
            .add_root_certificate(reqwest::Certificate::from_der(leaf.as_ref()).unwrap())
            .resolve("shim.example.com", addr)
            .tls_info(true)
            .no_proxy()
            .build()
            .unwrap();
        let resp = client
            .get(format!("https://shim.example.com:{}{}", addr.port(), ATTESTATION_PATH))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);

        // what a verifying client does: fingerprint the negotiated certificate
        // and compare it with the report's user data
        let peer = resp
            .extensions()
            .get::<reqwest::tls::TlsInfo>()
            .and_then(|info| info.peer_certificate())
            .unwrap()
            .to_vec();
        let doc: AttestationDocument = serde_json::from_slice(&resp.bytes().await.unwrap()).unwrap();
        let report = base64::engine::general_purpose::STANDARD
            .decode(&doc.body)
            .unwrap();

        let fingerprint = tls::cert_fingerprint(&peer);
        assert_eq!(&sev::report_data(&report).unwrap()[..64], fingerprint.as_bytes());
    }

    #[tokio::test]
    async fn test_router_follows_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let (publisher, _) = test_publisher(dir.path()).await;
        let app = router(
            publisher.subscribe(),
            Arc::new(Forwarder::new(closed_port(), &[]).unwrap()),
            Policies::default(),
        );

        crate::cert::tests::write_cached_cert(dir.path(), "shim.example.com", false);
        assert!(publisher.refresh().await.unwrap());

        let resp = app.oneshot(request("GET", ATTESTATION_PATH)).await.unwrap();
        let body = axum::body::to_bytes(resp.into_body(), 1 << 16).await.unwrap();
        let doc: AttestationDocument = serde_json::from_slice(&body).unwrap();
        assert_eq!(doc, publisher.current().document);
    }
}
