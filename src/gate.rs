//! Access policies applied before a request reaches the upstream
//!
//! Two independent layers, either, both or neither of which may be enabled:
//! - [`require_allowed_path`]: static exact-match path allow-list (403)
//! - [`require_api_key`]: signed API key in `Authorization: Bearer` (401)

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::debug;

use crate::key::Verifier;

pub const FORBIDDEN_BODY: &str = "shim: 403";
pub const UNAUTHORIZED_BODY: &str = "shim: 401";

/// Exact-match request path allow-list; empty admits everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllowedPaths(Vec<String>);

impl AllowedPaths {
    pub fn new(paths: Vec<String>) -> Self {
        Self(paths)
    }

    /// No prefix matching, no trailing-slash normalization, no wildcards
    pub fn admit(&self, path: &str) -> bool {
        self.0.is_empty() || self.0.iter().any(|p| p == path)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }
}

/// Reject requests whose path is not allow-listed
pub async fn require_allowed_path(
    State(paths): State<Arc<AllowedPaths>>,
    request: Request,
    next: Next,
) -> Response {
    if !paths.admit(request.uri().path()) {
        debug!(path = request.uri().path(), "path not allowed");
        return (StatusCode::FORBIDDEN, FORBIDDEN_BODY).into_response();
    }
    next.run(request).await
}

/// Reject requests without a valid API key
pub async fn require_api_key(
    State(verifier): State<Arc<Verifier>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(api_key) = bearer_token(request.headers()) else {
        debug!("missing API key");
        return (StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY).into_response();
    };

    if let Err(e) = verifier.verify(api_key) {
        debug!("rejected API key: {}", e);
        return (StatusCode::UNAUTHORIZED, UNAUTHORIZED_BODY).into_response();
    }
    next.run(request).await
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
