//! Token gate for the `/api` tree
//!
//! Outside development mode every request must carry
//! `Authorization: Basic <token>` matching the connection descriptor. The
//! check is stateless: possession of the token at request time is the only
//! thing verified.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use super::connection::ConnectionDescriptor;

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateFailure {
    MissingToken { path: String },
    IncorrectToken,
}

impl GateFailure {
    fn body(&self) -> String {
        match self {
            GateFailure::MissingToken { path } => format!("missing token {}", path),
            GateFailure::IncorrectToken => "incorrect token".to_string(),
        }
    }
}

impl IntoResponse for GateFailure {
    fn into_response(self) -> Response {
        (
            StatusCode::UNAUTHORIZED,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.body(),
        )
            .into_response()
    }
}

/// Decide whether a request may proceed.
pub fn admit(
    headers: &HeaderMap,
    path: &str,
    descriptor: &ConnectionDescriptor,
) -> Result<(), GateFailure> {
    if descriptor.is_dev() {
        return Ok(());
    }
    debug!(target: "auth", path, "checking API token");

    let provided = headers
        .get(header::AUTHORIZATION)
        .map(|v| v.as_bytes())
        .unwrap_or_default();

    if provided.is_empty() {
        error!(
            target: "auth",
            path,
            possible_attack = true,
            "missing token in API request; this could be an attack on the API"
        );
        return Err(GateFailure::MissingToken {
            path: path.to_string(),
        });
    }

    if !timing_safe_eq(provided, descriptor.expected_authorization().as_bytes()) {
        error!(
            target: "auth",
            path,
            possible_attack = true,
            "incorrect token in API request; this could be an attack on the API"
        );
        return Err(GateFailure::IncorrectToken);
    }
    Ok(())
}

/// Axum middleware applying [`admit`] to every request it wraps.
pub async fn token_gate(
    State(descriptor): State<Arc<ConnectionDescriptor>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    match admit(req.headers(), req.uri().path(), &descriptor) {
        Ok(()) => next.run(req).await,
        Err(failure) => failure.into_response(),
    }
}

/// Constant-time byte comparison.
pub fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut out = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        out |= x ^ y;
    }
    out == 0
}
