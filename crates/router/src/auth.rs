//! The Authentication & Authorization Gate (§4.8): resolves the bearer
//! credential presented at handshake to an [`Identity`] and nothing else.
//! Per-event authorization (role capability checks) lives in `dispatch`,
//! next to the events they gate.

use axum::http::HeaderMap;
use racetype_collab::TokenVerifier;
use racetype_common::error::{CoreError, ErrorKind};
use racetype_common::identity::Identity;
use std::sync::Arc;

/// Pull a bearer credential out of an `Authorization: Bearer <token>`
/// header. Connection query-string tokens are handled by the caller since
/// they arrive through axum's `Query` extractor, not headers.
pub fn bearer_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::to_string)
}

pub struct AuthGate {
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthGate {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// §4.8: a missing credential is `AUTH_REQUIRED`; one the verifier
    /// rejects is `AUTH_INVALID`. Both fail the handshake before a
    /// connection is ever registered.
    pub async fn authenticate(&self, bearer: Option<String>) -> Result<Identity, CoreError> {
        let bearer = bearer.ok_or_else(|| CoreError::new(ErrorKind::AuthRequired, "missing bearer credential"))?;
        self.verifier.verify(&bearer).await.map_err(CoreError::from)
    }
}
