//! `TokenVerifier`: the Authentication Gate's sole dependency on an
//! external identity provider (§4.8, §6).

use crate::error::CollabError;
use async_trait::async_trait;
use racetype_common::identity::{Identity, IdentityId, Role};
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    /// Resolve a bearer token to the identity it authenticates as. The
    /// core treats this as the single source of truth for role and
    /// display name; it never caches a verdict across connections.
    async fn verify(&self, bearer: &str) -> Result<Identity, CollabError>;
}

/// A fixed-table verifier for the default binary and integration tests:
/// tokens are looked up verbatim against a preconfigured map.
pub struct StaticTokenVerifier {
    tokens: Mutex<HashMap<String, Identity>>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self { tokens: Mutex::new(HashMap::new()) }
    }

    pub fn with_identity(self, bearer: impl Into<String>, identity: Identity) -> Self {
        #[allow(clippy::unwrap_used)]
        self.tokens.lock().unwrap().insert(bearer.into(), identity);
        self
    }

    pub fn issue_guest(&self, bearer: impl Into<String>, id: IdentityId, display_name: impl Into<String>) {
        let identity = Identity {
            id,
            display_name: display_name.into(),
            role: Role::Guest,
            avatar: None,
        };
        #[allow(clippy::unwrap_used)]
        self.tokens.lock().unwrap().insert(bearer.into(), identity);
    }
}

impl Default for StaticTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, bearer: &str) -> Result<Identity, CollabError> {
        #[allow(clippy::unwrap_used)]
        self.tokens
            .lock()
            .unwrap()
            .get(bearer)
            .cloned()
            .ok_or_else(|| CollabError::InvalidToken(bearer.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn known_token_resolves_to_its_identity() {
        let id = IdentityId(Uuid::new_v4());
        let verifier = StaticTokenVerifier::new().with_identity(
            "tok-1",
            Identity { id, display_name: "ada".into(), role: Role::Member, avatar: None },
        );
        let identity = verifier.verify("tok-1").await.unwrap();
        assert_eq!(identity.id, id);
    }

    #[tokio::test]
    async fn unknown_token_is_rejected() {
        let verifier = StaticTokenVerifier::new();
        assert!(verifier.verify("nope").await.is_err());
    }
}
