//! The authenticated principal behind a connection.
//!
//! `Identity` is produced by the external Token Verifier and is read-only
//! within the core: nothing here mutates it, and nothing here issues or
//! refreshes the credential that produced it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stable identity id, opaque to the core beyond equality and hashing.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub uuid::Uuid);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Guest,
    Member,
    Moderator,
    Admin,
}

impl Role {
    /// Races always need a displayable identity for the roster and chat;
    /// guests may not create or join one (§10.6).
    pub fn can_join_race(&self) -> bool {
        !matches!(self, Role::Guest)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub role: Role,
    pub avatar: Option<String>,
}

impl Identity {
    pub fn guest(id: IdentityId, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            role: Role::Guest,
            avatar: None,
        }
    }
}
