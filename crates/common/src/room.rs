//! Room naming conventions (§4.4): `user:<id>`, `test:<id>`, `race:<id>`.

use crate::identity::IdentityId;
use std::fmt;

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RoomName(String);

impl RoomName {
    pub fn user(id: IdentityId) -> Self {
        Self(format!("user:{id}"))
    }

    pub fn test(id: uuid::Uuid) -> Self {
        Self(format!("test:{id}"))
    }

    pub fn race(id: &str) -> Self {
        Self(format!("race:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
