//! Errors a collaborator implementation can raise. These cross into
//! [`racetype_common::CoreError`] at whichever engine called the
//! collaborator so the wire taxonomy stays the only thing that escapes
//! to a client.

use racetype_common::error::{CoreError, ErrorKind};

#[derive(Debug, thiserror::Error)]
pub enum CollabError {
    #[error("token rejected: {0}")]
    InvalidToken(String),
    #[error("no wordlist available for the request")]
    NoWordlistsAvailable,
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl From<CollabError> for CoreError {
    fn from(err: CollabError) -> Self {
        match err {
            CollabError::InvalidToken(msg) => CoreError::new(ErrorKind::AuthInvalid, msg),
            CollabError::NoWordlistsAvailable => {
                CoreError::new(ErrorKind::NoWordlistsAvailable, "no wordlists available")
            }
            CollabError::Unavailable(msg) => CoreError::new(ErrorKind::ServerError, msg),
        }
    }
}
