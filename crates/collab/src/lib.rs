//! Collaborator contracts (§6): the four traits the engines consume from
//! the surrounding product, plus in-memory reference implementations for
//! the default binary and integration tests.

mod error;
mod friend_graph;
mod result_sink;
mod token_verifier;
mod word_source;

pub use error::CollabError;
pub use friend_graph::{FriendGraph, StaticFriendGraph};
pub use result_sink::{record_with_retry, InMemoryResultSink, RaceResult, ResultSink, SessionResult, TestResult};
pub use token_verifier::{StaticTokenVerifier, TokenVerifier};
pub use word_source::{FetchMode, StaticWordSource, WordRequest, WordSource};
