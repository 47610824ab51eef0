//! `WordSource`: supplies the token list a Test Session or Race judges
//! keystrokes against (§4.5, §4.6, §6).

use crate::error::CollabError;
use async_trait::async_trait;
use racetype_common::event::{RaceMode, TestMode};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchMode {
    Time,
    Words,
}

impl From<TestMode> for FetchMode {
    fn from(mode: TestMode) -> Self {
        match mode {
            TestMode::Time => FetchMode::Time,
            TestMode::Words => FetchMode::Words,
        }
    }
}

impl From<RaceMode> for FetchMode {
    fn from(mode: RaceMode) -> Self {
        match mode {
            RaceMode::Time => FetchMode::Time,
            RaceMode::Words => FetchMode::Words,
        }
    }
}

#[derive(Clone, Debug)]
pub struct WordRequest {
    pub list_id: Option<String>,
    pub language: String,
    pub count: usize,
    pub mode: FetchMode,
}

#[async_trait]
pub trait WordSource: Send + Sync {
    /// An ordered list of tokens to type, in presentation order. The
    /// engine never reorders or deduplicates what comes back: reference
    /// text immutability (§8) depends on this being exactly what gets
    /// sent to `test:joined`/`race:start`.
    async fn fetch(&self, request: WordRequest) -> Result<Vec<String>, CollabError>;
}

/// A small built-in corpus, enough to drive the default binary and
/// integration tests without a real word-list service.
pub struct StaticWordSource {
    corpus: Vec<&'static str>,
}

impl StaticWordSource {
    pub fn new() -> Self {
        Self {
            corpus: vec![
                "the", "quick", "brown", "fox", "jumps", "over", "lazy", "dog", "while",
                "code", "compiles", "slowly", "under", "heavy", "load", "across", "every",
                "single", "worker", "thread", "until", "dawn", "breaks", "silently",
            ],
        }
    }
}

impl Default for StaticWordSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WordSource for StaticWordSource {
    async fn fetch(&self, request: WordRequest) -> Result<Vec<String>, CollabError> {
        if self.corpus.is_empty() {
            return Err(CollabError::NoWordlistsAvailable);
        }
        let count = request.count.max(1);
        Ok((0..count).map(|i| self.corpus[i % self.corpus.len()].to_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_returns_exactly_the_requested_count() {
        let source = StaticWordSource::new();
        let words = source
            .fetch(WordRequest { list_id: None, language: "en".into(), count: 50, mode: FetchMode::Words })
            .await
            .unwrap();
        assert_eq!(words.len(), 50);
    }
}
