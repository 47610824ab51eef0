//! The immutable target token sequence a session is judged against (§3).

use crate::event::ReferenceTextWire;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReferenceText {
    tokens: Vec<String>,
    joined: String,
}

impl ReferenceText {
    /// `delimiter` is almost always a single space; kept explicit because
    /// some word lists join on other punctuation.
    pub fn new(tokens: Vec<String>, delimiter: &str) -> Self {
        let joined = tokens.join(delimiter);
        Self { tokens, joined }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn as_str(&self) -> &str {
        &self.joined
    }

    pub fn char_count(&self) -> usize {
        self.joined.chars().count()
    }

    /// The reference character at `position`, or `None` past the end.
    pub fn char_at(&self, position: usize) -> Option<char> {
        self.joined.chars().nth(position)
    }

    pub fn to_wire(&self) -> ReferenceTextWire {
        ReferenceTextWire {
            tokens: self.tokens.clone(),
            text: self.joined.clone(),
            char_count: self.char_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_count_counts_unicode_scalars_not_bytes() {
        let text = ReferenceText::new(vec!["café".to_string(), "au".to_string()], " ");
        assert_eq!(text.char_count(), "café au".chars().count());
    }

    #[test]
    fn char_at_matches_joined_string_indexing() {
        let text = ReferenceText::new(vec!["the".to_string(), "fox".to_string()], " ");
        assert_eq!(text.char_at(0), Some('t'));
        assert_eq!(text.char_at(3), Some(' '));
        assert_eq!(text.char_at(4), Some('f'));
        assert_eq!(text.char_at(100), None);
    }
}
