//! # Keyword Matcher
//!
//! A message votes for every vocabulary term it contains, compared
//! case-insensitively as plain substrings. Matches come out in vocabulary
//! order, all of them, so one message can carry several votes.

use crate::core::options::Vocabulary;

/// Vocabulary terms pre-lowercased for one session.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    terms: Vec<(String, String)>,
}

impl KeywordMatcher {
    /// Prepares `vocabulary` for matching.
    pub fn new(vocabulary: &Vocabulary) -> Self {
        let terms = vocabulary
            .terms()
            .iter()
            .map(|term| (term.clone(), term.to_lowercase()))
            .collect();
        Self { terms }
    }

    /// The original terms contained in `text`, in vocabulary order.
    pub fn matches<'a>(&'a self, text: &str) -> impl Iterator<Item = &'a str> + 'a {
        let haystack = text.to_lowercase();
        self.terms
            .iter()
            .filter(move |(_, lowered)| haystack.contains(lowered.as_str()))
            .map(|(term, _)| term.as_str())
    }

    /// Number of terms being tracked.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// True when no term is tracked.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}
