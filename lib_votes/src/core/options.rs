//! # Poll Options
//!
//! The stream tracks whatever options the stored polls currently offer. A
//! session snapshots them once, before the request is signed, into an ordered
//! [`Vocabulary`] that stays fixed for the session's lifetime.

use std::future::Future;

use thiserror::Error;

/// Errors raised by a poll options backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The backend could not be reached.
    #[error("Failed to connect to storage: {0}")]
    ConnectionError(String),

    /// The options query failed.
    #[error("Query execution failed: {0}")]
    QueryError(String),
}

/// A read-only source of stored poll option lists.
pub trait OptionsSource: Send + Sync {
    /// Every stored poll's options, one list per poll, in storage order.
    fn poll_options(&self) -> impl Future<Output = Result<Vec<Vec<String>>, StorageError>> + Send;
}

/// A fixed list of options, typically from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticOptions {
    options: Vec<String>,
}

impl StaticOptions {
    /// Wraps `options` as a single poll.
    pub fn new<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            options: options.into_iter().map(Into::into).collect(),
        }
    }
}

impl OptionsSource for StaticOptions {
    async fn poll_options(&self) -> Result<Vec<Vec<String>>, StorageError> {
        Ok(vec![self.options.clone()])
    }
}

/// The ordered set of option terms tracked by one stream session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Vocabulary {
    terms: Vec<String>,
}

impl Vocabulary {
    /// Flattens poll option lists in order. Options that are blank after
    /// trimming are dropped, the rest are kept as stored, duplicates included.
    pub fn from_polls<I, P>(polls: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: IntoIterator<Item = String>,
    {
        let terms = polls
            .into_iter()
            .flatten()
            .filter(|term| !term.trim().is_empty())
            .collect();
        Self { terms }
    }

    /// The terms in vocabulary order.
    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    /// Number of terms.
    pub fn len(&self) -> usize {
        self.terms.len()
    }

    /// True when there is nothing to track.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// The `track` parameter value: terms joined with commas.
    pub fn track_param(&self) -> String {
        self.terms.join(",")
    }
}

/// Reads all option lists from `source` and flattens them into a vocabulary.
pub async fn load_vocabulary<S: OptionsSource>(source: &S) -> Result<Vocabulary, StorageError> {
    let polls = source.poll_options().await?;
    let vocabulary = Vocabulary::from_polls(polls);
    log::info!("Loaded {} poll options", vocabulary.len());
    Ok(vocabulary)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TwoPolls;

    impl OptionsSource for TwoPolls {
        async fn poll_options(&self) -> Result<Vec<Vec<String>>, StorageError> {
            Ok(vec![
                vec!["happy".to_string(), "sad".to_string()],
                vec!["win".to_string(), "".to_string(), "lose".to_string(), " \t".to_string(), "happy".to_string()],
            ])
        }
    }

    struct Broken;

    impl OptionsSource for Broken {
        async fn poll_options(&self) -> Result<Vec<Vec<String>>, StorageError> {
            Err(StorageError::QueryError("relation \"polls\" does not exist".to_string()))
        }
    }

    #[tokio::test]
    async fn test_load_vocabulary_flattens_in_order() {
        let vocabulary = load_vocabulary(&TwoPolls).await.unwrap();
        assert_eq!(vocabulary.terms(), ["happy", "sad", "win", "lose", "happy"]);
        assert_eq!(vocabulary.track_param(), "happy,sad,win,lose,happy");
    }

    #[test]
    fn test_from_polls_keeps_stored_spelling() {
        let polls = vec![vec![" cat ".to_string(), "  ".to_string(), "Dog".to_string()]];
        let vocabulary = Vocabulary::from_polls(polls);
        assert_eq!(vocabulary.terms(), [" cat ", "Dog"]);
    }

    #[tokio::test]
    async fn test_load_vocabulary_propagates_storage_error() {
        let err = load_vocabulary(&Broken).await.unwrap_err();
        assert!(matches!(err, StorageError::QueryError(_)));
    }

    #[tokio::test]
    async fn test_static_options() {
        let vocabulary = load_vocabulary(&StaticOptions::new(["cat", "dog"])).await.unwrap();
        assert_eq!(vocabulary.len(), 2);
        assert!(!vocabulary.is_empty());

        let empty = load_vocabulary(&StaticOptions::default()).await.unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.track_param(), "");
    }
}
