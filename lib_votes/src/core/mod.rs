//! # Core Engine Module
//!
//! The pieces of the ingestion loop that do not touch the network directly.
//!
//! - **`options`**: the poll-options interface to storage and the per-session
//!   `Vocabulary` snapshot.
//! - **`decoder`**: turns an open-ended byte stream into discrete JSON records.
//! - **`matcher`**: case-insensitive substring matching of a message against
//!   the vocabulary, preserving vocabulary order.
//! - **`dispatcher`**: the bounded vote channel shared with the tally.

/// Poll options loading and the per-session vocabulary.
pub mod options;
/// Incremental JSON record decoding over a chunked body.
pub mod decoder;
/// Vocabulary matching.
pub mod matcher;
/// Vote emission with backpressure.
pub mod dispatcher;

pub use decoder::{ChunkSource, DecodeError, Message, StreamDecoder};
pub use dispatcher::{vote_channel, EmitError, Vote, VoteEmitter};
pub use matcher::KeywordMatcher;
pub use options::{load_vocabulary, OptionsSource, StaticOptions, StorageError, Vocabulary};
