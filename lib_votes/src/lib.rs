//! # lib_votes
//!
//! The ingestion core of `twittervotes`. It signs and opens a long-lived
//! streaming request against the Twitter filter endpoint, decodes the endless
//! sequence of JSON records it returns, matches each message against the
//! active poll options and pushes one vote per match onto a channel owned by
//! the downstream tally.
//!
//! Modules are laid out by concern:
//! - **`configs`**: credential loading from the environment.
//! - **`signing`**: OAuth 1.0a request signing.
//! - **`connections`**: the single-connection manager and the storage backend.
//! - **`retrieve`**: the HTTP streaming dialer and reconnect backoff.
//! - **`core`**: vocabulary, stream decoder, keyword matcher and vote emitter.
//! - **`ingestors`**: the stream session state machine and its supervisor.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod configs;
pub mod connections;
pub mod core;
pub mod ingestors;
pub mod retrieve;
pub mod signing;

// Re-export the types most callers need.
pub use configs::credentials::{CredentialError, CredentialStore, Credentials};
pub use connections::stream_conn::{Connection, ConnectionError, ConnectionManager, Dialer};
pub use crate::core::dispatcher::{vote_channel, EmitError, Vote, VoteEmitter};
pub use crate::core::options::{load_vocabulary, OptionsSource, StaticOptions, StorageError, Vocabulary};
pub use ingestors::twitter_stream::{
    IngestError, SessionEnd, SessionOutcome, SessionState, StreamConfig, TwitterStreamIngestor,
};
pub use retrieve::backoff::ReconnectPolicy;
pub use retrieve::stream_http::{HttpStreamDialer, StreamRequest};
pub use signing::oauth1::{OAuthStamp, RequestSigner, SignError};
