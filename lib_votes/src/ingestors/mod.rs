//! # Data Ingestors Module
//!
//! Long-running clients that pull data from an external source and feed it
//! into the vote channel.
//!
//! - **`twitter_stream`**: the filter-stream session state machine and the
//!   supervisor loop that reconnects it.

/// The Twitter filter-stream ingestor.
pub mod twitter_stream;

pub use twitter_stream::{IngestError, SessionEnd, SessionOutcome, SessionState, StreamConfig, TwitterStreamIngestor};
