//! # Vote Dispatcher
//!
//! The single outward channel between the ingestion worker (sole producer)
//! and the tally (sole consumer). The channel is bounded and `emit` waits for
//! room instead of dropping, so a slow tally slows the ingestion loop down.
//! A shutdown token releases a producer stuck on a full channel.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use thiserror::Error;

/// Channel capacity when none is configured; close to a rendezvous.
pub const DEFAULT_VOTE_BUFFER: usize = 1;

/// One vote for one poll option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Vote {
    /// The option exactly as stored in the poll.
    pub option: String,
}

impl Vote {
    /// A vote for `option`.
    pub fn new(option: impl Into<String>) -> Self {
        Self {
            option: option.into(),
        }
    }
}

/// Why a vote could not be handed over.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EmitError {
    /// The consumer dropped its receiver.
    #[error("vote consumer is gone")]
    ConsumerGone,

    /// Shutdown was requested while waiting for channel capacity.
    #[error("shutdown requested while emitting")]
    Shutdown,
}

/// Producer half of the vote channel.
#[derive(Debug, Clone)]
pub struct VoteEmitter {
    sender: mpsc::Sender<Vote>,
    shutdown: CancellationToken,
}

/// Creates the vote channel. A `capacity` of zero is raised to one.
pub fn vote_channel(capacity: usize, shutdown: CancellationToken) -> (VoteEmitter, mpsc::Receiver<Vote>) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    (VoteEmitter { sender, shutdown }, receiver)
}

impl VoteEmitter {
    /// Hands `vote` to the consumer, waiting while the channel is full.
    pub async fn emit(&self, vote: Vote) -> Result<(), EmitError> {
        if self.shutdown.is_cancelled() {
            return Err(EmitError::Shutdown);
        }

        log::debug!("vote: {}", vote.option);
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(EmitError::Shutdown),
            sent = self.sender.send(vote) => sent.map_err(|_| EmitError::ConsumerGone),
        }
    }

    /// True once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}
