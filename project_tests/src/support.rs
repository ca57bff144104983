//! # Scripted Dialer
//!
//! An in-memory [`Dialer`] that plays back a script of responses and records
//! `open#n` / `close#n` events, where a close is the body being dropped.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use lib_votes::core::decoder::ByteStream;
use lib_votes::{
    vote_channel, ConnectionError, ConnectionManager, Credentials, Dialer, OptionsSource, ReconnectPolicy,
    RequestSigner, StaticOptions, StreamConfig, StreamRequest, TwitterStreamIngestor, Vote,
};

/// Shared event log.
pub type Events = Arc<Mutex<Vec<String>>>;

/// One scripted dial.
#[derive(Debug, Clone)]
pub enum Script {
    /// A body delivering these chunks, then ending.
    Body(Vec<&'static str>),
    /// A body delivering these chunks, then staying open and silent.
    Held(Vec<&'static str>),
    /// An HTTP error status.
    Status(u16),
}

struct CloseGuard {
    n: u64,
    events: Events,
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        self.events.lock().unwrap().push(format!("close#{}", self.n));
    }
}

/// Plays back a [`Script`] per dial.
#[derive(Default)]
pub struct FakeDialer {
    script: Mutex<VecDeque<Script>>,
    events: Events,
    opened: AtomicU64,
}

impl FakeDialer {
    pub fn new(script: Vec<Script>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub fn events(&self) -> Events {
        Arc::clone(&self.events)
    }

    pub fn dials(&self) -> u64 {
        self.opened.load(Ordering::SeqCst)
    }
}

impl Dialer for FakeDialer {
    async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, ConnectionError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        let next = self.script.lock().unwrap().pop_front();
        let (chunks, hold) = match next {
            Some(Script::Body(chunks)) => (chunks, false),
            Some(Script::Held(chunks)) => (chunks, true),
            Some(Script::Status(status)) => {
                return Err(ConnectionError::HttpStatus {
                    status,
                    body: String::new(),
                });
            }
            None => return Err(ConnectionError::Connect("connection refused".to_string())),
        };

        self.events.lock().unwrap().push(format!("open#{}", n));
        let guard = CloseGuard {
            n,
            events: Arc::clone(&self.events),
        };
        let state = (VecDeque::from(chunks), hold, guard);
        let body = stream::unfold(state, |(mut chunks, hold, guard)| async move {
            match chunks.pop_front() {
                Some(chunk) => Some((Ok(Bytes::from_static(chunk.as_bytes())), (chunks, hold, guard))),
                None if hold => {
                    std::future::pending::<()>().await;
                    None
                }
                None => None,
            }
        });
        Ok(Box::pin(body))
    }
}

pub type Ingestor<S> = TwitterStreamIngestor<S, FakeDialer>;

/// Test credentials.
pub fn signer() -> RequestSigner {
    RequestSigner::new(Arc::new(Credentials::new("ck", "cs", "at", "as")))
}

/// A filter request with a throwaway signature.
pub fn request() -> StreamRequest {
    StreamRequest::new(
        Url::parse("https://stream.example.test/1.1/statuses/filter.json").unwrap(),
        vec![("track".to_string(), "cat".to_string())],
        "OAuth test".to_string(),
    )
}

/// Session tunables with instant reconnects.
pub fn config(max_attempts: u32) -> StreamConfig {
    let mut config = StreamConfig::new(Url::parse("https://stream.example.test/1.1/statuses/filter.json").unwrap());
    config.stall_timeout = Duration::from_secs(30);
    config.reconnect = ReconnectPolicy::new(Duration::ZERO, Duration::ZERO, max_attempts);
    config
}

/// An ingestor over `options` and `dialer`.
pub fn ingestor_with<S: OptionsSource>(
    options: S,
    dialer: FakeDialer,
    buffer: usize,
    config: StreamConfig,
) -> (Arc<Ingestor<S>>, mpsc::Receiver<Vote>) {
    let shutdown = CancellationToken::new();
    let (emitter, votes) = vote_channel(buffer, shutdown.clone());
    let ingestor = TwitterStreamIngestor::new(
        config,
        options,
        signer(),
        Arc::new(ConnectionManager::new(dialer)),
        emitter,
        shutdown,
    );
    (Arc::new(ingestor), votes)
}

/// An ingestor tracking a fixed option list.
pub fn ingestor(
    options: &[&str],
    script: Vec<Script>,
    buffer: usize,
    max_attempts: u32,
) -> (Arc<Ingestor<StaticOptions>>, mpsc::Receiver<Vote>) {
    ingestor_with(
        StaticOptions::new(options.iter().copied()),
        FakeDialer::new(script),
        buffer,
        config(max_attempts),
    )
}

/// Everything currently waiting in the channel.
pub fn drain(votes: &mut mpsc::Receiver<Vote>) -> Vec<String> {
    let mut got = Vec::new();
    while let Ok(vote) = votes.try_recv() {
        got.push(vote.option);
    }
    got
}

pub fn events_of(events: &Events) -> Vec<String> {
    events.lock().unwrap().clone()
}
