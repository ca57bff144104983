//! # Twitter Stream Ingestor
//!
//! One session walks `Idle → LoadingVocabulary → Authenticating → Connecting
//! → Streaming → Terminated`: it snapshots the poll options, signs a filter
//! request tracking them, dials it through the [`ConnectionManager`] and
//! turns every decoded message into zero or more votes. Any failure jumps
//! straight to `Terminated`.
//!
//! [`TwitterStreamIngestor::run`] supervises sessions. Recoverable endings
//! are retried after a backoff, rejected credentials and local stops are not.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::connections::stream_conn::{ConnectionError, ConnectionManager, Dialer};
use crate::core::decoder::{ChunkSource, DecodeError, StreamDecoder, DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_STALL_TIMEOUT};
use crate::core::dispatcher::{EmitError, Vote, VoteEmitter};
use crate::core::matcher::KeywordMatcher;
use crate::core::options::{load_vocabulary, OptionsSource, StorageError};
use crate::retrieve::backoff::{ReconnectPolicy, RATE_LIMIT_FLOOR};
use crate::retrieve::stream_http::StreamRequest;
use crate::signing::oauth1::{RequestSigner, SignError};

/// Tunables for the stream sessions.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// The filter endpoint.
    pub endpoint: Url,
    /// Per-record size limit.
    pub max_message_bytes: usize,
    /// Longest tolerated silence on an open stream.
    pub stall_timeout: Duration,
    /// Retry behaviour of [`TwitterStreamIngestor::run`].
    pub reconnect: ReconnectPolicy,
}

impl StreamConfig {
    /// Defaults for everything but the endpoint.
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Where a session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session has started yet.
    Idle,
    /// Reading poll options.
    LoadingVocabulary,
    /// Signing the filter request.
    Authenticating,
    /// Dialing the endpoint.
    Connecting,
    /// Decoding messages and emitting votes.
    Streaming,
    /// The session is over.
    Terminated,
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionEnd {
    /// Poll options could not be read.
    StorageFailed(StorageError),
    /// There were no options to track.
    NoOptions,
    /// The request could not be signed.
    SigningFailed(SignError),
    /// The endpoint could not be reached or refused the request.
    DialFailed(ConnectionError),
    /// The stream stopped delivering records.
    StreamEnded(DecodeError),
    /// The vote consumer went away.
    ConsumerGone,
    /// Shutdown was requested.
    Shutdown,
}

impl SessionEnd {
    /// Whether the supervisor should stop instead of retrying.
    pub fn is_final(&self) -> bool {
        match self {
            SessionEnd::ConsumerGone | SessionEnd::Shutdown => true,
            SessionEnd::StreamEnded(e) => !e.is_recoverable(),
            SessionEnd::DialFailed(e) => matches!(e, ConnectionError::Closed) || e.is_auth_failure(),
            _ => false,
        }
    }
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionEnd::StorageFailed(e) => write!(f, "loading poll options failed: {}", e),
            SessionEnd::NoOptions => write!(f, "no poll options to track"),
            SessionEnd::SigningFailed(e) => write!(f, "signing failed: {}", e),
            SessionEnd::DialFailed(e) => write!(f, "dial failed: {}", e),
            SessionEnd::StreamEnded(e) => write!(f, "stream ended: {}", e),
            SessionEnd::ConsumerGone => write!(f, "vote consumer is gone"),
            SessionEnd::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

/// What one session did.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Records decoded.
    pub messages: u64,
    /// Votes handed to the consumer.
    pub votes: u64,
    /// Why the session ended.
    pub end: SessionEnd,
}

/// Why the supervisor gave up.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The endpoint rejected our credentials.
    #[error("Stream endpoint rejected the credentials: {0}")]
    Unauthorized(ConnectionError),

    /// Too many sessions in a row failed.
    #[error("Giving up after {attempts} failed sessions, last: {last}")]
    RetriesExhausted {
        /// Consecutive failed sessions.
        attempts: u32,
        /// How the last one ended.
        last: String,
    },
}

/// Streams matching statuses and emits a vote per matched option.
pub struct TwitterStreamIngestor<S, D> {
    config: StreamConfig,
    options: S,
    signer: RequestSigner,
    connections: Arc<ConnectionManager<D>>,
    emitter: VoteEmitter,
    shutdown: CancellationToken,
    state: watch::Sender<SessionState>,
}

impl<S: OptionsSource, D: Dialer> TwitterStreamIngestor<S, D> {
    /// Wires an ingestor. `shutdown` should be the token the emitter was
    /// created with, so a stop request also frees a blocked emit.
    pub fn new(
        config: StreamConfig,
        options: S,
        signer: RequestSigner,
        connections: Arc<ConnectionManager<D>>,
        emitter: VoteEmitter,
        shutdown: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            options,
            signer,
            connections,
            emitter,
            shutdown,
            state,
        }
    }

    /// The current session state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watches state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// The connection manager. Closing it ends the current session with
    /// [`DecodeError::Cancelled`], which also stops [`run`](Self::run).
    pub fn connections(&self) -> &Arc<ConnectionManager<D>> {
        &self.connections
    }

    /// Stops the ingestor: cancels the token and closes the connection,
    /// which unblocks a read in progress.
    pub async fn shutdown(&self) {
        log::info!("Shutting down stream ingestor");
        self.shutdown.cancel();
        self.connections.close().await;
    }

    /// Runs sessions until shutdown, a fatal error or too many failures.
    pub async fn run(&self) -> Result<(), IngestError> {
        let policy = self.config.reconnect;
        let mut failures: u32 = 0;

        loop {
            let outcome = self.run_session().await;
            let summary = outcome.end.to_string();

            if outcome.end.is_final() {
                return match outcome.end {
                    SessionEnd::DialFailed(e) if e.is_auth_failure() => {
                        log::error!("Credentials rejected, not reconnecting: {}", e);
                        Err(IngestError::Unauthorized(e))
                    }
                    _ => {
                        log::info!("Stream ingestor stopped: {}", summary);
                        Ok(())
                    }
                };
            }

            if outcome.messages > 0 {
                failures = 0;
            }
            failures += 1;
            if !policy.allows(failures) {
                log::error!("Stream session failed {} times in a row, giving up: {}", failures, summary);
                return Err(IngestError::RetriesExhausted {
                    attempts: failures,
                    last: summary,
                });
            }

            let mut delay = policy.delay_for(failures);
            if matches!(&outcome.end, SessionEnd::DialFailed(e) if e.is_rate_limited()) {
                delay = delay.max(RATE_LIMIT_FLOOR);
            }
            log::warn!(
                "Stream session ended ({}). Reconnecting in {:?} (attempt {}/{})",
                summary,
                delay,
                failures,
                policy.max_attempts
            );

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    log::info!("Shutdown requested while waiting to reconnect");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Runs one session to its end.
    pub async fn run_session(&self) -> SessionOutcome {
        let mut outcome = SessionOutcome {
            messages: 0,
            votes: 0,
            end: SessionEnd::Shutdown,
        };
        outcome.end = self.drive(&mut outcome.messages, &mut outcome.votes).await;

        if matches!(outcome.end, SessionEnd::Shutdown) {
            // A dial racing the shutdown may have registered after close().
            self.connections.close().await;
        }
        self.set_state(SessionState::Terminated);
        log::info!(
            "Stream session ended after {} messages and {} votes: {}",
            outcome.messages,
            outcome.votes,
            outcome.end
        );
        outcome
    }

    async fn drive(&self, messages: &mut u64, votes: &mut u64) -> SessionEnd {
        if self.shutdown.is_cancelled() {
            return SessionEnd::Shutdown;
        }

        self.set_state(SessionState::LoadingVocabulary);
        let vocabulary = match load_vocabulary(&self.options).await {
            Ok(vocabulary) => vocabulary,
            Err(e) => return SessionEnd::StorageFailed(e),
        };
        if vocabulary.is_empty() {
            return SessionEnd::NoOptions;
        }
        let matcher = KeywordMatcher::new(&vocabulary);

        self.set_state(SessionState::Authenticating);
        let request = match StreamRequest::filter(&self.config.endpoint, &vocabulary, &self.signer) {
            Ok(request) => request,
            Err(e) => return SessionEnd::SigningFailed(e),
        };

        self.set_state(SessionState::Connecting);
        let dialed = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
            dialed = self.connections.dial(&request) => dialed,
        };
        let connection = match dialed {
            Ok(connection) => connection,
            Err(_) if self.shutdown.is_cancelled() => return SessionEnd::Shutdown,
            Err(e) => return SessionEnd::DialFailed(e),
        };
        let id = connection.id();

        self.set_state(SessionState::Streaming);
        let mut decoder = StreamDecoder::new(connection)
            .with_max_message_bytes(self.config.max_message_bytes)
            .with_stall_timeout(self.config.stall_timeout);
        let end = self.pump(&mut decoder, &matcher, messages, votes).await;

        self.connections.release(id).await;
        end
    }

    async fn pump<C: ChunkSource>(
        &self,
        decoder: &mut StreamDecoder<C>,
        matcher: &KeywordMatcher,
        messages: &mut u64,
        votes: &mut u64,
    ) -> SessionEnd {
        loop {
            let decoded = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return SessionEnd::Shutdown,
                decoded = decoder.next_message() => decoded,
            };
            let message = match decoded {
                Ok(message) => message,
                Err(_) if self.shutdown.is_cancelled() => return SessionEnd::Shutdown,
                Err(e) => return SessionEnd::StreamEnded(e),
            };
            *messages += 1;

            for option in matcher.matches(message.body()) {
                match self.emitter.emit(Vote::new(option)).await {
                    Ok(()) => *votes += 1,
                    Err(EmitError::Shutdown) => return SessionEnd::Shutdown,
                    Err(EmitError::ConsumerGone) => return SessionEnd::ConsumerGone,
                }
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            log::debug!("Stream session: {:?} -> {:?}", previous, state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::credentials::Credentials;
    use crate::core::decoder::ByteStream;
    use crate::core::dispatcher::vote_channel;
    use crate::core::options::StaticOptions;
    use bytes::Bytes;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    // Hands out scripted bodies (or HTTP statuses) in order.
    #[derive(Default)]
    struct ScriptedDialer {
        script: Mutex<VecDeque<Result<Vec<&'static str>, u16>>>,
        dials: Mutex<u32>,
    }

    impl ScriptedDialer {
        fn new(script: Vec<Result<Vec<&'static str>, u16>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                dials: Mutex::new(0),
            }
        }

        fn dials(&self) -> u32 {
            *self.dials.lock().unwrap()
        }
    }

    impl Dialer for ScriptedDialer {
        async fn open(&self, _request: &StreamRequest) -> Result<ByteStream, ConnectionError> {
            *self.dials.lock().unwrap() += 1;
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(chunks)) => {
                    let items: Vec<Result<Bytes, std::io::Error>> =
                        chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
                    Ok(Box::pin(stream::iter(items)))
                }
                Some(Err(status)) => Err(ConnectionError::HttpStatus {
                    status,
                    body: String::new(),
                }),
                None => Err(ConnectionError::Connect("script exhausted".to_string())),
            }
        }
    }

    fn config(max_attempts: u32) -> StreamConfig {
        let mut config = StreamConfig::new(Url::parse("https://stream.example.test/filter.json").unwrap());
        config.reconnect = ReconnectPolicy::new(Duration::ZERO, Duration::ZERO, max_attempts);
        config
    }

    fn ingestor(
        options: &[&str],
        script: Vec<Result<Vec<&'static str>, u16>>,
        max_attempts: u32,
    ) -> (
        TwitterStreamIngestor<StaticOptions, ScriptedDialer>,
        tokio::sync::mpsc::Receiver<Vote>,
    ) {
        let shutdown = CancellationToken::new();
        let (emitter, rx) = vote_channel(16, shutdown.clone());
        let signer = RequestSigner::new(Arc::new(Credentials::new("ck", "cs", "at", "as")));
        let connections = Arc::new(ConnectionManager::new(ScriptedDialer::new(script)));
        let ingestor = TwitterStreamIngestor::new(
            config(max_attempts),
            StaticOptions::new(options.iter().copied()),
            signer,
            connections,
            emitter,
            shutdown,
        );
        (ingestor, rx)
    }

    #[tokio::test]
    async fn test_session_emits_votes_then_terminates() {
        let (ingestor, mut rx) = ingestor(
            &["cat", "dog"],
            vec![Ok(vec!["{\"text\":\"my cat\"}\r\n", "{\"text\":\"Dog and CAT\"}\r\n"])],
            0,
        );
        assert_eq!(ingestor.state(), SessionState::Idle);

        let outcome = ingestor.run_session().await;
        assert_eq!(outcome.messages, 2);
        assert_eq!(outcome.votes, 3);
        assert!(matches!(outcome.end, SessionEnd::StreamEnded(DecodeError::Closed)));
        assert_eq!(ingestor.state(), SessionState::Terminated);
        assert!(!ingestor.connections().is_connected());

        let mut got = Vec::new();
        while let Ok(vote) = rx.try_recv() {
            got.push(vote.option);
        }
        assert_eq!(got, ["cat", "cat", "dog"]);
    }

    #[tokio::test]
    async fn test_empty_vocabulary_never_dials() {
        let (ingestor, _rx) = ingestor(&["  ", ""], vec![], 0);
        let outcome = ingestor.run_session().await;
        assert!(matches!(outcome.end, SessionEnd::NoOptions));
        assert_eq!(ingestor.connections().dialer().dials(), 0);
        assert_eq!(ingestor.state(), SessionState::Terminated);
    }

    #[tokio::test]
    async fn test_unauthorized_is_fatal() {
        let (ingestor, _rx) = ingestor(&["cat"], vec![Err(401), Ok(vec![])], 5);
        let err = ingestor.run().await.unwrap_err();
        assert!(matches!(err, IngestError::Unauthorized(_)));
        assert_eq!(ingestor.connections().dialer().dials(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let (ingestor, _rx) = ingestor(&["cat"], vec![Err(500), Err(503), Err(502)], 2);
        let err = ingestor.run().await.unwrap_err();
        assert!(matches!(err, IngestError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(ingestor.connections().dialer().dials(), 3);
    }

    #[tokio::test]
    async fn test_shutdown_before_start_skips_the_session() {
        let (ingestor, _rx) = ingestor(&["cat"], vec![Ok(vec![])], 3);
        ingestor.shutdown().await;
        ingestor.run().await.unwrap();
        assert_eq!(ingestor.connections().dialer().dials(), 0);
    }

    #[test]
    fn test_final_endings() {
        assert!(SessionEnd::Shutdown.is_final());
        assert!(SessionEnd::ConsumerGone.is_final());
        assert!(SessionEnd::StreamEnded(DecodeError::Cancelled).is_final());
        assert!(!SessionEnd::StreamEnded(DecodeError::Closed).is_final());
        assert!(!SessionEnd::NoOptions.is_final());
        assert!(SessionEnd::DialFailed(ConnectionError::HttpStatus { status: 403, body: String::new() }).is_final());
        assert!(!SessionEnd::DialFailed(ConnectionError::HttpStatus { status: 429, body: String::new() }).is_final());
    }
}
