//! # Stream Connection Manager
//!
//! Owns the one live connection to the streaming endpoint. Dialing while a
//! connection is held closes the old one first, so two connections never
//! overlap. Closing is also how the worker gets stopped: it cancels the held
//! connection's token, which unblocks a read in flight, and drops the body so
//! the socket goes away.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::core::decoder::{ByteStream, ChunkSource, DecodeError};
use crate::retrieve::stream_http::StreamRequest;

/// Upper bound for opening a connection, response headers included.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one dialed connection for the lifetime of a manager.
pub type ConnectionId = u64;

/// Errors raised while dialing.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The endpoint did not answer within the dial timeout.
    #[error("Dial timed out after {0:?}")]
    Timeout(Duration),

    /// The connection was refused or failed before a response arrived.
    #[error("Failed to connect: {0}")]
    Connect(String),

    /// The endpoint answered with a non-success status.
    #[error("Stream endpoint returned HTTP {status}: {body}")]
    HttpStatus {
        /// HTTP status code.
        status: u16,
        /// The start of the response body, for diagnostics.
        body: String,
    },

    /// `close` was called while the dial was in progress.
    #[error("Connection closed while dialing")]
    Closed,
}

impl ConnectionError {
    /// The endpoint rejected the credentials or the request.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ConnectionError::HttpStatus { status: 401 | 403, .. })
    }

    /// The endpoint asked us to slow down.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ConnectionError::HttpStatus { status: 420 | 429, .. })
    }
}

/// Opens the transport for a stream request.
pub trait Dialer: Send + Sync {
    /// Sends `request` and returns the response body once headers arrived.
    fn open(&self, request: &StreamRequest) -> impl Future<Output = Result<ByteStream, ConnectionError>> + Send;
}

// State shared between the manager and the reader of one connection.
struct Shared {
    id: ConnectionId,
    cancel: CancellationToken,
    body: tokio::sync::Mutex<Option<ByteStream>>,
}

impl Shared {
    async fn shutdown(&self) {
        self.cancel.cancel();
        // The reader lets go of the lock as soon as it sees the cancellation.
        let body = self.body.lock().await.take();
        drop(body);
    }
}

/// The reading side of a dialed connection.
pub struct Connection {
    shared: Arc<Shared>,
}

impl Connection {
    /// This connection's id.
    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    /// True once the manager closed this connection.
    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }
}

impl ChunkSource for Connection {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, DecodeError> {
        let shared = &self.shared;
        let mut slot = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return Err(DecodeError::Cancelled),
            slot = shared.body.lock() => slot,
        };
        let Some(body) = slot.as_mut() else {
            return Err(DecodeError::Cancelled);
        };

        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(DecodeError::Cancelled),
            chunk = body.next_chunk() => chunk,
        }
    }
}

/// # Connection Manager
///
/// Holds at most one connection. `dial` replaces it, `close` drops it, and
/// both may be called from any task.
pub struct ConnectionManager<D> {
    dialer: D,
    dial_timeout: Duration,
    held: Mutex<Option<Arc<Shared>>>,
    next_id: AtomicU64,
}

impl<D: Dialer> ConnectionManager<D> {
    /// A manager dialing through `dialer` with the standard timeout.
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            dial_timeout: DIAL_TIMEOUT,
            held: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    /// Overrides the dial timeout.
    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// The underlying dialer.
    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Closes any held connection, then opens a new one for `request`.
    pub async fn dial(&self, request: &StreamRequest) -> Result<Connection, ConnectionError> {
        if let Some(previous) = self.take_held() {
            log::info!("Closing connection #{} before dialing a new one", previous.id);
            previous.shutdown().await;
        }

        let shared = Arc::new(Shared {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            cancel: CancellationToken::new(),
            body: tokio::sync::Mutex::new(None),
        });
        // Another task may have dialed while we were closing.
        if let Some(raced) = self.replace_held(Arc::clone(&shared)) {
            raced.shutdown().await;
        }

        log::info!("Dialing {} (connection #{})", request.url(), shared.id);
        let opened = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => Err(ConnectionError::Closed),
            result = tokio::time::timeout(self.dial_timeout, self.dialer.open(request)) => {
                result.unwrap_or(Err(ConnectionError::Timeout(self.dial_timeout)))
            }
        };

        match opened {
            Ok(body) => {
                *shared.body.lock().await = Some(body);
                if shared.cancel.is_cancelled() {
                    // Closed between the open and the store above.
                    shared.body.lock().await.take();
                    return Err(ConnectionError::Closed);
                }
                log::info!("Connection #{} established", shared.id);
                Ok(Connection { shared })
            }
            Err(e) => {
                log::warn!("Dial of connection #{} failed: {}", shared.id, e);
                self.release(shared.id).await;
                Err(e)
            }
        }
    }

    /// Closes the held connection, if any. Safe to call repeatedly.
    pub async fn close(&self) {
        if let Some(held) = self.take_held() {
            log::info!("Closing connection #{}", held.id);
            held.shutdown().await;
        }
    }

    /// Closes the held connection only if it is still `id`.
    pub async fn release(&self, id: ConnectionId) {
        let released = {
            let mut held = self.lock_held();
            if held.as_ref().map(|shared| shared.id) == Some(id) {
                held.take()
            } else {
                None
            }
        };
        if let Some(shared) = released {
            log::debug!("Releasing connection #{}", id);
            shared.shutdown().await;
        }
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.lock_held().is_some()
    }

    /// Id of the held connection.
    pub fn current_id(&self) -> Option<ConnectionId> {
        self.lock_held().as_ref().map(|shared| shared.id)
    }

    fn take_held(&self) -> Option<Arc<Shared>> {
        self.lock_held().take()
    }

    fn replace_held(&self, shared: Arc<Shared>) -> Option<Arc<Shared>> {
        self.lock_held().replace(shared)
    }

    fn lock_held(&self) -> std::sync::MutexGuard<'_, Option<Arc<Shared>>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
