//! # Data Retrieval Module
//!
//! The network side of the stream: building and sending the signed filter
//! request, and deciding how long to wait before trying again.
//!
//! - **`stream_http`**: the `reqwest` based [`Dialer`](crate::Dialer) that
//!   opens the long-lived response body.
//! - **`backoff`**: exponential reconnect delays with jitter.

/// Signed streaming requests over HTTP.
pub mod stream_http;

/// Reconnect delay policy.
pub mod backoff;
