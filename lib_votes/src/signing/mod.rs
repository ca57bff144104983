//! # Request Signing
//!
//! Authentication for the streaming endpoint. Only the OAuth 1.0a HMAC-SHA1
//! scheme the feed requires is implemented.

/// OAuth 1.0a `Authorization` header construction.
pub mod oauth1;
