//! # Connections Module
//!
//! This module handles the connections to external services: the single
//! live streaming connection and the poll options database.

/// The owner of the one live streaming connection.
pub mod stream_conn;

/// PostgreSQL-backed poll options loader.
#[cfg(feature = "postgres")]
pub mod db_postgres;
