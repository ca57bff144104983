//! # Configuration Modules
//!
//! Process-level secrets needed before any streaming attempt.

/// Loads and caches the four OAuth secrets from the environment.
pub mod credentials;
