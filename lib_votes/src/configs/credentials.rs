//! # Twitter Credentials
//!
//! Holds the four OAuth secrets the request signer needs. They are read from
//! the process environment (optionally primed from a dotenv file) exactly once;
//! every later caller gets the same shared, immutable copy.

use std::env;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// Environment variable holding the consumer (application) key.
pub const CONSUMER_KEY_VAR: &str = "SP_TWITTER_KEY";
/// Environment variable holding the consumer (application) secret.
pub const CONSUMER_SECRET_VAR: &str = "SP_TWITTER_SECRET";
/// Environment variable holding the user access token.
pub const ACCESS_TOKEN_VAR: &str = "SP_TWITTER_ACCESSTOKEN";
/// Environment variable holding the user access token secret.
pub const ACCESS_SECRET_VAR: &str = "SP_TWITTER_ACCESSSECRET";

/// Dotenv file read at startup when no other path is configured.
pub const DEFAULT_ENV_FILE: &str = "twittervotes.env";

/// Errors raised while loading credentials.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    /// A required secret is absent or empty.
    #[error("Missing environment variable: {0}")]
    MissingSecret(&'static str),

    /// A previous caller panicked while holding the store lock.
    #[error("Credential store lock poisoned")]
    Poisoned,
}

/// The consumer and access key pairs used to sign stream requests.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Consumer (application) key.
    pub consumer_key: String,
    /// Consumer (application) secret.
    pub consumer_secret: String,
    /// User access token.
    pub access_token: String,
    /// User access token secret.
    pub access_secret: String,
}

impl Credentials {
    /// Builds credentials from explicit values.
    pub fn new(
        consumer_key: impl Into<String>,
        consumer_secret: impl Into<String>,
        access_token: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> Self {
        Self {
            consumer_key: consumer_key.into(),
            consumer_secret: consumer_secret.into(),
            access_token: access_token.into(),
            access_secret: access_secret.into(),
        }
    }

    /// Reads all four secrets through `lookup`. Blank values count as missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CredentialError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fetch = |name: &'static str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .ok_or(CredentialError::MissingSecret(name))
        };

        Ok(Self {
            consumer_key: fetch(CONSUMER_KEY_VAR)?,
            consumer_secret: fetch(CONSUMER_SECRET_VAR)?,
            access_token: fetch(ACCESS_TOKEN_VAR)?,
            access_secret: fetch(ACCESS_SECRET_VAR)?,
        })
    }
}

// Secrets never reach the logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("consumer_key", &mask(&self.consumer_key))
            .field("consumer_secret", &"*****")
            .field("access_token", &mask(&self.access_token))
            .field("access_secret", &"*****")
            .finish()
    }
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    format!("{}*****", visible)
}

type Lookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// # Credential Store
///
/// Owns the loaded [`Credentials`]. Initialization happens under a mutex the
/// first time [`CredentialStore::get`] succeeds, so concurrent first callers
/// still trigger a single load and all observe the same `Arc`.
pub struct CredentialStore {
    lookup: Lookup,
    loaded: Mutex<Option<Arc<Credentials>>>,
}

impl CredentialStore {
    /// A store backed by the process environment.
    pub fn from_env() -> Self {
        Self::with_lookup(|name| env::var(name).ok())
    }

    /// A store backed by an arbitrary variable lookup.
    pub fn with_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        Self {
            lookup: Box::new(lookup),
            loaded: Mutex::new(None),
        }
    }

    /// Returns the credentials, loading them on first use.
    ///
    /// A failed load is not cached: the next call reads the environment again.
    pub fn get(&self) -> Result<Arc<Credentials>, CredentialError> {
        let mut slot = self.loaded.lock().map_err(|_| CredentialError::Poisoned)?;
        if let Some(credentials) = slot.as_ref() {
            return Ok(Arc::clone(credentials));
        }

        let credentials = Arc::new(Credentials::from_lookup(|name| (self.lookup)(name))?);
        log::info!(
            "Loaded Twitter credentials (consumer key {})",
            mask(&credentials.consumer_key)
        );
        *slot = Some(Arc::clone(&credentials));
        Ok(credentials)
    }

    /// Whether a successful load has already happened.
    pub fn is_loaded(&self) -> bool {
        self.loaded.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

/// Loads `path` as a dotenv file into the process environment.
///
/// Returns `false` when the file could not be read; variables already set in
/// the environment are then used as-is.
pub fn load_env_file(path: &Path) -> bool {
    match dotenvy::from_path(path) {
        Ok(()) => {
            log::info!("Loaded environment from {}", path.display());
            true
        }
        Err(e) if e.not_found() => {
            log::warn!(
                "Env file {} not found. Using the process environment only.",
                path.display()
            );
            false
        }
        Err(e) => {
            log::warn!("Failed to load env file {}: {}", path.display(), e);
            false
        }
    }
}
