use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_votes::configs::credentials::DEFAULT_ENV_FILE;
use lib_votes::retrieve::stream_http::DEFAULT_STREAM_URL;
use lib_votes::{ReconnectPolicy, StreamConfig};
use url::Url;

const DEFAULT_CONFIG_FILE: &str = "server_votes.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[command(about = "Streams poll votes from the Twitter filter endpoint", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[arg(long, env = "VOTES_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[arg(long, env = "VOTES_ENV_FILE", help = "Dotenv file holding the stream credentials.")]
    pub env_file: Option<PathBuf>,

    #[arg(long, env = "VOTES_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, env = "VOTES_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[arg(long, env = "VOTES_STREAM_URL", help = "Streaming filter endpoint.")]
    pub stream_url: Option<String>,

    #[arg(long, env = "VOTES_POSTGRES_URL", help = "PostgreSQL connection string for the polls table.")]
    pub postgres_url: Option<String>,

    #[arg(long, env = "VOTES_OPTIONS", help = "Comma separated options to track instead of reading PostgreSQL.")]
    pub options: Option<String>,

    #[arg(long, env = "VOTES_BUFFER", help = "Capacity of the vote channel.")]
    pub vote_buffer: Option<usize>,

    #[arg(long, env = "VOTES_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds between stream reconnects.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[arg(long, env = "VOTES_RECONNECT_MAX_DELAY_MS", help = "Maximum delay in milliseconds between stream reconnects.")]
    pub reconnect_max_delay_ms: Option<u64>,

    #[arg(long, env = "VOTES_MAX_RECONNECT_ATTEMPTS", help = "Consecutive failed sessions before giving up (0 = never reconnect).")]
    pub max_reconnect_attempts: Option<u32>,

    #[arg(long, env = "VOTES_STALL_TIMEOUT_SECONDS", help = "Seconds without any data before the stream is considered dead.")]
    pub stall_timeout_seconds: Option<u64>,

    #[arg(long, env = "VOTES_MAX_MESSAGE_BYTES", help = "Largest accepted stream record in bytes.")]
    pub max_message_bytes: Option<usize>,
}

/// Fully resolved configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub env_file: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub stream_url: String,
    pub postgres_url: String,
    pub options: Option<Vec<String>>,
    pub vote_buffer: usize,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32,
    pub stall_timeout_seconds: u64,
    pub max_message_bytes: usize,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            env_file: other.env_file.or(self.env_file),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            stream_url: other.stream_url.or(self.stream_url),
            postgres_url: other.postgres_url.or(self.postgres_url),
            options: other.options.or(self.options),
            vote_buffer: other.vote_buffer.or(self.vote_buffer),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_delay_ms: other.reconnect_max_delay_ms.or(self.reconnect_max_delay_ms),
            max_reconnect_attempts: other.max_reconnect_attempts.or(self.max_reconnect_attempts),
            stall_timeout_seconds: other.stall_timeout_seconds.or(self.stall_timeout_seconds),
            max_message_bytes: other.max_message_bytes.or(self.max_message_bytes),
        }
    }

    fn defaults() -> Config {
        Config {
            env_file: Some(PathBuf::from(DEFAULT_ENV_FILE)),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            stream_url: Some(DEFAULT_STREAM_URL.to_string()),
            postgres_url: Some("postgres://localhost/ballots".to_string()),
            vote_buffer: Some(1),
            reconnect_base_delay_ms: Some(1000),
            reconnect_max_delay_ms: Some(60000),
            max_reconnect_attempts: Some(10),
            stall_timeout_seconds: Some(90),
            max_message_bytes: Some(1024 * 1024),
            ..Default::default()
        }
    }

    // Every field has a default, so only `options` can stay unset.
    fn into_settings(self) -> Settings {
        let fallback = Config::defaults();
        let options = self.options.map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|option| !option.is_empty())
                .map(str::to_string)
                .collect()
        });

        Settings {
            env_file: self.env_file.or(fallback.env_file).unwrap_or_default(),
            log_dir: self.log_dir.or(fallback.log_dir).unwrap_or_default(),
            log_level: self.log_level.or(fallback.log_level).unwrap_or_default(),
            stream_url: self.stream_url.or(fallback.stream_url).unwrap_or_default(),
            postgres_url: self.postgres_url.or(fallback.postgres_url).unwrap_or_default(),
            options,
            vote_buffer: self.vote_buffer.or(fallback.vote_buffer).unwrap_or(1),
            reconnect_base_delay_ms: self.reconnect_base_delay_ms.or(fallback.reconnect_base_delay_ms).unwrap_or_default(),
            reconnect_max_delay_ms: self.reconnect_max_delay_ms.or(fallback.reconnect_max_delay_ms).unwrap_or_default(),
            max_reconnect_attempts: self.max_reconnect_attempts.or(fallback.max_reconnect_attempts).unwrap_or_default(),
            stall_timeout_seconds: self.stall_timeout_seconds.or(fallback.stall_timeout_seconds).unwrap_or_default(),
            max_message_bytes: self.max_message_bytes.or(fallback.max_message_bytes).unwrap_or_default(),
        }
    }
}

impl Settings {
    /// Session tunables for the stream ingestor.
    pub fn stream_config(&self) -> Result<StreamConfig> {
        let endpoint = Url::parse(&self.stream_url).with_context(|| format!("Invalid stream URL: {}", self.stream_url))?;
        let mut config = StreamConfig::new(endpoint);
        config.max_message_bytes = self.max_message_bytes;
        config.stall_timeout = Duration::from_secs(self.stall_timeout_seconds);
        config.reconnect = ReconnectPolicy::new(
            Duration::from_millis(self.reconnect_base_delay_ms),
            Duration::from_millis(self.reconnect_max_delay_ms),
            self.max_reconnect_attempts,
        );
        Ok(config)
    }
}

pub fn load_config() -> Settings {
    // CLI arguments already include environment variables.
    load_config_with(Config::parse())
}

/// Layers defaults < config file < CLI/env.
pub fn load_config_with(cli: Config) -> Settings {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli).into_settings()
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let Ok(config_str) = fs::read_to_string(path) else {
        log::warn!("Failed to read config file: {}. Falling back to other sources.", path.display());
        return None;
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(file_config) => Some(file_config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
