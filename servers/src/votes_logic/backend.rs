use lib_votes::connections::db_postgres::PollStore;
use lib_votes::{OptionsSource, StaticOptions, StorageError};

use super::config::Settings;

/// Where the tracked options come from.
#[derive(Debug, Clone)]
pub enum OptionsBackend {
    /// A fixed list from configuration.
    Static(StaticOptions),
    /// The `polls` table.
    Postgres(PollStore),
}

impl OptionsBackend {
    pub fn from_settings(settings: &Settings) -> Self {
        match &settings.options {
            Some(options) => {
                log::info!("Tracking {} configured options", options.len());
                OptionsBackend::Static(StaticOptions::new(options.iter().cloned()))
            }
            None => {
                let store = PollStore::new(settings.postgres_url.clone());
                log::info!("Reading poll options from {}", store.masked_url());
                OptionsBackend::Postgres(store)
            }
        }
    }
}

impl OptionsSource for OptionsBackend {
    async fn poll_options(&self) -> Result<Vec<Vec<String>>, StorageError> {
        match self {
            OptionsBackend::Static(options) => options.poll_options().await,
            OptionsBackend::Postgres(store) => store.poll_options().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::votes_logic::config::{load_config_with, Config};
    use clap::Parser;

    #[tokio::test]
    async fn test_configured_options_win_over_postgres() {
        let settings = load_config_with(
            Config::try_parse_from(["server_votes", "--config-path", "/nonexistent/x.conf", "--options", "cat,dog"]).unwrap(),
        );
        let backend = OptionsBackend::from_settings(&settings);
        assert!(matches!(backend, OptionsBackend::Static(_)));
        assert_eq!(backend.poll_options().await.unwrap(), vec![vec!["cat".to_string(), "dog".to_string()]]);
    }

    #[test]
    fn test_postgres_is_the_default() {
        let settings = load_config_with(Config::try_parse_from(["server_votes", "--config-path", "/nonexistent/x.conf"]).unwrap());
        assert!(matches!(OptionsBackend::from_settings(&settings), OptionsBackend::Postgres(_)));
    }
}
