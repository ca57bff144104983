use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_votes::configs::credentials::load_env_file;
use lib_votes::{vote_channel, ConnectionManager, CredentialStore, HttpStreamDialer, RequestSigner, TwitterStreamIngestor};

mod votes_logic;
use votes_logic::backend::OptionsBackend;
use votes_logic::{config, logger, sink};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = config::load_config();
    logger::setup_logging(&settings.log_dir, &settings.log_level)?;

    load_env_file(&settings.env_file);
    let signer = build_signer(&CredentialStore::from_env())?;

    let stream_config = settings.stream_config()?;
    let backend = OptionsBackend::from_settings(&settings);
    let dialer = HttpStreamDialer::new().context("Failed to build the HTTP client")?;

    let shutdown = CancellationToken::new();
    let (emitter, votes) = vote_channel(settings.vote_buffer, shutdown.clone());
    let ingestor = Arc::new(TwitterStreamIngestor::new(
        stream_config,
        backend,
        signer,
        Arc::new(ConnectionManager::new(dialer)),
        emitter,
        shutdown,
    ));

    let sink_handle = tokio::spawn(sink::run(votes));
    let mut worker = tokio::spawn({
        let ingestor = Arc::clone(&ingestor);
        async move { ingestor.run().await }
    });

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            ingestor.shutdown().await;
            (&mut worker).await
        }
        finished = &mut worker => finished,
    };

    // The sink finishes once the last emitter is dropped.
    drop(ingestor);
    let counts = sink_handle.await.context("Vote sink task failed")?;
    log::info!("Shutdown complete. {} votes received.", counts.total);

    outcome.context("Ingestion worker panicked")??;
    Ok(())
}

/// Resolves the four secrets. Runs before any network client is built, so a
/// missing one stops startup without dialing.
fn build_signer(store: &CredentialStore) -> Result<RequestSigner> {
    let credentials = store.get().context("Failed to load stream credentials")?;
    Ok(RequestSigner::new(credentials))
}

async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut term_signal) => {
                    term_signal.recv().await;
                }
                Err(e) => {
                    log::warn!("Could not install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            // On non-unix platforms, just wait forever.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate => {
            log::info!("SIGTERM received, initiating shutdown.");
        }
    }
}
