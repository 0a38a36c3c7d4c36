use crate::config::load_config;
use crate::embeddings::{Embedder, EmbeddingApiClient};
use crate::file_indexer::FileIndexManager;
use crate::gitlab::GitlabApiClient;
use crate::handlers::IssueProcessor;
use crate::model_provisioning::ensure_model;
use crate::openai::OpenAIApiClient;
use crate::polling::PollingService;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod config;
mod embeddings;
mod file_indexer;
mod gitlab;
mod handlers;
mod model_provisioning;
mod models;
mod openai;
mod polling;
mod processed_cache;

#[cfg(test)]
mod tests;

#[tokio::main]
async fn main() -> Result<()> {
    let app_settings = load_config().with_context(|| "Failed to load configuration")?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(app_settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting autopr...");
    info!("Using log level: {}", app_settings.log_level);

    let model_path = ensure_model(&app_settings)
        .await
        .with_context(|| "Failed to provision the embedding model")?;
    info!("Embedding model available at {}", model_path.display());

    if app_settings.download_model_only {
        return Ok(());
    }

    let config_arc = Arc::new(app_settings);

    let gitlab_client = GitlabApiClient::new(config_arc.clone())
        .with_context(|| "Failed to create GitLab client")?;
    let gitlab_client = Arc::new(gitlab_client);
    info!("GitLab API client initialized successfully.");

    let openai_client = OpenAIApiClient::new(&config_arc)
        .with_context(|| "Failed to create OpenAI client")?;
    let openai_client = Arc::new(openai_client);

    let embedder: Arc<dyn Embedder> = Arc::new(
        EmbeddingApiClient::new(&config_arc)
            .with_context(|| "Failed to create embedding client")?,
    );

    let index_manager = Arc::new(FileIndexManager::new(
        gitlab_client.clone(),
        embedder,
        config_arc.clone(),
    ));
    if let Some(cache_path) = &config_arc.embedding_cache_path {
        index_manager.load_cache(cache_path).await?;
    }

    let processor = IssueProcessor::new(
        gitlab_client.clone(),
        openai_client,
        index_manager.clone(),
        config_arc.clone(),
    );
    let polling_service =
        PollingService::new(gitlab_client, processor, index_manager, config_arc.clone());

    if config_arc.once {
        let handled = polling_service.poll_repositories().await;
        info!("Single poll cycle finished, {} issue(s) handled", handled);
        return Ok(());
    }

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_token.cancel(),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    info!(
        "Starting polling service with interval of {} seconds...",
        config_arc.poll_interval_seconds
    );
    polling_service.start_polling(shutdown).await?;

    Ok(())
}
