use anyhow::{bail, Context, Result};
use mien_core::{FaceExtractor, FacePipeline};
use tracing_subscriber::EnvFilter;

mod config;
mod enroll;
mod extractor;
mod index;
mod protocol;
mod server;
mod session;
mod state;
mod store;
#[cfg(test)]
mod testutil;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("miend starting");

    let cfg = config::Config::from_env()?;

    // Models load before anything else; a daemon that cannot extract
    // embeddings has nothing to serve.
    let pipeline = FacePipeline::load(&cfg.model_dir)
        .with_context(|| format!("loading models from {}", cfg.model_dir.display()))?;
    if pipeline.embedding_dim() != cfg.embedding_dim {
        bail!(
            "recognition model produces {}-dimensional embeddings but the catalogue is configured for {}",
            pipeline.embedding_dim(),
            cfg.embedding_dim
        );
    }
    let extractor = extractor::spawn_extractor(pipeline);

    if let Some(dir) = &cfg.upload_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating upload dir {}", dir.display()))?;
    }

    let store = store::Store::open(&cfg.db_path, cfg.embedding_dim).await?;
    let (initial_index, outcome) = index::rebuild_index(&store, cfg.embedding_dim).await?;
    tracing::info!(
        size = outcome.size,
        loaded = outcome.loaded,
        skipped = outcome.skipped,
        "index loaded from catalogue"
    );

    let state = state::AppState::new(
        initial_index,
        store,
        extractor,
        cfg.match_threshold,
        cfg.embedding_dim,
        cfg.upload_dir.clone(),
    );
    let app = server::create_app(state);

    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr)
        .await
        .with_context(|| format!("binding {}", cfg.bind_addr))?;
    tracing::info!(addr = %cfg.bind_addr, "miend ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("miend shutting down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
