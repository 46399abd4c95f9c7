use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use model_server::http::{self, AppState};
use serving_core::{
    ArtifactResolver, CredentialContext, HttpRemoteStore, ModelCache, ServingConfig,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = ServingConfig::load().context("loading configuration")?;
    serving_core::init_tracing();
    info!(port = cfg.listen_port, "starting model-server");

    // Credential failure is startup-fatal: without it every resolve would
    // fail anyway, so refuse to serve prediction traffic at all.
    let credential = Arc::new(
        CredentialContext::load(Path::new(&cfg.credential_path))
            .context("loading service credential")?,
    );
    info!(client = credential.client_email(), "service credential loaded");

    let remote = Arc::new(HttpRemoteStore::new(cfg.remote.base_url.clone(), credential));
    let resolver = ArtifactResolver::new(PathBuf::from(&cfg.cache.dir), remote, cfg.retry_config());
    let cache = Arc::new(ModelCache::new(resolver, cfg.cache.max_entries, cfg.idle_timeout()));
    cache.spawn_sweeper(cfg.sweep_interval());

    let serving = cfg.serving_version();
    match &serving {
        Some(v) => {
            info!(version = %v.id, "warming up serving model");
            cache.spawn_load(v.clone());
        }
        None => warn!("no serving model configured; /predict will return 503"),
    }

    let state = Arc::new(AppState {
        cache,
        serving,
        request_timeout: cfg.request_timeout(),
        limiter: Arc::new(Semaphore::new(cfg.max_concurrent_predictions.max(1))),
    });
    let app = http::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "listening");
    axum::serve(listener, app).await.context("http server exited")?;
    Ok(())
}
