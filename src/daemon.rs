use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cloud::Cloud;
use crate::config::Config;
use crate::gallery::LocalGallery;
use crate::gemini::{GeminiClient, GenerationGateway};
use crate::storage::ObjectStore;
use crate::{db, server};

pub fn object_store(config: &Config) -> ObjectStore {
    if config.storage.signing_key.is_none() {
        warn!("no [storage].signing_key configured, signed URLs will not survive a restart");
    }
    ObjectStore::new(
        config.bucket_path(),
        &config.public_base_url(),
        config.storage.signing_key.as_deref(),
    )
}

/// The cloud tier, if a user identity is configured.
pub fn cloud_for(config: &Config, pool: &SqlitePool, objects: &Arc<ObjectStore>) -> Option<Arc<Cloud>> {
    match config.cloud.user_id.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(user_id) => Some(Arc::new(Cloud::new(
            pool.clone(),
            objects.clone(),
            user_id.to_string(),
            config.signed_url_ttl(),
        ))),
        None => {
            info!("no [cloud].user_id configured, running local-only");
            None
        }
    }
}

pub async fn run(config: Config) -> Result<()> {
    let pool = db::create_pool(&config).await.context("creating database")?;
    info!(db_path = %config.db_path().display(), "database ready");

    let gateway: Arc<dyn GenerationGateway> =
        Arc::new(GeminiClient::from_config(&config).context("creating Gemini client")?);

    let objects = Arc::new(object_store(&config));
    let cloud = cloud_for(&config, &pool, &objects);
    let instructions = server::instructions_debouncer(pool.clone(), config.debounce_delay());

    let config = Arc::new(config);
    let cancel = CancellationToken::new();

    let app_state = server::AppState {
        pool: pool.clone(),
        config: config.clone(),
        gateway,
        objects,
        local_gallery: Arc::new(LocalGallery::new(config.local_gallery_path())),
        cloud,
        instructions: instructions.clone(),
    };

    let router = server::build_router(app_state);
    let listener = tokio::net::TcpListener::bind(&config.mumin.listen)
        .await
        .with_context(|| format!("binding to {}", config.mumin.listen))?;

    info!(listen = %config.mumin.listen, "HTTP server listening");

    // Run the server with graceful shutdown
    let server_cancel = cancel.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                server_cancel.cancelled().await;
            })
            .await
    });

    wait_for_shutdown().await;
    info!("shutdown signal received");

    cancel.cancel();

    let shutdown_timeout = std::time::Duration::from_secs(10);
    let _ = tokio::time::timeout(shutdown_timeout, async {
        let _ = server_handle.await;
    })
    .await;

    // Commit edits still waiting out their quiet period
    let flushed = instructions.flush().await;
    if flushed > 0 {
        info!(count = flushed, "pending instruction edits committed");
    }

    pool.close().await;
    info!("shutdown complete");

    Ok(())
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
