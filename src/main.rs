use anyhow::{Context, Result};
use axum::Router;
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use xdrive_trash::{
    config::{AppConfig, RunMode},
    db, routes,
    services::storage_service::StorageService,
    state::AppState,
    store::local::LocalObjectStore,
    trash::{TrashContext, TrashCoordinator, TrashLayout},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting xdrive-trash with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)
            .with_context(|| format!("creating storage directory {}", cfg.storage_dir))?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db = Arc::new(db::connect(&cfg.database_url).await?);

    if mode == RunMode::Migrate {
        db::run_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(());
    }

    // --- Initialize core services ---
    let storage = StorageService::new(db.clone(), cfg.storage_dir.clone());
    let trash = TrashCoordinator::new(
        LocalObjectStore::new(storage.clone()),
        TrashLayout::new(cfg.trash_prefix.clone()),
    );

    if let RunMode::PurgeExpired { bucket } = &mode {
        return purge_expired(&trash, &cfg, bucket).await;
    }

    let state = AppState::new(storage, trash, cfg.default_profile.clone());
    let shutdown = state.shutdown.clone();

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => tracing::info!("Shutdown requested"),
                Err(err) => tracing::warn!("Could not listen for ctrl-c: {}", err),
            }
            shutdown.cancel();
        }
    });

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    Ok(())
}

/// One explicit retention pass over `bucket`, then exit.
async fn purge_expired(
    trash: &TrashCoordinator<LocalObjectStore>,
    cfg: &AppConfig,
    bucket: &str,
) -> Result<()> {
    let ctx = TrashContext::new(cfg.default_profile.clone(), bucket);
    let report = trash
        .purge_older_than(&ctx, cfg.retention)
        .await
        .with_context(|| format!("listing trash of {}", bucket))?;

    for failure in &report.failed {
        tracing::warn!("could not purge {}: {}", failure.key, failure.error);
    }
    tracing::info!(
        "Purged {} entries older than {} from {} ({} failed)",
        report.succeeded.len(),
        humantime::format_duration(cfg.retention),
        bucket,
        report.failed.len()
    );

    if !report.is_complete() {
        anyhow::bail!("{} trash entries could not be purged", report.failed.len());
    }
    Ok(())
}
