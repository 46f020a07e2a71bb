//! omni-repository
//!
//! Image artifact repository service. Ingests large binary images by
//! upload or asynchronous pull, verifies them by checksum, optionally
//! republishes them to object storage, and emits lifecycle events.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use omni_repository::{
    api,
    config::Config,
    notify::{CloudEventNotifier, EchoNotifier, Notifier},
    objstore::S3ObjectStore,
    service::ImageService,
    state::AppState,
    store::ImageStore,
    workers::{PushTarget, WorkManager},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting omni-repository");
    info!(
        listen_addr = %config.listen_addr,
        data_folder = %config.data_folder.display(),
        "configuration loaded"
    );

    if !config.data_folder.is_dir() {
        bail!("data folder {} not existed", config.data_folder.display());
    }

    let store = ImageStore::open(&config.database_path)
        .with_context(|| format!("failed to open store at {}", config.database_path.display()))?;
    info!(database = %config.database_path.display(), "image store opened");

    let notifier: Arc<dyn Notifier> = match &config.kafka_brokers {
        Some(brokers) => {
            let notifier = CloudEventNotifier::new(brokers)
                .with_context(|| format!("failed to connect to Kafka brokers {brokers}"))?;
            info!(brokers = %brokers, "cloud event notifier ready");
            Arc::new(notifier)
        }
        None => {
            warn!("no Kafka brokers configured, events will only be logged");
            Arc::new(EchoNotifier)
        }
    };

    // Bucket probe fails fast before any worker starts
    let push_target = match &config.object_storage {
        Some(settings) => {
            let object_store = S3ObjectStore::connect(settings)
                .await
                .context("object store bucket unreachable")?;
            Some(PushTarget {
                object_store: Arc::new(object_store),
                part_size: settings.part_size,
            })
        }
        None => {
            info!("object storage not configured, images will not be published");
            None
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = WorkManager::new(
        config.work_manager.clone(),
        config.puller.clone(),
        store.clone(),
        notifier.clone(),
        push_target,
        config.data_folder.clone(),
    );
    let manager_handle = tokio::spawn(manager.run(shutdown_rx.clone()));

    let service = Arc::new(ImageService::new(
        store,
        notifier,
        config.data_folder.clone(),
    ));
    let state = AppState::new(service, config.upload_token.clone());
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "listening for connections");

    let server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = server_shutdown;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("server exited normally"),
                Ok(Err(e)) => error!(error = %e, "server error"),
                Err(e) => error!(error = %e, "server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(2);
    if let Err(e) = tokio::time::timeout(shutdown_timeout, manager_handle).await {
        warn!(error = %e, "work manager did not shut down in time");
    }

    info!("omni-repository shutdown complete");
    Ok(())
}
