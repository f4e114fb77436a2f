use std::sync::Arc;

use axum::{
    Router,
    routing::{get, patch, post},
};
use tokio::net::TcpListener;
use tower_http::decompression::RequestDecompressionLayer;
use tracing::{error, info, warn};

use super::{services, state::AppState};
use crate::batch::{BatchProcessor, HttpBatchProcessor, MockBatchProcessor};
use crate::catalog::StacCatalog;
use crate::config::Config;
use crate::http::HttpClient;
use crate::ledger::FjallRegistry;
use crate::notify::HttpNotificationSink;
use crate::regions::RegionCatalog;
use crate::storage::StorageClient;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/requests", post(services::submit_request))
        .route(
            "/tasks",
            get(services::list_tasks).patch(services::patch_tasks),
        )
        .route(
            "/tasks/{task_id}",
            get(services::get_task)
                .patch(services::patch_task)
                .delete(services::delete_task),
        )
        .route("/tasks/{task_id}/cancel", post(services::cancel_task))
        .route("/tasks/{task_id}/sync", post(services::sync_task))
        .route("/tasks/{task_id}/dispatch", post(services::dispatch_task))
        .route("/health", get(services::health))
        .with_state(state)
        // Handles Content-Encoding transparently before the handlers see the body
        .layer(RequestDecompressionLayer::new())
}

/// Wire the collaborators described by `config` and serve until a
/// shutdown signal arrives.
pub async fn run(config: Config) -> Result<(), AnyError> {
    info!(path = %config.server.registry_path.display(), "Opening task registry");
    let registry = FjallRegistry::open(&config.server.registry_path)
        .map_err(|e| format!("Failed to open task registry: {e}"))?;

    let storage = StorageClient::from_config(&config.storage)
        .map_err(|e| format!("Failed to initialise object storage: {e}"))?;

    let regions = match &config.regions.path {
        Some(path) => RegionCatalog::load(path, &config.regions.code_property)
            .map_err(|e| format!("Failed to load region catalog: {e}"))?,
        None => {
            warn!("No region catalog configured, only bbox requests will resolve");
            RegionCatalog::default()
        }
    };

    let http_config = config.batch.http_config();
    let processor: Arc<dyn BatchProcessor> = if config.batch.mock {
        warn!("Using the in-process mock batch processor");
        Arc::new(MockBatchProcessor::new())
    } else {
        let client = HttpClient::new(http_config.clone(), config.batch.client_secret.clone())?;
        Arc::new(HttpBatchProcessor::new(client, config.batch.endpoint.clone()))
    };

    let catalog = StacCatalog::new(
        HttpClient::new(http_config.clone(), None)?,
        config.catalog.url.clone(),
        config.catalog.page_size,
        config.catalog.max_pages,
    );

    let notifier = match &config.notification.url {
        Some(url) => Some(HttpNotificationSink::new(
            HttpClient::new(http_config, None)?,
            url.clone(),
        )),
        None => None,
    };

    let address = config.server.bind_addr;
    let mut state = AppState::new(
        config,
        Arc::new(registry.clone()),
        processor,
        Arc::new(catalog),
        storage,
        regions,
    );
    if let Some(notifier) = notifier {
        state = state.with_notifier(Arc::new(notifier));
    }

    let app = router(state);
    let listener = TcpListener::bind(address).await?;
    info!(%address, "geobatch API listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    registry
        .persist()
        .map_err(|e| format!("Failed to flush task registry: {e}"))?;
    info!("Task registry flushed");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
