mod config;
mod db;
mod error;
mod handlers;
mod models;
mod scanner;
mod services;
mod storage;
mod validate;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::services::BlobStore;
use crate::storage::{build_provider, StorageProvider};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub config: Arc<Config>,
    pub storage: Arc<dyn StorageProvider>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "securevault=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting SecureVault...");

    // Load configuration
    let config = Config::load()?;
    let config = Arc::new(config);
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::new(&config.database.path).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    // Initialize storage backend
    let storage = build_provider(&config.storage)?;
    tracing::info!("Storage backend: {}", storage.storage_type());

    // Sweep blob rows orphaned by an earlier crash before taking traffic
    let grace = chrono::Duration::seconds(config.scan.pending_grace_secs as i64);
    match BlobStore::reconcile(&db, storage.as_ref(), grace).await {
        Ok(reclaimed) if reclaimed > 0 => {
            tracing::info!("Startup reconciliation reclaimed {} blob(s)", reclaimed)
        }
        Ok(_) => {}
        Err(e) => tracing::error!("Startup reconciliation failed: {}", e),
    }

    let state = AppState {
        db,
        config: config.clone(),
        storage,
    };

    // Build router
    let app = create_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Multipart framing overhead on top of the per-file ceiling
    let body_limit = state.config.upload.max_size as usize + 1024 * 1024;

    let api_routes = Router::new()
        .route(
            "/files",
            post(handlers::file::upload_file).get(handlers::file::list_files),
        )
        .route(
            "/files/duplicates/cleanup",
            post(handlers::file::cleanup_duplicates),
        )
        .route(
            "/files/:id",
            get(handlers::file::get_file).delete(handlers::file::delete_file),
        )
        .route("/files/:id/download", get(handlers::file::download_file))
        .route("/stats/storage", get(handlers::file::storage_stats));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
