mod agent;
mod config;
mod db;
mod errors;
mod lineage;
mod models;
mod routes;
mod service;
mod stream;
mod upstream;

#[cfg(test)]
mod testing;

use std::sync::Arc;

use axum::{routing::get, routing::patch, routing::post, Router};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::agent::OpenRouterTitleModel;
use crate::config::AppConfig;
use crate::db::blob_store::FsBlobStore;
use crate::db::message_repository::MessageRepository;
use crate::db::thread_repository::ThreadRepository;
use crate::db::PgChatStore;
use crate::lineage::LineageResolver;
use crate::routes::api_routes::{
    edit_message_handler, regenerate_message_handler, send_message_handler, stop_message_handler,
};
use crate::routes::stream_routes::stream_message_handler;
use crate::service::chat_service::ChatService;
use crate::service::title_task::TitleTask;
use crate::stream::StreamRegistry;
use crate::upstream::openrouter::OpenRouterProvider;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // ── Database ──────────────────────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to PostgreSQL: {e}"))?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    info!("Database connection established and migrations applied");

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let store = Arc::new(PgChatStore::new(
        MessageRepository::new(pool.clone()),
        ThreadRepository::new(pool.clone()),
    ));
    let blobs = Arc::new(FsBlobStore::new(&config.blob_root));
    let resolver = LineageResolver::new(
        store.clone(),
        blobs,
        config.attachment_base_path.clone(),
        config.max_lineage_depth,
    );
    let provider = Arc::new(OpenRouterProvider::new(&config.provider_base_url));
    let registry = StreamRegistry::new(store.clone(), resolver, provider, config.subscriber_queue_capacity);

    let title_model = Arc::new(OpenRouterTitleModel::new(&config.provider_base_url, &config.title_model));
    let titles = TitleTask::new(store.clone(), title_model, config.title_timeout);
    let chat_service = ChatService::new(store, registry.clone(), titles);

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        .route("/api/messages", post(send_message_handler))
        .route("/api/messages/{id}", patch(edit_message_handler))
        .route("/api/messages/{id}/stream", get(stream_message_handler))
        .route("/api/messages/{id}/stop", post(stop_message_handler))
        .route(
            "/api/threads/{thread_id}/messages/{id}/regenerate",
            post(regenerate_message_handler),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(chat_service);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(registry))
        .await?;

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}

/// Resolves on Ctrl-C once every live generation has stored its final state,
/// which also ends the open event streams so connections can drain.
async fn shutdown_signal(registry: StreamRegistry) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received, draining {} active stream(s)", registry.active_count());
    registry.shutdown().await;
}
