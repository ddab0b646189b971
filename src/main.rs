mod agent;
mod config;
mod db;
mod errors;
mod geocoding;
mod models;
mod routes;
mod service;

use std::sync::Arc;

use anyhow::Context;
use axum::{Router, routing::get, routing::post};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::OllamaAgentService;
use crate::config::AppConfig;
use crate::db::message_repository::MessageRepository;
use crate::db::session_repository::SessionRepository;
use crate::geocoding::amap::AmapGeocoder;
use crate::geocoding::enricher::GeocodingEnricher;
use crate::routes::api_routes::{chat_handler, list_messages_handler, list_sessions_handler};
use crate::routes::ws_routes::ws_chat_handler;
use crate::service::chat_service::ChatService;
use crate::service::orchestrator::ChatOrchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "travel_planner=debug,tower_http=debug".into()),
        )
        .init();

    let config = AppConfig::from_env()?;

    // ── Database ──────────────────────────────────────────────────────────────
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to PostgreSQL")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("Failed to run database migrations")?;

    info!("Database connection established and migrations applied");

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let agent = Arc::new(OllamaAgentService::new(&config.ollama_base_url, &config.ollama_model));

    if config.amap_api_key.is_none() {
        warn!("AMAP_API_KEY is not set; itinerary points will stay unresolved");
    }
    let geocoder = AmapGeocoder::new(&config.amap_base_url, config.amap_api_key.clone())
        .context("Failed to build geocoding client")?;
    let enricher = Arc::new(GeocodingEnricher::new(Arc::new(geocoder), config.enrichment.clone()));

    let orchestrator = Arc::new(ChatOrchestrator::new(agent.clone(), enricher));
    let chat_service = ChatService::new(
        SessionRepository::new(pool.clone()),
        MessageRepository::new(pool),
        orchestrator,
        agent,
    );

    // ── Router ────────────────────────────────────────────────────────────────
    let app = Router::new()
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions", get(list_sessions_handler))
        .route("/api/sessions/{id}/messages", get(list_messages_handler))
        .route("/ws/chat", get(ws_chat_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(chat_service);

    // ── Listen ────────────────────────────────────────────────────────────────
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{addr}/ (model {})", config.ollama_model);

    axum::serve(listener, app).await?;
    Ok(())
}
