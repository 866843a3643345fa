use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::{header, Method};
use sqlx::postgres::PgPoolOptions;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use encore_api::config::Config;
use encore_api::repositories::{
    ChatRepository, DynChatStore, KnowledgeRepository, MemoryChatStore,
};
use encore_api::services::{
    AuthConfig, AuthService, HealthService, KnowledgeSource, ModelBackend, ModelRouter,
    NotificationService, Notifier, OllamaBackend, TelegramNotifier, TracingNotifier,
    TurnSettings,
};
use encore_api::{build_router, AppServices};
use encore_ollama_client::OllamaClient;
use encore_shared_config::StorageBackend;

/// Build the CORS layer based on configuration.
///
/// In production mode:
/// - If `CORS_ORIGINS` is set, only those origins are allowed
/// - If `CORS_ORIGINS` is not set, CORS requests are rejected (no origins allowed)
///
/// In development mode:
/// - If `CORS_ORIGINS` is set, those origins are used
/// - If `CORS_ORIGINS` is not set, permissive CORS is used for convenience
fn build_cors_layer(config: &Config) -> CorsLayer {
    match &config.cors_allowed_origins {
        Some(origins) if !origins.is_empty() => {
            let allowed_origins: Vec<_> = origins
                .iter()
                .filter_map(|origin| {
                    origin.parse().ok().or_else(|| {
                        tracing::warn!("Invalid CORS origin '{}', skipping", origin);
                        None
                    })
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::error!("No valid CORS origins configured, CORS requests will be rejected");
                CorsLayer::new()
            } else {
                tracing::info!(
                    "CORS configured with {} allowed origin(s): {:?}",
                    allowed_origins.len(),
                    origins
                );
                CorsLayer::new()
                    .allow_origin(allowed_origins)
                    .allow_methods([
                        Method::GET,
                        Method::POST,
                        Method::PUT,
                        Method::PATCH,
                        Method::DELETE,
                        Method::OPTIONS,
                    ])
                    .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
                    .allow_credentials(true)
                    .max_age(std::time::Duration::from_secs(3600))
            }
        }
        _ if config.is_production() => {
            tracing::warn!(
                "CORS_ORIGINS not configured in production mode. \
                 CORS requests will be rejected. Set CORS_ORIGINS to allow cross-origin requests."
            );
            CorsLayer::new()
        }
        _ => {
            tracing::warn!(
                "Using permissive CORS in development mode. \
                 Set CORS_ORIGINS for production-like behavior."
            );
            CorsLayer::permissive()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "encore_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    tracing::info!("Starting Encore API server on port {}", config.port);

    // Storage
    let (store, knowledge, pool): (DynChatStore, Arc<dyn KnowledgeSource>, _) =
        match config.common.storage {
            StorageBackend::Postgres => {
                tracing::info!("Connecting to database...");
                let database = config.database();
                let pool = PgPoolOptions::new()
                    .max_connections(database.max_connections)
                    .min_connections(database.min_connections)
                    .acquire_timeout(std::time::Duration::from_secs(
                        database.connect_timeout_secs,
                    ))
                    .idle_timeout(std::time::Duration::from_secs(database.idle_timeout_secs))
                    .connect(&database.url)
                    .await
                    .context("Failed to connect to database")?;
                tracing::info!("Database connection established");

                tracing::info!("Running database migrations...");
                sqlx::migrate!("./migrations").run(&pool).await?;
                tracing::info!("Migrations completed successfully");

                let store: DynChatStore = Arc::new(ChatRepository::new(pool.clone()));
                let knowledge: Arc<dyn KnowledgeSource> =
                    Arc::new(KnowledgeRepository::new(pool.clone()));
                (store, knowledge, Some(pool))
            }
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage, conversations are lost on restart");
                let memory = Arc::new(MemoryChatStore::new());
                let store: DynChatStore = memory.clone();
                let knowledge: Arc<dyn KnowledgeSource> = memory;
                (store, knowledge, None)
            }
        };

    // Model backends
    let models = config.models();
    let primary = OllamaBackend::new(&models.primary).context("Failed to create primary backend")?;
    let mut health = HealthService::new(pool).with_backend(
        models.primary.name.clone(),
        Arc::new(OllamaClient::new(&models.primary)?),
    );
    tracing::info!(backend = %primary.name(), "Primary model backend configured");

    let secondary: Option<Arc<dyn ModelBackend>> = match &models.fallback {
        Some(fallback) => {
            let backend =
                OllamaBackend::new(fallback).context("Failed to create fallback backend")?;
            tracing::info!(backend = %backend.name(), "Fallback model backend configured");
            health = health.with_backend(
                fallback.name.clone(),
                Arc::new(OllamaClient::new(fallback)?),
            );
            Some(Arc::new(backend))
        }
        None => {
            tracing::info!("No fallback model backend, rate limits end the turn");
            None
        }
    };
    let router = ModelRouter::new(Arc::new(primary), secondary);

    // Notifications
    let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(TracingNotifier)];
    if let Some(telegram) = config.telegram() {
        notifiers.push(Arc::new(TelegramNotifier::new(telegram.clone())?));
        tracing::info!("Telegram notifications enabled");
    }
    let notifier = NotificationService::new(notifiers);

    let auth = AuthService::new(AuthConfig::new(config.jwt_secret.clone()));

    let settings = TurnSettings {
        max_tool_steps: config.max_tool_steps,
        turn_timeout: config.turn_timeout(),
    };

    let services = AppServices::new(store, knowledge, router, notifier, auth, health, settings);

    let app = build_router(services)
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&config));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
