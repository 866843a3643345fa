//! Encore API library
//!
//! Exposes the API components for the server binary and integration tests.
//! [`AppServices`] wires storage, model routing, tools and notifications
//! into a [`ChatOrchestrator`]; [`build_router`] mounts the HTTP surface.

pub mod config;
pub mod error;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod routes;
pub mod services;

use std::sync::Arc;

use axum::{extract::Extension, routing::get, Router};

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use services::{AuthConfig, AuthService};

use repositories::DynChatStore;
use routes::{chat_router, health_router, rooms_router, ChatState, HealthState, RoomsState};
use services::{
    ArtistToolSource, ChatOrchestrator, ConversationReconciler, HealthService, KnowledgeSource,
    ModelRouter, NotificationService, RoomArtistBinder, RoomLocks, TurnSettings,
};

/// Long-lived services shared by every request
#[derive(Clone)]
pub struct AppServices {
    pub store: DynChatStore,
    pub orchestrator: ChatOrchestrator,
    pub binder: Arc<RoomArtistBinder>,
    pub auth: AuthService,
    pub health: HealthService,
}

impl AppServices {
    /// Compose the chat pipeline
    ///
    /// The reconciler and the binder share one set of room locks, so a fork
    /// never observes a half-applied reconcile.
    pub fn new(
        store: DynChatStore,
        knowledge: Arc<dyn KnowledgeSource>,
        router: ModelRouter,
        notifier: NotificationService,
        auth: AuthService,
        health: HealthService,
        settings: TurnSettings,
    ) -> Self {
        let locks = RoomLocks::new();
        let reconciler = Arc::new(ConversationReconciler::new(store.clone(), locks.clone()));
        let binder = Arc::new(RoomArtistBinder::new(store.clone(), locks));

        let orchestrator = ChatOrchestrator::new(
            router,
            reconciler,
            Arc::clone(&binder),
            knowledge,
            notifier,
            settings,
        )
        .with_tool_source(Arc::new(ArtistToolSource::new(store.clone())));

        Self {
            store,
            orchestrator,
            binder,
            auth,
            health,
        }
    }
}

/// Mount every route; transport layers (CORS, tracing) are left to the caller
pub fn build_router(services: AppServices) -> Router {
    Router::new()
        .route("/", get(root))
        .nest("/health", health_router(HealthState::new(services.health)))
        .nest("/api/chat", chat_router(ChatState::new(services.orchestrator)))
        .nest(
            "/api/rooms",
            rooms_router(RoomsState::new(services.store, services.binder)),
        )
        .layer(Extension(services.auth))
}

async fn root() -> &'static str {
    "Encore chat API"
}
