//! Business logic services
//!
//! The chat pipeline is composed from:
//! - [`router`]: primary/fallback model routing with rate-limit failover
//! - [`tools`]: tool registries and the deduplicating invocation bridge
//! - [`reconciler`]: per-room serialized persistence of a turn
//! - [`binder`]: room to artist binding, rebinding and forking
//! - [`orchestrator`]: the turn itself, from validation to persistence

pub mod artist_tools;
pub mod auth;
pub mod backend;
pub mod binder;
pub mod health;
pub mod knowledge;
pub mod notifier;
pub mod orchestrator;
pub mod reconciler;
pub mod router;
pub mod schema;
pub mod tools;

pub use artist_tools::ArtistToolSource;
pub use auth::{AuthConfig, AuthService, Claims, Identity};
pub use backend::OllamaBackend;
pub use binder::{Binding, BindingError, RoomArtistBinder};
pub use health::{HealthCheckResponse, HealthService, ServiceHealth, ServiceStatus};
pub use knowledge::KnowledgeSource;
pub use notifier::{
    NotificationEvent, NotificationService, Notifier, TelegramNotifier, TracingNotifier,
};
pub use orchestrator::{
    ChatError, ChatOrchestrator, TurnEvent, TurnRequest, TurnSettings, TurnStream,
};
pub use reconciler::{ConversationReconciler, ReconcileError, ReconcileOutcome, RoomLocks};
pub use router::{BackendError, ModelBackend, ModelRouter, StreamErrorCode};
pub use tools::{ToolBridge, ToolDefinition, ToolSet, ToolSource};
