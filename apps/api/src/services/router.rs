//! Model routing with single-hop failover
//!
//! A [`ModelRouter`] sends one generation step to the primary backend. When
//! the primary is rate limited before it produced any output, the step is
//! retried once on the secondary backend. Every other failure is reported as
//! a terminal [`RouterEvent::Error`] and the step ends.
//!
//! Events are delivered over a bounded channel; the router task stops as soon
//! as the receiver is dropped or the cancellation token fires.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message shown when a dependency of the tool side-channel is down
pub const INFRASTRUCTURE_UNAVAILABLE_MESSAGE: &str =
    "Our tools are temporarily unavailable. Please try again in a few minutes.";

const RATE_LIMITED_MESSAGE: &str =
    "The assistant is receiving too many requests right now. Please try again shortly.";

const PROVIDER_ERROR_MESSAGE: &str =
    "The assistant could not complete this response. Please try again.";

const CHANNEL_CAPACITY: usize = 64;

/// A conversation message in the form model backends consume
#[derive(Debug, Clone, PartialEq)]
pub enum ModelMessage {
    System(String),
    User(String),
    Assistant {
        text: String,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },
}

/// A tool as advertised to the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
}

/// A tool call emitted by the model
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    /// Derived from the turn seed; stable across retries of the same turn
    pub id: String,
    /// Id the provider minted, echoed back to it in the tool exchange
    pub provider_id: Option<String>,
    pub name: String,
    pub arguments: Value,
}

/// One generation step
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolSpec>,
    /// Seed for tool call ids the backend has to derive itself
    pub seed: Uuid,
    /// Index of this step within the turn
    pub step: usize,
}

/// Deterministic tool call id for backends that do not assign one
///
/// The same turn seed, step and call position always produce the same id, so
/// a retried turn re-uses the results of tools that already ran.
pub fn derive_tool_call_id(seed: Uuid, step: usize, index: usize, tool_name: &str) -> String {
    let name = format!("{}:{}:{}", step, index, tool_name);
    format!("call_{}", Uuid::new_v5(&seed, name.as_bytes()).simple())
}

/// Item produced by a backend stream
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Delta(String),
    ToolCall(ToolCallRequest),
    Finished { reason: Option<String> },
}

/// Classified backend failure
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("rate limited")]
    RateLimited { retry_after_secs: Option<u64> },

    /// A dependency of the tool side-channel is unreachable
    #[error("infrastructure unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("provider error: {0}")]
    Provider(String),
}

impl BackendError {
    fn outcome(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InfrastructureUnavailable(_) => "infrastructure",
            Self::Provider(_) => "failed",
        }
    }
}

pub type BackendStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send>>;

/// A model that can stream a generation step
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<BackendStream, BackendError>;
}

/// Error codes surfaced to clients in terminal error events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StreamErrorCode {
    RateLimited,
    InfrastructureUnavailable,
    ProviderError,
    Timeout,
    Internal,
}

/// Terminal failure of a step
#[derive(Debug, Clone, PartialEq)]
pub struct StreamFailure {
    pub code: StreamErrorCode,
    pub message: String,
}

impl From<&BackendError> for StreamFailure {
    fn from(error: &BackendError) -> Self {
        match error {
            BackendError::RateLimited { .. } => Self {
                code: StreamErrorCode::RateLimited,
                message: RATE_LIMITED_MESSAGE.to_string(),
            },
            BackendError::InfrastructureUnavailable(_) => Self {
                code: StreamErrorCode::InfrastructureUnavailable,
                message: INFRASTRUCTURE_UNAVAILABLE_MESSAGE.to_string(),
            },
            BackendError::Provider(_) => Self {
                code: StreamErrorCode::ProviderError,
                message: PROVIDER_ERROR_MESSAGE.to_string(),
            },
        }
    }
}

/// Event delivered to the consumer of a routed step
#[derive(Debug, Clone, PartialEq)]
pub enum RouterEvent {
    Delta(String),
    ToolCall(ToolCallRequest),
    Finished { reason: Option<String> },
    Error(StreamFailure),
}

enum Attempt {
    Completed,
    Failed { error: BackendError, emitted: bool },
    Stopped,
}

/// Routes generation steps to a primary backend with optional failover
#[derive(Clone)]
pub struct ModelRouter {
    primary: Arc<dyn ModelBackend>,
    secondary: Option<Arc<dyn ModelBackend>>,
}

impl ModelRouter {
    pub fn new(primary: Arc<dyn ModelBackend>, secondary: Option<Arc<dyn ModelBackend>>) -> Self {
        Self { primary, secondary }
    }

    pub fn has_secondary(&self) -> bool {
        self.secondary.is_some()
    }

    /// Run one generation step in a background task
    ///
    /// The receiver yields deltas and tool calls followed by exactly one
    /// `Finished` or `Error`, unless the step is cancelled, in which case the
    /// channel simply closes.
    pub fn route(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<RouterEvent> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let router = self.clone();
        tokio::spawn(async move {
            router.run(request, cancel, tx).await;
        });
        rx
    }

    async fn run(
        &self,
        request: GenerationRequest,
        cancel: CancellationToken,
        tx: mpsc::Sender<RouterEvent>,
    ) {
        let failure = match attempt(self.primary.as_ref(), &request, &cancel, &tx).await {
            Attempt::Completed | Attempt::Stopped => return,
            Attempt::Failed { error, emitted } => {
                match (&error, emitted, self.secondary.as_deref()) {
                    (BackendError::RateLimited { .. }, false, Some(secondary)) => {
                        info!(
                            primary = self.primary.name(),
                            secondary = secondary.name(),
                            "Primary backend rate limited, failing over"
                        );
                        match attempt(secondary, &request, &cancel, &tx).await {
                            Attempt::Completed | Attempt::Stopped => return,
                            Attempt::Failed { error, .. } => error,
                        }
                    }
                    _ => error,
                }
            }
        };

        let _ = tx
            .send(RouterEvent::Error(StreamFailure::from(&failure)))
            .await;
    }
}

/// Drive one backend until it finishes, fails or is stopped
async fn attempt(
    backend: &dyn ModelBackend,
    request: &GenerationRequest,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<RouterEvent>,
) -> Attempt {
    let name = backend.name();

    let started = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            info!(backend = name, outcome = "cancelled", "Model backend attempt finished");
            return Attempt::Stopped;
        }
        started = backend.generate(request, cancel.clone()) => started,
    };

    let mut stream = match started {
        Ok(stream) => stream,
        Err(error) => {
            warn!(backend = name, outcome = error.outcome(), error = %error, "Model backend attempt finished");
            return Attempt::Failed {
                error,
                emitted: false,
            };
        }
    };

    let mut emitted = false;
    loop {
        let item = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(backend = name, outcome = "cancelled", "Model backend attempt finished");
                return Attempt::Stopped;
            }
            item = stream.next() => item,
        };

        let event = match item {
            Some(Ok(BackendEvent::Delta(text))) => RouterEvent::Delta(text),
            Some(Ok(BackendEvent::ToolCall(call))) => RouterEvent::ToolCall(call),
            Some(Ok(BackendEvent::Finished { reason })) => {
                info!(backend = name, outcome = "ok", "Model backend attempt finished");
                let _ = tx.send(RouterEvent::Finished { reason }).await;
                return Attempt::Completed;
            }
            Some(Err(error)) => {
                warn!(backend = name, outcome = error.outcome(), emitted, error = %error, "Model backend attempt finished");
                return Attempt::Failed { error, emitted };
            }
            None => {
                debug!(backend = name, "Backend stream ended without a finish marker");
                info!(backend = name, outcome = "ok", "Model backend attempt finished");
                let _ = tx.send(RouterEvent::Finished { reason: None }).await;
                return Attempt::Completed;
            }
        };

        if tx.send(event).await.is_err() {
            debug!(backend = name, "Router receiver dropped, stopping attempt");
            return Attempt::Stopped;
        }
        emitted = true;
    }
}
