//! Chat turn orchestration
//!
//! [`ChatOrchestrator::handle_turn`] validates a turn, resolves the room's
//! artist binding and assembles the system prompt before anything is
//! streamed; failures at that stage are returned as errors. Once the
//! [`TurnStream`] is handed out, the turn runs in a background task:
//!
//! 1. model steps are routed through the [`ModelRouter`], tool calls are run
//!    through the [`ToolBridge`] and fed back, up to the step limit
//! 2. every delta, tool call and tool result is forwarded as it is produced
//! 3. exactly one terminal `finish` or `error` event closes the stream,
//!    unless the client went away
//! 4. the conversation is reconciled, and a room created by a
//!    `create_artist` call is forked
//!
//! Dropping the [`TurnStream`] cancels the turn. Content generated up to that
//! point is still persisted.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::artist_tools::created_artist_id;
use super::auth::Identity;
use super::binder::{Binding, BindingError, RoomArtistBinder, TurnGuard};
use super::knowledge::{knowledge_context, KnowledgeSource};
use super::notifier::{NotificationEvent, NotificationService};
use super::reconciler::{ConversationReconciler, ReconcileOutcome, RoomDraft};
use super::router::{
    BackendError, GenerationRequest, ModelMessage, ModelRouter, RouterEvent, StreamErrorCode,
    StreamFailure, ToolCallRequest,
};
use super::tools::{ToolBridge, ToolContext, ToolEffect, ToolOutcome, ToolSet, ToolSource};
use crate::error::ApiError;
use crate::models::room::topic_from_message;
use crate::models::{
    Message, MessageContent, MessagePart, MessageRole, ToolInvocation, ToolResultState,
};

/// Longest accepted message, in characters
pub const MAX_MESSAGE_CHARS: usize = 10_000;

const EVENT_BUFFER: usize = 64;

const TIMEOUT_MESSAGE: &str = "The response took too long. Please try again.";

const BASE_PROMPT: &str = "You are Encore, an assistant for music-industry account managers. \
You help plan releases, tours and marketing for the artists an account manages. \
Be concise and concrete. Use the available tools to look up or create artists \
instead of guessing, and never invent identifiers.";

/// Body of a chat turn request
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    /// Full client-visible history, ending with the new user message
    pub messages: Vec<Message>,
    /// Client-proposed room id
    pub room_id: Uuid,
    #[serde(default)]
    pub artist_id: Option<Uuid>,
    pub account_id: Uuid,
    #[serde(default)]
    pub email: Option<String>,
}

/// Event streamed to the client during a turn
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    #[serde(rename_all = "camelCase")]
    Binding {
        room_id: Uuid,
        artist_id: Option<Uuid>,
        binding_changed: bool,
    },
    TextDelta {
        delta: String,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        arguments: Value,
    },
    #[serde(rename_all = "camelCase")]
    ToolResult {
        tool_call_id: String,
        result: ToolResultState,
    },
    /// The conversation continues in a new room once the turn completes
    #[serde(rename_all = "camelCase")]
    RoomForked { room_id: Uuid, artist_id: Uuid },
    #[serde(rename_all = "camelCase")]
    Finish {
        message_id: Uuid,
        finish_reason: Option<String>,
    },
    Error {
        code: StreamErrorCode,
        message: String,
    },
}

impl TurnEvent {
    /// SSE event name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Binding { .. } => "binding",
            Self::TextDelta { .. } => "text-delta",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::RoomForked { .. } => "room-forked",
            Self::Finish { .. } => "finish",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}

/// Failures before the stream starts
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("invalid chat request: {0}")]
    InvalidRequest(String),

    #[error("account does not match the authenticated caller")]
    AccountMismatch,

    #[error("room {0} belongs to another account")]
    RoomForbidden(Uuid),

    #[error(transparent)]
    Binding(#[from] BindingError),
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::InvalidRequest(reason) => ApiError::ValidationError(reason),
            ChatError::AccountMismatch => ApiError::Forbidden(err.to_string()),
            ChatError::RoomForbidden(room_id) => ApiError::not_found("room", room_id.to_string()),
            ChatError::Binding(BindingError::Storage(e)) => ApiError::from(e),
            ChatError::Binding(other) => ApiError::Internal(other.to_string()),
        }
    }
}

/// Failures after the stream started
#[derive(Debug)]
enum TurnError {
    Model(StreamFailure),
    ToolsUnavailable(String),
    TimedOut,
    Cancelled,
}

impl TurnError {
    fn failure(&self) -> Option<StreamFailure> {
        match self {
            Self::Model(failure) => Some(failure.clone()),
            Self::ToolsUnavailable(_) => Some(StreamFailure::from(
                &BackendError::InfrastructureUnavailable(String::new()),
            )),
            Self::TimedOut => Some(StreamFailure {
                code: StreamErrorCode::Timeout,
                message: TIMEOUT_MESSAGE.to_string(),
            }),
            Self::Cancelled => None,
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Model(failure) => format!("{:?}: {}", failure.code, failure.message),
            Self::ToolsUnavailable(reason) => format!("tool backend unavailable: {}", reason),
            Self::TimedOut => "turn timed out".to_string(),
            Self::Cancelled => "cancelled".to_string(),
        }
    }
}

/// Limits applied to every turn
#[derive(Debug, Clone, Copy)]
pub struct TurnSettings {
    /// Model calls allowed per turn
    pub max_tool_steps: usize,
    pub turn_timeout: Duration,
}

impl Default for TurnSettings {
    fn default() -> Self {
        Self {
            max_tool_steps: 5,
            turn_timeout: Duration::from_secs(120),
        }
    }
}

/// Events of a running turn
///
/// Dropping the stream cancels the turn.
pub struct TurnStream {
    room_id: Uuid,
    events: mpsc::Receiver<TurnEvent>,
    _cancel_on_drop: DropGuard,
}

impl TurnStream {
    pub fn room_id(&self) -> Uuid {
        self.room_id
    }

    pub async fn next_event(&mut self) -> Option<TurnEvent> {
        self.events.recv().await
    }
}

impl std::fmt::Debug for TurnStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnStream")
            .field("room_id", &self.room_id)
            .finish_non_exhaustive()
    }
}

impl Stream for TurnStream {
    type Item = TurnEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// A validated turn ready to run
struct Turn {
    identity: Identity,
    request: TurnRequest,
    binding: Binding,
    system: String,
    tools: ToolSet,
    /// Seed for derived tool call ids; the id of the new user message
    seed: Uuid,
}

impl Turn {
    fn tool_context(&self) -> ToolContext {
        ToolContext {
            account_id: self.identity.account_id,
            room_id: self.request.room_id,
            artist_id: self.binding.artist_id,
        }
    }

    fn last_user_text(&self) -> Option<String> {
        self.request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.text())
    }

    fn first_user_text(&self) -> String {
        self.request
            .messages
            .iter()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.content.text())
            .unwrap_or_default()
    }
}

/// The assistant message being produced by a turn
struct AssistantDraft {
    message_id: Uuid,
    parts: Vec<MessagePart>,
    /// New room id and artist announced by a `create_artist` call
    fork: Option<(Uuid, Uuid)>,
}

impl AssistantDraft {
    fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            parts: Vec::new(),
            fork: None,
        }
    }

    fn push_text(&mut self, delta: &str) {
        if let Some(MessagePart::Text { text }) = self.parts.last_mut() {
            text.push_str(delta);
        } else {
            self.parts.push(MessagePart::Text {
                text: delta.to_string(),
            });
        }
    }

    fn push_call(&mut self, call: &ToolCallRequest) {
        self.parts.push(MessagePart::ToolInvocation {
            tool_invocation: ToolInvocation {
                tool_call_id: call.id.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
                result: ToolResultState::Pending,
            },
        });
    }

    fn resolve_call(&mut self, tool_call_id: &str, result: ToolResultState) {
        for part in &mut self.parts {
            if let MessagePart::ToolInvocation { tool_invocation } = part {
                if tool_invocation.tool_call_id == tool_call_id {
                    tool_invocation.result = result;
                    return;
                }
            }
        }
    }

    fn into_message(self) -> Option<Message> {
        let content = match self.parts.as_slice() {
            [] => return None,
            [MessagePart::Text { text }] => MessageContent::Text(text.clone()),
            _ => MessageContent::Parts(self.parts),
        };
        Some(Message::with_id(self.message_id, MessageRole::Assistant, content))
    }
}

/// Convert persisted messages into model history
///
/// Tool invocations still pending (an interrupted turn) are left out.
pub fn to_model_messages(messages: &[Message]) -> Vec<ModelMessage> {
    let mut history = Vec::with_capacity(messages.len());
    for message in messages {
        let text = message.content.text();
        match message.role {
            MessageRole::User => history.push(ModelMessage::User(text)),
            MessageRole::System => history.push(ModelMessage::System(text)),
            MessageRole::Tool => history.push(ModelMessage::Tool {
                tool_call_id: String::new(),
                tool_name: "tool".to_string(),
                content: text,
            }),
            MessageRole::Assistant => {
                let finished: Vec<&ToolInvocation> = message
                    .content
                    .tool_invocations()
                    .filter(|inv| inv.result != ToolResultState::Pending)
                    .collect();

                history.push(ModelMessage::Assistant {
                    text,
                    tool_calls: finished
                        .iter()
                        .map(|inv| ToolCallRequest {
                            id: inv.tool_call_id.clone(),
                            provider_id: None,
                            name: inv.tool_name.clone(),
                            arguments: inv.arguments.clone(),
                        })
                        .collect(),
                });

                for inv in finished {
                    let content = match &inv.result {
                        ToolResultState::Success { payload } => payload.to_string(),
                        ToolResultState::Error { reason } => json!({ "error": reason }).to_string(),
                        ToolResultState::Pending => continue,
                    };
                    history.push(ModelMessage::Tool {
                        tool_call_id: inv.tool_call_id.clone(),
                        tool_name: inv.tool_name.clone(),
                        content,
                    });
                }
            }
        }
    }
    history
}

/// Static base prompt plus turn context and artist knowledge
pub fn build_system_prompt(
    identity: &Identity,
    room_id: Uuid,
    artist_id: Option<Uuid>,
    knowledge: &str,
) -> String {
    let mut prompt = String::from(BASE_PROMPT);

    prompt.push_str(&format!(
        "\n\nAccount: {} ({})\nRoom: {}",
        identity.email, identity.account_id, room_id
    ));

    match artist_id {
        Some(artist_id) => prompt.push_str(&format!(
            "\nActive artist: {}. Answer in the context of this artist.",
            artist_id
        )),
        None => prompt.push_str(
            "\nNo artist is selected. Ask which artist the request is about when it matters.",
        ),
    }

    if !knowledge.is_empty() {
        prompt.push_str("\n\nArtist knowledge base:\n");
        prompt.push_str(knowledge);
    }

    prompt
}

async fn forward(tx: &mpsc::Sender<TurnEvent>, event: TurnEvent) -> Result<(), TurnError> {
    tx.send(event).await.map_err(|_| TurnError::Cancelled)
}

/// Composition root of a chat turn
#[derive(Clone)]
pub struct ChatOrchestrator {
    router: ModelRouter,
    tool_sources: Vec<Arc<dyn ToolSource>>,
    bridge: ToolBridge,
    reconciler: Arc<ConversationReconciler>,
    binder: Arc<RoomArtistBinder>,
    knowledge: Arc<dyn KnowledgeSource>,
    notifier: NotificationService,
    settings: TurnSettings,
}

impl ChatOrchestrator {
    pub fn new(
        router: ModelRouter,
        reconciler: Arc<ConversationReconciler>,
        binder: Arc<RoomArtistBinder>,
        knowledge: Arc<dyn KnowledgeSource>,
        notifier: NotificationService,
        settings: TurnSettings,
    ) -> Self {
        Self {
            router,
            tool_sources: Vec::new(),
            bridge: ToolBridge::new(),
            reconciler,
            binder,
            knowledge,
            notifier,
            settings,
        }
    }

    /// Register a tool source; later sources win name collisions
    pub fn with_tool_source(mut self, source: Arc<dyn ToolSource>) -> Self {
        self.tool_sources.push(source);
        self
    }

    pub fn with_bridge(mut self, bridge: ToolBridge) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn binder(&self) -> &RoomArtistBinder {
        &self.binder
    }

    pub fn router(&self) -> &ModelRouter {
        &self.router
    }

    /// Validate a turn and start streaming it
    #[instrument(skip(self, identity, request), fields(room_id = %request.room_id, account_id = %identity.account_id))]
    pub async fn handle_turn(
        &self,
        identity: &Identity,
        request: TurnRequest,
    ) -> Result<TurnStream, ChatError> {
        let seed = validate(identity, &request)?;

        // Rebinds are refused from here on, so the resolved artist holds for
        // the whole turn
        let in_flight = self.binder.begin_turn(request.room_id);

        let binding = match self.resolve(identity, &request).await {
            Ok(binding) => binding,
            Err(e) => {
                if let ChatError::Binding(_) = e {
                    self.notifier.notify(NotificationEvent::TurnFailed {
                        email: identity.email.clone(),
                        room_id: request.room_id,
                        error: e.to_string(),
                        last_message: request.messages.last().map(|m| m.content.text()),
                    });
                }
                return Err(e);
            }
        };

        if binding.binding_changed {
            info!(
                selected = ?request.artist_id,
                bound = ?binding.artist_id,
                "Selected artist differs from room binding, keeping room binding"
            );
        }

        let knowledge = knowledge_context(self.knowledge.as_ref(), binding.artist_id).await;
        let system = build_system_prompt(identity, request.room_id, binding.artist_id, &knowledge);

        let room_id = request.room_id;
        let turn = Turn {
            identity: identity.clone(),
            request,
            binding,
            system,
            tools: ToolSet::bind(&self.tool_sources),
            seed,
        };

        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let cancel = CancellationToken::new();

        let orchestrator = self.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move {
            orchestrator.run_turn(turn, tx, task_cancel, in_flight).await;
        });

        Ok(TurnStream {
            room_id,
            events: rx,
            _cancel_on_drop: cancel.drop_guard(),
        })
    }

    async fn resolve(&self, identity: &Identity, request: &TurnRequest) -> Result<Binding, ChatError> {
        let binding = self
            .binder
            .resolve_binding(request.room_id, request.artist_id)
            .await?;

        match binding.owner_id {
            Some(owner) if owner != identity.account_id => {
                Err(ChatError::RoomForbidden(request.room_id))
            }
            _ => Ok(binding),
        }
    }

    async fn run_turn(
        self,
        turn: Turn,
        tx: mpsc::Sender<TurnEvent>,
        cancel: CancellationToken,
        _in_flight: TurnGuard,
    ) {
        let mut draft = AssistantDraft::new();

        let binding_event = TurnEvent::Binding {
            room_id: turn.request.room_id,
            artist_id: turn.binding.artist_id,
            binding_changed: turn.binding.binding_changed,
        };

        let outcome = match forward(&tx, binding_event).await {
            Err(e) => Err(e),
            Ok(()) => match tokio::time::timeout(
                self.settings.turn_timeout,
                self.drive(&turn, &mut draft, &tx, &cancel),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TurnError::TimedOut),
            },
        };

        match outcome {
            Ok(finish_reason) => {
                let _ = tx
                    .send(TurnEvent::Finish {
                        message_id: draft.message_id,
                        finish_reason,
                    })
                    .await;
            }
            Err(TurnError::Cancelled) => {
                info!(room_id = %turn.request.room_id, "Turn cancelled by client");
            }
            Err(e) => {
                if matches!(e, TurnError::TimedOut) {
                    cancel.cancel();
                }
                warn!(room_id = %turn.request.room_id, error = %e.describe(), "Turn failed while streaming");
                self.notifier.notify(NotificationEvent::TurnFailed {
                    email: turn.identity.email.clone(),
                    room_id: turn.request.room_id,
                    error: e.describe(),
                    last_message: turn.last_user_text(),
                });
                if let Some(failure) = e.failure() {
                    let _ = tx
                        .send(TurnEvent::Error {
                            code: failure.code,
                            message: failure.message,
                        })
                        .await;
                }
            }
        }

        drop(tx);
        self.persist(&turn, draft).await;
    }

    /// Run model steps until the model stops calling tools
    async fn drive(
        &self,
        turn: &Turn,
        draft: &mut AssistantDraft,
        tx: &mpsc::Sender<TurnEvent>,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, TurnError> {
        let mut history = to_model_messages(&turn.request.messages);
        let specs = turn.tools.specs();
        let context = turn.tool_context();

        for step in 0..self.settings.max_tool_steps {
            let request = GenerationRequest {
                system: turn.system.clone(),
                messages: history.clone(),
                tools: specs.clone(),
                seed: turn.seed,
                step,
            };
            let mut events = self.router.route(request, cancel.child_token());

            let mut step_text = String::new();
            let mut calls = Vec::new();
            let mut finish_reason = None;

            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                    event = events.recv() => event,
                };

                match event {
                    None => break,
                    Some(RouterEvent::Delta(delta)) => {
                        draft.push_text(&delta);
                        step_text.push_str(&delta);
                        forward(tx, TurnEvent::TextDelta { delta }).await?;
                    }
                    Some(RouterEvent::ToolCall(call)) => {
                        draft.push_call(&call);
                        forward(
                            tx,
                            TurnEvent::ToolCall {
                                tool_call_id: call.id.clone(),
                                tool_name: call.name.clone(),
                                arguments: call.arguments.clone(),
                            },
                        )
                        .await?;
                        calls.push(call);
                    }
                    Some(RouterEvent::Finished { reason }) => finish_reason = reason,
                    Some(RouterEvent::Error(failure)) => return Err(TurnError::Model(failure)),
                }
            }

            if calls.is_empty() {
                return Ok(finish_reason);
            }

            history.push(ModelMessage::Assistant {
                text: step_text,
                tool_calls: calls.clone(),
            });

            for call in calls {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(TurnError::Cancelled),
                    outcome = self.bridge.invoke(&turn.tools, &call, &context) => outcome,
                };

                let state = outcome.to_state();
                draft.resolve_call(&call.id, state.clone());
                forward(
                    tx,
                    TurnEvent::ToolResult {
                        tool_call_id: call.id.clone(),
                        result: state,
                    },
                )
                .await?;

                if let ToolOutcome::Unavailable(reason) = outcome {
                    return Err(TurnError::ToolsUnavailable(reason));
                }

                if let Some(fork) = self.fork_target(turn, &call, &outcome) {
                    draft.fork = Some(fork);
                    forward(
                        tx,
                        TurnEvent::RoomForked {
                            room_id: fork.0,
                            artist_id: fork.1,
                        },
                    )
                    .await?;
                }

                history.push(ModelMessage::Tool {
                    tool_call_id: call.id.clone(),
                    tool_name: call.name.clone(),
                    content: outcome.model_content(),
                });
            }
        }

        debug!(max_steps = self.settings.max_tool_steps, "Tool step limit reached");
        Ok(Some("max-steps".to_string()))
    }

    /// New room id and artist when a call created an artist
    fn fork_target(
        &self,
        turn: &Turn,
        call: &ToolCallRequest,
        outcome: &ToolOutcome,
    ) -> Option<(Uuid, Uuid)> {
        let tool = turn.tools.get(&call.name)?;
        match (tool.effect, outcome) {
            (ToolEffect::CreatesArtist, ToolOutcome::Success(payload)) => {
                created_artist_id(payload).map(|artist_id| (Uuid::new_v4(), artist_id))
            }
            _ => None,
        }
    }

    /// Reconcile the turn, then fork if an artist was created
    async fn persist(&self, turn: &Turn, draft: AssistantDraft) {
        let room_id = turn.request.room_id;
        let fork = draft.fork;
        let generated: Vec<Message> = draft.into_message().into_iter().collect();

        if generated.is_empty() && !turn.binding.room_exists {
            debug!(room_id = %room_id, "Nothing generated for a new room, not persisting");
            return;
        }

        let draft = RoomDraft {
            room_id,
            account_id: turn.identity.account_id,
            artist_id: turn.binding.artist_id,
            topic: topic_from_message(&turn.first_user_text()),
        };

        match self
            .reconciler
            .reconcile(&draft, &turn.request.messages, &generated)
            .await
        {
            Ok(ReconcileOutcome::Created(room)) => {
                self.notifier.notify(NotificationEvent::NewConversation {
                    email: turn.identity.email.clone(),
                    room_id,
                    topic: room.topic,
                    first_message: turn.first_user_text(),
                });
            }
            Ok(ReconcileOutcome::Replaced { .. }) => {}
            Err(e) => {
                error!(room_id = %room_id, error = %e, "Failed to persist conversation");
                self.notifier.notify(NotificationEvent::PersistenceFailed {
                    room_id,
                    error: e.to_string(),
                });
                return;
            }
        }

        if let Some((new_room_id, artist_id)) = fork {
            if let Err(e) = self.binder.fork(room_id, artist_id, new_room_id).await {
                error!(room_id = %room_id, new_room_id = %new_room_id, error = %e, "Failed to fork room");
                self.notifier.notify(NotificationEvent::PersistenceFailed {
                    room_id: new_room_id,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Check a request before anything runs; returns the turn seed
fn validate(identity: &Identity, request: &TurnRequest) -> Result<Uuid, ChatError> {
    if request.account_id != identity.account_id {
        return Err(ChatError::AccountMismatch);
    }

    let last = request
        .messages
        .last()
        .ok_or_else(|| ChatError::InvalidRequest("messages must not be empty".to_string()))?;

    if last.role != MessageRole::User {
        return Err(ChatError::InvalidRequest(
            "the last message must be a user message".to_string(),
        ));
    }

    if last.content.text().trim().is_empty() {
        return Err(ChatError::InvalidRequest(
            "the user message must not be empty".to_string(),
        ));
    }

    if let Some(long) = request
        .messages
        .iter()
        .find(|m| m.content.text().chars().count() > MAX_MESSAGE_CHARS)
    {
        return Err(ChatError::InvalidRequest(format!(
            "message {} exceeds {} characters",
            long.id, MAX_MESSAGE_CHARS
        )));
    }

    Ok(last.id)
}
