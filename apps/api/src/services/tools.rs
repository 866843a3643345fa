//! Tool invocation bridge
//!
//! Tools come from [`ToolSource`]s and are bound into a [`ToolSet`] per turn.
//! The [`ToolBridge`] executes calls the model emits and keeps a ledger keyed
//! by account and tool call id, so a call id that shows up twice for the same
//! account (a retried turn, a re-sent chunk) runs its executor once and every
//! caller sees the same outcome.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::router::{ToolCallRequest, ToolSpec};
use super::schema;
use crate::models::ToolResultState;

/// How long finished calls stay in the ledger
pub const LEDGER_RETENTION: Duration = Duration::from_secs(600);

/// Who a tool call runs on behalf of
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub account_id: Uuid,
    pub room_id: Uuid,
    pub artist_id: Option<Uuid>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ToolError {
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("{0}")]
    Failed(String),

    /// The system backing the tool cannot be reached
    #[error("tool backend unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, context: &ToolContext, arguments: Value) -> Result<Value, ToolError>;
}

/// Side effect a successful call has on the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ToolEffect {
    #[default]
    None,
    /// The payload carries `artist.id` of a newly created artist
    CreatesArtist,
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object
    pub parameters: Value,
    pub effect: ToolEffect,
    pub executor: Arc<dyn ToolExecutor>,
}

impl ToolDefinition {
    pub fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

impl std::fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("effect", &self.effect)
            .finish_non_exhaustive()
    }
}

/// A provider of tool definitions
pub trait ToolSource: Send + Sync {
    fn name(&self) -> &str;

    fn tools(&self) -> Vec<ToolDefinition>;
}

/// Tools available to one turn, keyed by name
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, ToolDefinition>,
}

impl ToolSet {
    /// Merge the tools of every source
    ///
    /// On a name collision the source registered last wins.
    pub fn bind(sources: &[Arc<dyn ToolSource>]) -> Self {
        let mut set = Self::default();
        for source in sources {
            for tool in source.tools() {
                if let Some(previous) = set.register(tool) {
                    debug!(
                        tool = %previous.name,
                        source = source.name(),
                        "Tool definition replaced by later source"
                    );
                }
            }
        }
        set
    }

    /// Add a tool, returning the definition it replaced
    pub fn register(&mut self, tool: ToolDefinition) -> Option<ToolDefinition> {
        self.tools.insert(tool.name.clone(), tool)
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.values().map(ToolDefinition::spec).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// Result of a tool call
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Error(String),
    /// The tool side-channel is down; the turn cannot continue
    Unavailable(String),
}

impl ToolOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Text handed back to the model
    pub fn model_content(&self) -> String {
        match self {
            Self::Success(payload) => payload.to_string(),
            Self::Error(reason) | Self::Unavailable(reason) => {
                serde_json::json!({ "error": reason }).to_string()
            }
        }
    }

    pub fn to_state(&self) -> ToolResultState {
        match self {
            Self::Success(payload) => ToolResultState::Success {
                payload: payload.clone(),
            },
            Self::Error(reason) | Self::Unavailable(reason) => ToolResultState::Error {
                reason: reason.clone(),
            },
        }
    }
}

impl From<Result<Value, ToolError>> for ToolOutcome {
    fn from(result: Result<Value, ToolError>) -> Self {
        match result {
            Ok(payload) => Self::Success(payload),
            Err(ToolError::Unavailable(reason)) => Self::Unavailable(reason),
            Err(e) => Self::Error(e.to_string()),
        }
    }
}

struct LedgerEntry {
    outcome: watch::Receiver<Option<ToolOutcome>>,
    recorded_at: Instant,
}

/// Ledger key; outcomes are never shared between accounts
type LedgerKey = (Uuid, String);

/// Executes tool calls at most once per account and call id
#[derive(Clone)]
pub struct ToolBridge {
    ledger: Arc<DashMap<LedgerKey, LedgerEntry>>,
    retention: Duration,
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolBridge {
    pub fn new() -> Self {
        Self::with_retention(LEDGER_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            ledger: Arc::new(DashMap::new()),
            retention,
        }
    }

    /// Number of calls currently tracked
    pub fn tracked(&self) -> usize {
        self.ledger.len()
    }

    fn purge_expired(&self) {
        let retention = self.retention;
        self.ledger
            .retain(|_, entry| entry.recorded_at.elapsed() < retention);
    }

    /// Execute a call, or wait for the outcome of an earlier call with the
    /// same id made on behalf of the same account
    ///
    /// The executor runs in its own task: abandoning the returned future does
    /// not abort the call, and its outcome is still recorded.
    pub async fn invoke(
        &self,
        tools: &ToolSet,
        call: &ToolCallRequest,
        context: &ToolContext,
    ) -> ToolOutcome {
        self.purge_expired();

        let key = (context.account_id, call.id.clone());
        let mut outcome = match self.ledger.entry(key) {
            Entry::Occupied(entry) => {
                debug!(tool_call_id = %call.id, tool = %call.name, "Tool call already seen, reusing outcome");
                entry.get().outcome.clone()
            }
            Entry::Vacant(entry) => {
                let (tx, rx) = watch::channel(None);
                entry.insert(LedgerEntry {
                    outcome: rx.clone(),
                    recorded_at: Instant::now(),
                });
                self.start(tools, call, context, tx);
                rx
            }
        };

        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map(|value| value.clone());
        match finished {
            Ok(value) => {
                value.unwrap_or_else(|| ToolOutcome::Error("tool produced no result".to_string()))
            }
            Err(_) => {
                warn!(tool_call_id = %call.id, tool = %call.name, "Tool execution aborted");
                ToolOutcome::Error("tool execution aborted".to_string())
            }
        }
    }

    fn start(
        &self,
        tools: &ToolSet,
        call: &ToolCallRequest,
        context: &ToolContext,
        tx: watch::Sender<Option<ToolOutcome>>,
    ) {
        let Some(tool) = tools.get(&call.name) else {
            warn!(tool = %call.name, "Model requested an unknown tool");
            let _ = tx.send(Some(ToolOutcome::Error(format!(
                "unknown tool: {}",
                call.name
            ))));
            return;
        };

        if let Err(violation) = schema::validate(&tool.parameters, &call.arguments) {
            info!(tool = %call.name, violation = %violation, "Rejected tool arguments");
            let _ = tx.send(Some(ToolOutcome::Error(
                ToolError::InvalidArguments(violation).to_string(),
            )));
            return;
        }

        let executor = Arc::clone(&tool.executor);
        let context = context.clone();
        let arguments = call.arguments.clone();
        let tool_name = call.name.clone();
        let tool_call_id = call.id.clone();
        tokio::spawn(async move {
            let outcome = ToolOutcome::from(executor.execute(&context, arguments).await);
            info!(
                tool = %tool_name,
                tool_call_id = %tool_call_id,
                success = outcome.is_success(),
                "Tool call finished"
            );
            let _ = tx.send(Some(outcome));
        });
    }
}
