//! Scripted collaborators for chat pipeline tests
//!
//! - [`ScriptedBackend`]: a model backend that plays back one script per call
//! - [`CapturingNotifier`]: records notifications instead of sending them
//! - [`CountingTools`]: a tool source whose only tool counts its executions
//! - [`GatedKnowledge`]: a knowledge source that holds lookups until opened

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use encore_api::models::KnowledgeEntry;
use encore_api::repositories::StorageResult;

use encore_api::services::notifier::NotifyError;
use encore_api::services::router::{
    derive_tool_call_id, BackendEvent, BackendStream, GenerationRequest, ToolCallRequest,
};
use encore_api::services::tools::{ToolContext, ToolError, ToolExecutor};
use encore_api::services::{
    BackendError, KnowledgeSource, ModelBackend, NotificationEvent, Notifier, ToolDefinition,
    ToolSource,
};

/// What a backend does on one call
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these events, then finish with `stop`
    Reply(Vec<BackendEvent>),
    /// Fail before producing anything
    Fail(BackendError),
    /// Stream these events, then fail
    FailAfter(Vec<BackendEvent>, BackendError),
    /// Stream these events, then never finish
    Stall(Vec<BackendEvent>),
    /// Call a tool; the id is derived like the Ollama adapter does
    CallTool { name: String, arguments: Value },
}

/// A text reply split into deltas
pub fn text(deltas: &[&str]) -> Script {
    Script::Reply(
        deltas
            .iter()
            .map(|d| BackendEvent::Delta(d.to_string()))
            .collect(),
    )
}

pub fn call_tool(name: &str, arguments: Value) -> Script {
    Script::CallTool {
        name: name.to_string(),
        arguments,
    }
}

pub fn rate_limited() -> Script {
    Script::Fail(BackendError::RateLimited {
        retry_after_secs: Some(1),
    })
}

fn finished(reason: &str) -> BackendEvent {
    BackendEvent::Finished {
        reason: Some(reason.to_string()),
    }
}

/// Model backend replaying scripts in order
///
/// Once the scripts run out, every further call repeats the last one.
pub struct ScriptedBackend {
    name: String,
    scripts: Mutex<VecDeque<Script>>,
    last: Mutex<Option<Script>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl ScriptedBackend {
    pub fn new(name: &str, scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            scripts: Mutex::new(scripts.into()),
            last: Mutex::new(None),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next_script(&self) -> Script {
        let mut last = self.last.lock().unwrap();
        match self.scripts.lock().unwrap().pop_front() {
            Some(script) => {
                *last = Some(script.clone());
                script
            }
            None => last
                .clone()
                .unwrap_or_else(|| Script::Fail(BackendError::Provider("no script".to_string()))),
        }
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: &GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<BackendStream, BackendError> {
        self.requests.lock().unwrap().push(request.clone());

        let events: Vec<Result<BackendEvent, BackendError>> = match self.next_script() {
            Script::Fail(error) => return Err(error),
            Script::Reply(events) => events
                .into_iter()
                .chain([finished("stop")])
                .map(Ok)
                .collect(),
            Script::FailAfter(events, error) => events
                .into_iter()
                .map(Ok)
                .chain([Err(error)])
                .collect(),
            Script::Stall(events) => {
                let head = stream::iter(events.into_iter().map(Ok));
                return Ok(Box::pin(head.chain(stream::pending())));
            }
            Script::CallTool { name, arguments } => vec![
                Ok(BackendEvent::ToolCall(ToolCallRequest {
                    id: derive_tool_call_id(request.seed, request.step, 0, &name),
                    // Fresh on every generation, like newer Ollama servers
                    provider_id: Some(format!("call_{}", Uuid::new_v4().simple())),
                    name,
                    arguments,
                })),
                Ok(finished("tool_calls")),
            ],
        };

        Ok(Box::pin(stream::iter(events)))
    }
}

/// Notifier that keeps every event it receives
#[derive(Default)]
pub struct CapturingNotifier {
    events: Mutex<Vec<NotificationEvent>>,
}

impl CapturingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<NotificationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(NotificationEvent::kind).collect()
    }

    /// Wait until an event of `kind` arrives
    pub async fn wait_for(&self, kind: &str) -> Option<NotificationEvent> {
        for _ in 0..100 {
            if let Some(event) = self.events().into_iter().find(|e| e.kind() == kind) {
                return Some(event);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    fn name(&self) -> &str {
        "capture"
    }

    async fn deliver(&self, event: &NotificationEvent) -> Result<(), NotifyError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

pub const COUNT_TOOL: &str = "record_play";

struct CountingExecutor {
    executions: Arc<AtomicUsize>,
    delay: Duration,
}

#[async_trait]
impl ToolExecutor for CountingExecutor {
    async fn execute(&self, _context: &ToolContext, arguments: Value) -> Result<Value, ToolError> {
        tokio::time::sleep(self.delay).await;
        let total = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(json!({ "recorded": arguments["track"], "total": total }))
    }
}

/// Tool source with a slow side-effecting tool
pub struct CountingTools {
    pub executions: Arc<AtomicUsize>,
    delay: Duration,
}

impl CountingTools {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            executions: Arc::new(AtomicUsize::new(0)),
            delay,
        })
    }

    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

impl ToolSource for CountingTools {
    fn name(&self) -> &str {
        "counting"
    }

    fn tools(&self) -> Vec<ToolDefinition> {
        vec![ToolDefinition {
            name: COUNT_TOOL.to_string(),
            description: "Record a play of a track".to_string(),
            parameters: json!({
                "type": "object",
                "properties": {"track": {"type": "string"}},
                "required": ["track"]
            }),
            effect: Default::default(),
            executor: Arc::new(CountingExecutor {
                executions: Arc::clone(&self.executions),
                delay: self.delay,
            }),
        }]
    }
}

/// Knowledge source that parks every lookup until [`GatedKnowledge::open`]
#[derive(Default)]
pub struct GatedKnowledge {
    entered: Notify,
    gate: Notify,
}

impl GatedKnowledge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Resolves once a lookup is parked
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    pub fn open(&self) {
        self.gate.notify_one();
    }
}

#[async_trait]
impl KnowledgeSource for GatedKnowledge {
    async fn entries(&self, _artist_id: Uuid) -> StorageResult<Vec<KnowledgeEntry>> {
        self.entered.notify_one();
        self.gate.notified().await;
        Ok(Vec::new())
    }
}
