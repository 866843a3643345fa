//! Ollama-backed model backend

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use encore_ollama_client::{
    ChatMessage, ChatStreamChunk, OllamaClient, OllamaError, OllamaResult, Tool, ToolCall,
    ToolCallFunction,
};
use encore_shared_config::OllamaConfig;

use super::router::{
    derive_tool_call_id, BackendError, BackendEvent, BackendStream, GenerationRequest,
    ModelBackend, ModelMessage, ToolCallRequest,
};

/// A [`ModelBackend`] talking to one Ollama deployment
pub struct OllamaBackend {
    name: String,
    client: OllamaClient,
}

impl OllamaBackend {
    pub fn new(config: &OllamaConfig) -> OllamaResult<Self> {
        Ok(Self {
            name: format!("{}:{}", config.name, config.model),
            client: OllamaClient::new(config)?,
        })
    }

    pub fn client(&self) -> &OllamaClient {
        &self.client
    }
}

fn classify(error: OllamaError) -> BackendError {
    match error {
        OllamaError::RateLimited { retry_after_secs } => {
            BackendError::RateLimited { retry_after_secs }
        }
        other => BackendError::Provider(other.to_string()),
    }
}

fn to_chat_messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(request.messages.len() + 1);
    if !request.system.is_empty() {
        messages.push(ChatMessage::system(request.system.clone()));
    }

    for message in &request.messages {
        messages.push(match message {
            ModelMessage::System(text) => ChatMessage::system(text.clone()),
            ModelMessage::User(text) => ChatMessage::user(text.clone()),
            ModelMessage::Assistant { text, tool_calls } if tool_calls.is_empty() => {
                ChatMessage::assistant(text.clone())
            }
            ModelMessage::Assistant { text, tool_calls } => ChatMessage::assistant_with_tools(
                text.clone(),
                tool_calls
                    .iter()
                    .map(|call| ToolCall {
                        id: Some(call.provider_id.clone().unwrap_or_else(|| call.id.clone())),
                        function: ToolCallFunction {
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    })
                    .collect(),
            ),
            ModelMessage::Tool {
                tool_name, content, ..
            } => ChatMessage::tool(tool_name.clone(), content.clone()),
        });
    }

    messages
}

/// Turn one NDJSON chunk into backend events
fn chunk_events(
    chunk: ChatStreamChunk,
    request_seed: uuid::Uuid,
    step: usize,
    next_index: &mut usize,
) -> Vec<Result<BackendEvent, BackendError>> {
    let mut events = Vec::new();

    if !chunk.message.content.is_empty() {
        events.push(Ok(BackendEvent::Delta(chunk.message.content)));
    }

    // Provider ids change between generations, so the ledger key is always
    // derived from the seed
    for call in chunk.message.tool_calls {
        let id = derive_tool_call_id(request_seed, step, *next_index, &call.function.name);
        *next_index += 1;
        events.push(Ok(BackendEvent::ToolCall(ToolCallRequest {
            id,
            provider_id: call.id.filter(|id| !id.is_empty()),
            name: call.function.name,
            arguments: call.function.arguments,
        })));
    }

    if chunk.done {
        events.push(Ok(BackendEvent::Finished {
            reason: chunk.done_reason,
        }));
    }

    events
}

#[async_trait]
impl ModelBackend for OllamaBackend {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, request, _cancel), fields(backend = %self.name, step = request.step))]
    async fn generate(
        &self,
        request: &GenerationRequest,
        _cancel: CancellationToken,
    ) -> Result<BackendStream, BackendError> {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                Tool::function(
                    tool.name.clone(),
                    tool.description.clone(),
                    tool.parameters.clone(),
                )
            })
            .collect();

        let chunks = self
            .client
            .chat_stream(to_chat_messages(request), tools, None)
            .await
            .map_err(classify)?;

        let seed = request.seed;
        let step = request.step;
        let mut next_index = 0usize;
        let events = chunks.flat_map(move |chunk| {
            let items = match chunk {
                Ok(chunk) => chunk_events(chunk, seed, step, &mut next_index),
                Err(e) => vec![Err(classify(e))],
            };
            stream::iter(items)
        });

        Ok(Box::pin(events))
    }
}
