//! Ollama chat client for Encore
//!
//! Wraps the `/api/chat` endpoint in streaming mode. Responses arrive as
//! NDJSON and are surfaced as a stream of [`ChatStreamChunk`] values, each
//! carrying either a content delta or the tool calls the model requested.
//!
//! HTTP 429 responses are reported as [`OllamaError::RateLimited`] so that
//! callers can fail over to another backend instead of retrying blindly.
//!
//! # Example
//!
//! ```no_run
//! use encore_ollama_client::{ChatMessage, OllamaClient};
//! use encore_shared_config::OllamaConfig;
//! use futures_util::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = OllamaClient::new(&OllamaConfig::default())?;
//! let messages = vec![
//!     ChatMessage::system("You are a helpful assistant."),
//!     ChatMessage::user("Hello!"),
//! ];
//! let mut stream = client.chat_stream(messages, Vec::new(), None).await?;
//! while let Some(chunk) = stream.next().await {
//!     print!("{}", chunk?.message.content);
//! }
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
mod models;

pub use client::{ChatChunkStream, OllamaClient};
pub use error::{OllamaError, OllamaResult};
pub use models::{
    ChatMessage, ChatRequest, ChatRole, ChatStreamChunk, GenerateOptions, ListModelsResponse,
    ModelInfo, Tool, ToolCall, ToolCallFunction, ToolFunction,
};
