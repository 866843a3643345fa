//! Streaming Ollama HTTP client with connection pooling

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use encore_shared_config::OllamaConfig;
use futures_util::Stream;
use reqwest::{Client, Response, StatusCode};
use tracing::{debug, warn};

use crate::error::{OllamaError, OllamaResult};
use crate::models::{
    ChatMessage, ChatRequest, ChatStreamChunk, GenerateOptions, ListModelsResponse, Tool,
};

/// Maximum error body size to prevent memory exhaustion
const MAX_ERROR_BODY_SIZE: usize = 1000;

/// Stream of parsed chat chunks
pub type ChatChunkStream = Pin<Box<dyn Stream<Item = OllamaResult<ChatStreamChunk>> + Send>>;

/// Ollama API client
#[derive(Debug, Clone)]
pub struct OllamaClient {
    /// HTTP client with connection pool
    http_client: Client,
    /// Configuration
    config: OllamaConfig,
}

impl OllamaClient {
    /// Create a new Ollama client from configuration
    pub fn new(config: &OllamaConfig) -> OllamaResult<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(OllamaError::HttpError)?;

        Ok(Self::with_client(config, http_client))
    }

    /// Create a client with custom HTTP client (for testing)
    pub fn with_client(config: &OllamaConfig, http_client: Client) -> Self {
        Self {
            http_client,
            config: config.clone(),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &OllamaConfig {
        &self.config
    }

    /// Truncate error body to prevent memory exhaustion
    /// Safely handles UTF-8 boundaries to avoid panics on multi-byte characters
    fn truncate_error_body(body: String) -> String {
        if body.len() <= MAX_ERROR_BODY_SIZE {
            return body;
        }

        let truncate_at = body
            .char_indices()
            .map(|(i, _)| i)
            .take_while(|i| *i <= MAX_ERROR_BODY_SIZE)
            .last()
            .unwrap_or(0);

        format!("{}... (truncated)", &body[..truncate_at])
    }

    fn map_send_error(&self, e: reqwest::Error) -> OllamaError {
        if e.is_connect() {
            OllamaError::ConnectionRefused(self.config.url.clone())
        } else if e.is_timeout() {
            OllamaError::Timeout(self.config.timeout_secs)
        } else {
            OllamaError::HttpError(e)
        }
    }

    /// Turn a non-success response into a classified error
    async fn error_for_status(&self, response: Response) -> OllamaError {
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            return OllamaError::RateLimited { retry_after_secs };
        }

        let body = Self::truncate_error_body(response.text().await.unwrap_or_default());
        if body.contains("model") && body.contains("not found") {
            return OllamaError::ModelNotFound(self.config.model.clone());
        }

        OllamaError::ApiError {
            status: status.as_u16(),
            body,
        }
    }

    /// Check if Ollama is reachable
    pub async fn health_check(&self) -> OllamaResult<bool> {
        match self.http_client.get(self.config.tags_url()).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(e) => Err(self.map_send_error(e)),
        }
    }

    /// List available models
    pub async fn list_models(&self) -> OllamaResult<Vec<String>> {
        let response = self
            .http_client
            .get(self.config.tags_url())
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(self.error_for_status(response).await);
        }

        let list: ListModelsResponse = response.json().await?;
        Ok(list.models.into_iter().map(|m| m.name).collect())
    }

    /// Stream chat completion responses token by token
    ///
    /// Sends the conversation with streaming enabled and returns the parsed
    /// NDJSON chunks as they arrive. Tool calls requested by the model show
    /// up in `chunk.message.tool_calls`.
    ///
    /// # Arguments
    /// * `messages` - The conversation history
    /// * `tools` - Tools the model may call (empty for none)
    /// * `options` - Optional generation parameters
    ///
    /// # Errors
    /// Failures before the first byte are returned directly; HTTP 429 maps to
    /// [`OllamaError::RateLimited`].
    pub async fn chat_stream(
        &self,
        messages: Vec<ChatMessage>,
        tools: Vec<Tool>,
        options: Option<GenerateOptions>,
    ) -> OllamaResult<ChatChunkStream> {
        debug!(
            model = %self.config.model,
            message_count = messages.len(),
            tool_count = tools.len(),
            "Starting streaming chat request"
        );

        let request = ChatRequest {
            model: self.config.model.clone(),
            messages,
            tools,
            stream: true,
            options: options.or_else(|| {
                Some(GenerateOptions {
                    temperature: Some(self.config.temperature),
                    num_predict: Some(self.config.max_tokens),
                    ..Default::default()
                })
            }),
        };

        let response = self
            .http_client
            .post(self.config.chat_url())
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;

        if !response.status().is_success() {
            return Err(self.error_for_status(response).await);
        }

        Ok(Box::pin(NdjsonStream::new(response.bytes_stream())))
    }
}

/// Parses NDJSON (newline-delimited JSON) chat chunks out of a byte stream
struct NdjsonStream<S> {
    inner: S,
    buffer: String,
    finished: bool,
}

impl<S> NdjsonStream<S> {
    fn new(stream: S) -> Self {
        Self {
            inner: stream,
            buffer: String::new(),
            finished: false,
        }
    }

    /// Pop the next complete line out of the buffer
    fn take_line(&mut self) -> Option<String> {
        let newline_pos = self.buffer.find('\n')?;
        let line = self.buffer[..newline_pos].trim().to_string();
        self.buffer.drain(..=newline_pos);
        Some(line)
    }

    fn parse(line: &str) -> OllamaResult<ChatStreamChunk> {
        serde_json::from_str::<ChatStreamChunk>(line).map_err(OllamaError::from)
    }
}

impl<S, E> Stream for NdjsonStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
{
    type Item = OllamaResult<ChatStreamChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            while let Some(line) = self.take_line() {
                if !line.is_empty() {
                    return Poll::Ready(Some(Self::parse(&line)));
                }
            }

            if self.finished {
                let rest = std::mem::take(&mut self.buffer);
                let rest = rest.trim();
                if rest.is_empty() {
                    return Poll::Ready(None);
                }
                return Poll::Ready(Some(Self::parse(rest)));
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => self.buffer.push_str(text),
                    Err(e) => {
                        warn!(
                            error = %e,
                            byte_count = bytes.len(),
                            "Invalid UTF-8 in streaming response, using lossy conversion"
                        );
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        self.buffer.push_str(&text);
                    }
                },
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    self.buffer.clear();
                    return Poll::Ready(Some(Err(OllamaError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => self.finished = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
