//! Mock Ollama server for testing streaming chat
//!
//! Provides a [`MockOllamaServer`] that answers `/api/chat` with NDJSON
//! bodies shaped like a real Ollama stream.

use serde_json::{json, Value};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Build an NDJSON streaming body that emits one chunk per token and a
/// final `done` chunk
pub fn ndjson_body(tokens: &[&str]) -> String {
    let mut body = String::new();
    for token in tokens {
        body.push_str(
            &json!({
                "message": {"role": "assistant", "content": token},
                "done": false
            })
            .to_string(),
        );
        body.push('\n');
    }
    body.push_str(
        &json!({
            "message": {"role": "assistant", "content": ""},
            "done": true,
            "done_reason": "stop"
        })
        .to_string(),
    );
    body.push('\n');
    body
}

/// Mock Ollama server for testing streaming chat
///
/// Wraps a [`wiremock::MockServer`] with convenience methods for the
/// responses the chat pipeline cares about.
pub struct MockOllamaServer {
    server: MockServer,
}

impl MockOllamaServer {
    /// Start a new mock Ollama server
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    /// Get the server URL
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Get reference to the underlying mock server for custom mock setups
    pub fn inner(&self) -> &MockServer {
        &self.server
    }

    /// Stream `tokens` on every chat request
    pub async fn mock_chat_stream(&self, tokens: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(ndjson_body(tokens)))
            .with_priority(5)
            .mount(&self.server)
            .await;
    }

    /// Answer the next chat request with a single tool call
    ///
    /// Takes precedence over [`Self::mock_chat_stream`] for one request, so
    /// mounting both scripts a tool step followed by a text step.
    pub async fn mock_chat_tool_call_once(&self, tool_name: &str, arguments: Value) {
        self.mount_tool_call_once(json!({"function": {"name": tool_name, "arguments": arguments}}))
            .await;
    }

    /// Like [`Self::mock_chat_tool_call_once`], with the call id newer
    /// servers mint per generation
    pub async fn mock_chat_tool_call_with_id_once(
        &self,
        tool_name: &str,
        arguments: Value,
        call_id: &str,
    ) {
        self.mount_tool_call_once(json!({
            "id": call_id,
            "function": {"name": tool_name, "arguments": arguments}
        }))
        .await;
    }

    async fn mount_tool_call_once(&self, tool_call: Value) {
        let body = format!(
            "{}\n{}\n",
            json!({
                "message": {
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [tool_call]
                },
                "done": false
            }),
            json!({
                "message": {"role": "assistant", "content": ""},
                "done": true,
                "done_reason": "stop"
            })
        );

        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Reject every chat request with HTTP 429
    pub async fn mock_rate_limited(&self, retry_after_secs: u64) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", retry_after_secs.to_string().as_str())
                    .set_body_json(json!({"error": "rate limit exceeded"})),
            )
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Mount a mock for chat failure with the given status
    pub async fn mock_chat_failure(&self, status_code: u16, error_message: &str) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(status_code).set_body_json(json!({
                    "error": error_message
                })),
            )
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Mount a mock for the /api/tags endpoint (list models)
    pub async fn mock_list_models(&self, models: &[&str]) {
        let model_list: Vec<Value> = models
            .iter()
            .map(|name| {
                json!({
                    "name": name,
                    "modified_at": "2024-01-01T00:00:00Z",
                    "size": 4_000_000_000_i64
                })
            })
            .collect();

        Mock::given(method("GET"))
            .and(path("/api/tags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "models": model_list
            })))
            .mount(&self.server)
            .await;
    }

    /// Delay chat responses to exercise timeouts and cancellation
    pub async fn mock_slow_chat(&self, delay_ms: u64, tokens: &[&str]) {
        Mock::given(method("POST"))
            .and(path("/api/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(std::time::Duration::from_millis(delay_ms))
                    .set_body_string(ndjson_body(tokens)),
            )
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Number of chat requests the server has received
    pub async fn chat_calls(&self) -> usize {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == "/api/chat")
            .count()
    }

    /// Bodies of every chat request received, in arrival order
    pub async fn chat_requests(&self) -> Vec<Value> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path() == "/api/chat")
            .filter_map(|request| serde_json::from_slice(&request.body).ok())
            .collect()
    }
}
