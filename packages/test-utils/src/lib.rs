//! Shared test utilities for the Encore workspace
//!
//! Mock implementations of external services so the API and client test
//! suites run without network dependencies.
//!
//! - [`MockOllamaServer`] - Mock Ollama chat server speaking the streaming
//!   NDJSON protocol, including tool calls and rate limiting
//!
//! # Example
//!
//! ```rust,ignore
//! use encore_test_utils::MockOllamaServer;
//!
//! #[tokio::test]
//! async fn test_with_mock() {
//!     let ollama = MockOllamaServer::start().await;
//!     ollama.mock_chat_stream(&["Hi", " there"]).await;
//!
//!     // Use ollama.url() to configure your client
//! }
//! ```

mod ollama;

pub use ollama::{ndjson_body, MockOllamaServer};
