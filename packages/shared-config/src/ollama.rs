//! Model backend configuration types

use crate::{get_env_or_default, get_required_env, parse_env, ConfigError, ConfigResult};

/// Configuration for one Ollama-compatible chat backend
#[derive(Debug, Clone)]
pub struct OllamaConfig {
    /// Name used in logs to tell backends apart
    pub name: String,

    /// Ollama server URL
    pub url: String,

    /// LLM model for chat (e.g., mistral, llama3.1)
    pub model: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Maximum tokens for generation
    pub max_tokens: u32,

    /// Temperature for generation (0.0 - 1.0)
    pub temperature: f32,
}

impl OllamaConfig {
    /// Load the primary backend from `OLLAMA_*` variables
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            name: get_env_or_default("OLLAMA_NAME", "primary"),
            url: get_env_or_default("OLLAMA_URL", "http://localhost:11434"),
            model: get_env_or_default("OLLAMA_MODEL", "mistral"),
            timeout_secs: parse_env("OLLAMA_TIMEOUT", 60)?,
            max_tokens: parse_env("OLLAMA_MAX_TOKENS", 2048)?,
            temperature: parse_env("OLLAMA_TEMPERATURE", 0.7)?,
        })
    }

    /// Load the fallback backend from `FALLBACK_OLLAMA_*` variables
    ///
    /// Returns an error when `FALLBACK_OLLAMA_URL` is unset so callers can
    /// use `.ok()` to treat the fallback as optional.
    pub fn fallback_from_env() -> ConfigResult<Self> {
        let url = get_required_env("FALLBACK_OLLAMA_URL")?;
        if url.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "FALLBACK_OLLAMA_URL".to_string(),
                "URL cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            name: get_env_or_default("FALLBACK_OLLAMA_NAME", "fallback"),
            url,
            model: get_env_or_default("FALLBACK_OLLAMA_MODEL", "llama3.1"),
            timeout_secs: parse_env("FALLBACK_OLLAMA_TIMEOUT", 60)?,
            max_tokens: parse_env("FALLBACK_OLLAMA_MAX_TOKENS", 2048)?,
            temperature: parse_env("FALLBACK_OLLAMA_TEMPERATURE", 0.7)?,
        })
    }

    /// Create a configuration with a custom URL (useful for testing)
    pub fn with_url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Rename the backend
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Get the full URL for the chat endpoint
    pub fn chat_url(&self) -> String {
        format!("{}/api/chat", self.url.trim_end_matches('/'))
    }

    /// Get the full URL for the model listing endpoint
    pub fn tags_url(&self) -> String {
        format!("{}/api/tags", self.url.trim_end_matches('/'))
    }
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            name: "primary".to_string(),
            url: "http://localhost:11434".to_string(),
            model: "mistral".to_string(),
            timeout_secs: 60,
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// The ordered set of chat backends: a primary and an optional fallback
#[derive(Debug, Clone, Default)]
pub struct ModelsConfig {
    pub primary: OllamaConfig,
    pub fallback: Option<OllamaConfig>,
}

impl ModelsConfig {
    pub fn from_env() -> ConfigResult<Self> {
        Ok(Self {
            primary: OllamaConfig::from_env()?,
            fallback: OllamaConfig::fallback_from_env().ok(),
        })
    }
}
