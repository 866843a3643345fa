//! Telegram operator notification configuration

use crate::{get_env_or_default, get_required_env, parse_env, ConfigError, ConfigResult};

/// Telegram Bot API settings used for operator alerts
#[derive(Debug, Clone)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    pub bot_token: String,

    /// Chat that receives the alerts
    pub chat_id: String,

    /// Bot API base URL (overridable for tests)
    pub api_url: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

impl TelegramConfig {
    /// Load Telegram configuration from environment variables
    ///
    /// Returns an error if the token or chat id is not set, so consumers can
    /// call `.ok()` to get `Option<TelegramConfig>`.
    pub fn from_env() -> ConfigResult<Self> {
        let bot_token = get_required_env("TELEGRAM_BOT_TOKEN")?;
        let chat_id = get_required_env("TELEGRAM_CHAT_ID")?;

        if bot_token.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "TELEGRAM_BOT_TOKEN".to_string(),
                "token cannot be empty".to_string(),
            ));
        }

        if chat_id.trim().is_empty() {
            return Err(ConfigError::InvalidValue(
                "TELEGRAM_CHAT_ID".to_string(),
                "chat id cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            bot_token,
            chat_id,
            api_url: get_env_or_default("TELEGRAM_API_URL", "https://api.telegram.org"),
            timeout_secs: parse_env("TELEGRAM_TIMEOUT", 10)?,
        })
    }

    /// Create a configuration with explicit values (useful for testing)
    pub fn new(
        api_url: impl Into<String>,
        bot_token: impl Into<String>,
        chat_id: impl Into<String>,
    ) -> Self {
        Self {
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            api_url: api_url.into(),
            timeout_secs: 10,
        }
    }

    /// Full URL of the `sendMessage` method
    pub fn send_message_url(&self) -> String {
        format!(
            "{}/bot{}/sendMessage",
            self.api_url.trim_end_matches('/'),
            self.bot_token
        )
    }
}
