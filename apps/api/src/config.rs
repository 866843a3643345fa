//! API server configuration

use std::env;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use encore_shared_config::{
    parse_env, CommonConfig, DatabaseConfig, Environment, ModelsConfig, StorageBackend,
    TelegramConfig,
};

/// Minimum required length for JWT_SECRET to be considered secure
const MIN_JWT_SECRET_LENGTH: usize = 32;

/// API server configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Common configuration shared with other services
    pub common: CommonConfig,

    /// Server port (default: 8080)
    pub port: u16,

    /// JWT secret for verifying bearer tokens
    pub jwt_secret: String,

    /// CORS allowed origins (optional)
    pub cors_allowed_origins: Option<Vec<String>>,

    /// Upper bound for a whole chat turn, in seconds (default: 120)
    pub turn_timeout_secs: u64,

    /// Maximum model calls per turn, tool round trips included (default: 5)
    pub max_tool_steps: usize,
}

impl Config {
    /// Load configuration from environment variables
    ///
    /// In production mode, this function requires:
    /// - `JWT_SECRET`: Must be set and at least 32 characters long
    /// - `DATABASE_URL`: Must be explicitly set (no insecure defaults)
    ///
    /// In development/staging mode, sensible defaults are used for convenience.
    pub fn from_env() -> Result<Self> {
        let environment = Environment::from_str(
            &env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
        )
        .unwrap_or_default();
        let is_production = environment.is_production();

        let jwt_secret = Self::load_jwt_secret(is_production)?;

        let common = CommonConfig::from_env().context("Failed to load common config")?;

        if is_production {
            if common.storage == StorageBackend::Memory {
                bail!("STORAGE_BACKEND=memory is not allowed in production");
            }
            Self::validate_database_url()?;
        }

        let max_tool_steps: usize = parse_env("MAX_TOOL_STEPS", 5)?;
        if max_tool_steps == 0 {
            bail!("MAX_TOOL_STEPS must be at least 1");
        }

        Ok(Self {
            common,

            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .context("Invalid PORT value")?,

            jwt_secret,

            cors_allowed_origins: env::var("CORS_ORIGINS").ok().map(|s| {
                s.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }),

            turn_timeout_secs: parse_env("TURN_TIMEOUT_SECS", 120)?,

            max_tool_steps,
        })
    }

    /// Load and validate JWT_SECRET
    ///
    /// In production:
    /// - JWT_SECRET must be explicitly set
    /// - Must be at least MIN_JWT_SECRET_LENGTH characters
    ///
    /// In development: uses a default value with a warning
    fn load_jwt_secret(is_production: bool) -> Result<String> {
        match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => {
                if is_production && secret.len() < MIN_JWT_SECRET_LENGTH {
                    bail!(
                        "JWT_SECRET must be at least {} characters in production (got {})",
                        MIN_JWT_SECRET_LENGTH,
                        secret.len()
                    );
                }
                Ok(secret)
            }
            _ if is_production => {
                bail!(
                    "JWT_SECRET environment variable is required in production. \
                     Please set a secure secret of at least {} characters.",
                    MIN_JWT_SECRET_LENGTH
                );
            }
            _ => {
                tracing::warn!(
                    "JWT_SECRET not set, using insecure default. \
                     This is only acceptable in development mode."
                );
                Ok("development-secret-change-in-production".to_string())
            }
        }
    }

    /// Validate that DATABASE_URL is explicitly set in production
    fn validate_database_url() -> Result<()> {
        match env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => Ok(()),
            _ => {
                bail!(
                    "DATABASE_URL environment variable is required in production. \
                     Please set your PostgreSQL connection string."
                );
            }
        }
    }

    /// Get database configuration
    pub fn database(&self) -> &DatabaseConfig {
        &self.common.database
    }

    /// Get model backend configuration
    pub fn models(&self) -> &ModelsConfig {
        &self.common.models
    }

    /// Get Telegram configuration (if configured)
    pub fn telegram(&self) -> Option<&TelegramConfig> {
        self.common.telegram.as_ref()
    }

    /// Get environment mode
    pub fn environment(&self) -> Environment {
        self.common.environment
    }

    /// Overall turn deadline
    pub fn turn_timeout(&self) -> Duration {
        Duration::from_secs(self.turn_timeout_secs)
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.common.environment.is_production()
    }
}
