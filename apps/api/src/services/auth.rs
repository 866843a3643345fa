//! Account authentication
//!
//! Accounts are issued HS256 access tokens by the account system upstream of
//! this service. The chat API only verifies them and reads the account
//! identity from the claims.

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};

/// Authentication service configuration
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// JWT signing secret
    pub jwt_secret: String,
    /// Access token TTL in seconds (default: 1 hour)
    pub access_token_ttl_secs: i64,
    pub issuer: String,
    pub audience: String,
}

impl AuthConfig {
    pub fn new(jwt_secret: String) -> Self {
        Self {
            jwt_secret,
            access_token_ttl_secs: 3600,
            issuer: "encore".to_string(),
            audience: "encore".to_string(),
        }
    }
}

/// Access token claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (account ID)
    pub sub: Uuid,
    pub email: String,
    /// Issued at timestamp (Unix epoch)
    pub iat: i64,
    /// Expiration timestamp (Unix epoch)
    pub exp: i64,
    #[serde(default = "default_issuer")]
    pub iss: String,
    #[serde(default = "default_audience")]
    pub aud: String,
}

fn default_issuer() -> String {
    "encore".to_string()
}

fn default_audience() -> String {
    "encore".to_string()
}

/// The authenticated caller of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account_id: Uuid,
    pub email: String,
}

impl From<&Claims> for Identity {
    fn from(claims: &Claims) -> Self {
        Self {
            account_id: claims.sub,
            email: claims.email.clone(),
        }
    }
}

#[derive(Clone)]
pub struct AuthService {
    config: AuthConfig,
}

impl AuthService {
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    /// Issue an access token for an account
    ///
    /// Used by operator tooling and tests; end users receive tokens from the
    /// account system.
    pub fn issue_access_token(&self, account_id: Uuid, email: &str) -> ApiResult<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: account_id,
            email: email.to_string(),
            iat: now,
            exp: now + self.config.access_token_ttl_secs,
            iss: self.config.issuer.clone(),
            aud: self.config.audience.clone(),
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )?;

        Ok(token)
    }

    /// Verify an access token and return its claims
    pub fn verify_access_token(&self, token: &str) -> ApiResult<Claims> {
        let mut validation = Validation::default();
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&[&self.config.audience]);

        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|e| {
            tracing::debug!(error = %e, "Access token verification failed");
            ApiError::InvalidToken(e.to_string())
        })?;

        Ok(token_data.claims)
    }

    /// Verify a token and return the caller identity
    pub fn authenticate(&self, token: &str) -> ApiResult<Identity> {
        let claims = self.verify_access_token(token)?;
        Ok(Identity::from(&claims))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn service() -> AuthService {
        AuthService::new(AuthConfig::new(
            "test-secret-that-is-long-enough-for-hs256".to_string(),
        ))
    }

    #[test]
    fn test_issued_token_round_trips_identity() {
        let service = service();
        let account_id = Uuid::new_v4();
        let token = service
            .issue_access_token(account_id, "am@label.test")
            .unwrap();

        let identity = service.authenticate(&token).unwrap();
        assert_eq!(identity.account_id, account_id);
        assert_eq!(identity.email, "am@label.test");
    }

    #[test]
    fn test_token_signed_with_other_secret_is_rejected() {
        let other = AuthService::new(AuthConfig::new(
            "a-completely-different-secret-value-000".to_string(),
        ));
        let token = other
            .issue_access_token(Uuid::new_v4(), "am@label.test")
            .unwrap();

        assert_matches!(
            service().verify_access_token(&token),
            Err(ApiError::InvalidToken(_))
        );
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let mut config = AuthConfig::new("test-secret-that-is-long-enough-for-hs256".to_string());
        config.access_token_ttl_secs = -3600;
        let service = AuthService::new(config);
        let token = service
            .issue_access_token(Uuid::new_v4(), "am@label.test")
            .unwrap();

        assert_matches!(
            service.verify_access_token(&token),
            Err(ApiError::InvalidToken(_))
        );
    }

    #[test]
    fn test_garbage_token_is_rejected() {
        assert!(service().verify_access_token("not-a-jwt").is_err());
    }
}
