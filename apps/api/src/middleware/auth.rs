//! Authentication extractor for Axum handlers
//!
//! [`AuthAccount`] requires a valid bearer JWT and returns 401 if it is
//! missing or invalid. The [`AuthService`] is read from request extensions.
//!
//! ```rust,ignore
//! async fn handler(auth: AuthAccount) -> impl IntoResponse {
//!     format!("Account: {}", auth.identity.account_id)
//! }
//! ```

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};

use crate::error::{ApiError, ErrorResponse};
use crate::services::{AuthService, Claims, Identity};

/// Authenticated account making the request
#[derive(Debug, Clone)]
pub struct AuthAccount {
    pub identity: Identity,
    pub claims: Claims,
}

#[derive(Debug)]
pub enum AuthRejection {
    /// Missing or non-bearer Authorization header
    MissingToken,
    /// Token is malformed, expired or signed with another key
    InvalidToken(String),
    /// AuthService was not added to the request extensions
    MissingServices,
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AuthRejection::MissingToken => {
                tracing::debug!("Authentication rejected: missing token");
                (StatusCode::UNAUTHORIZED, ApiError::Unauthorized)
            }
            AuthRejection::InvalidToken(reason) => {
                tracing::debug!(reason = %reason, "Authentication rejected: invalid token");
                (StatusCode::UNAUTHORIZED, ApiError::InvalidToken(reason))
            }
            AuthRejection::MissingServices => {
                tracing::error!("Authentication rejected: missing services in app state");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError::Internal("Authentication services not configured".to_string()),
                )
            }
        };

        let body = Json(ErrorResponse {
            code: error.error_code(),
            message: error.to_string(),
            details: None,
        });

        (status, body).into_response()
    }
}

fn extract_bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthAccount
where
    S: Send + Sync,
{
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(parts).ok_or(AuthRejection::MissingToken)?;

        let auth_service = parts
            .extensions
            .get::<AuthService>()
            .ok_or(AuthRejection::MissingServices)?;

        let claims = auth_service
            .verify_access_token(token)
            .map_err(|e| AuthRejection::InvalidToken(e.to_string()))?;

        Ok(AuthAccount {
            identity: Identity::from(&claims),
            claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::AuthConfig;
    use axum::http::Request;
    use uuid::Uuid;

    fn parts(auth: Option<&str>, service: Option<AuthService>) -> Parts {
        let mut builder = Request::builder().uri("/api/rooms");
        if let Some(value) = auth {
            builder = builder.header(AUTHORIZATION, value);
        }
        let (mut parts, _) = builder.body(()).unwrap().into_parts();
        if let Some(service) = service {
            parts.extensions.insert(service);
        }
        parts
    }

    fn service() -> AuthService {
        AuthService::new(AuthConfig::new("a".repeat(32)))
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let service = service();
        let account_id = Uuid::new_v4();
        let token = service.issue_access_token(account_id, "am@label.test").unwrap();

        let mut parts = parts(Some(&format!("Bearer {}", token)), Some(service));
        let auth = AuthAccount::from_request_parts(&mut parts, &()).await.unwrap();

        assert_eq!(auth.identity.account_id, account_id);
        assert_eq!(auth.identity.email, "am@label.test");
    }

    #[tokio::test]
    async fn test_missing_or_malformed_token_is_rejected() {
        let mut missing = parts(None, Some(service()));
        assert!(matches!(
            AuthAccount::from_request_parts(&mut missing, &()).await,
            Err(AuthRejection::MissingToken)
        ));

        let mut basic = parts(Some("Basic abc"), Some(service()));
        assert!(matches!(
            AuthAccount::from_request_parts(&mut basic, &()).await,
            Err(AuthRejection::MissingToken)
        ));

        let mut garbage = parts(Some("Bearer not-a-jwt"), Some(service()));
        assert!(matches!(
            AuthAccount::from_request_parts(&mut garbage, &()).await,
            Err(AuthRejection::InvalidToken(_))
        ));
    }

    #[tokio::test]
    async fn test_rejection_response_status() {
        let response = AuthRejection::MissingToken.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut unconfigured = parts(Some("Bearer x"), None);
        let rejection = AuthAccount::from_request_parts(&mut unconfigured, &())
            .await
            .unwrap_err();
        assert_eq!(
            rejection.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
