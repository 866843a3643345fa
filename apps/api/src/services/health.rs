//! Health checks for the services a chat turn depends on
//!
//! - PostgreSQL (skipped with in-memory storage)
//! - every configured Ollama backend

use std::sync::Arc;
use std::time::{Duration, Instant};

use encore_ollama_client::OllamaClient;
use serde::Serialize;
use sqlx::PgPool;

/// Status of an individual service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Healthy,
    Unhealthy,
    /// Not used by this deployment
    Skipped,
}

/// Result of a single service health check
#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealth {
    pub name: String,
    pub status: ServiceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ServiceHealth {
    pub fn healthy(name: impl Into<String>, response_time: Duration) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Healthy,
            response_time_ms: Some(response_time.as_millis() as u64),
            error: None,
            details: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Unhealthy,
            response_time_ms: None,
            error: Some(error.into()),
            details: None,
        }
    }

    pub fn skipped(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: ServiceStatus::Skipped,
            response_time_ms: None,
            error: None,
            details: Some(serde_json::json!({ "reason": reason.into() })),
        }
    }

    fn with_time(mut self, response_time: Duration) -> Self {
        self.response_time_ms = Some(response_time.as_millis() as u64);
        self
    }

    fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Aggregated health check response
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResponse {
    /// Healthy only if every checked service is healthy
    pub status: ServiceStatus,
    pub services: Vec<ServiceHealth>,
    pub total_time_ms: u64,
    pub version: &'static str,
}

impl HealthCheckResponse {
    pub fn new(services: Vec<ServiceHealth>, total_time: Duration) -> Self {
        let status = if services
            .iter()
            .all(|s| s.status != ServiceStatus::Unhealthy)
        {
            ServiceStatus::Healthy
        } else {
            ServiceStatus::Unhealthy
        };

        Self {
            status,
            services,
            total_time_ms: total_time.as_millis() as u64,
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ServiceStatus::Healthy
    }
}

/// Runs dependency checks against the live pool and model clients
#[derive(Clone)]
pub struct HealthService {
    pool: Option<PgPool>,
    backends: Vec<(String, Arc<OllamaClient>)>,
}

impl HealthService {
    pub fn new(pool: Option<PgPool>) -> Self {
        Self {
            pool,
            backends: Vec::new(),
        }
    }

    /// Add a model backend to check, under the given service name
    pub fn with_backend(mut self, name: impl Into<String>, client: Arc<OllamaClient>) -> Self {
        self.backends.push((name.into(), client));
        self
    }

    pub async fn check_database(&self) -> ServiceHealth {
        let Some(pool) = &self.pool else {
            return ServiceHealth::skipped("database", "in-memory storage");
        };

        let start = Instant::now();
        match sqlx::query_scalar::<_, i32>("SELECT 1").fetch_one(pool).await {
            Ok(_) => ServiceHealth::healthy("database", start.elapsed()).with_details(
                serde_json::json!({
                    "pool_size": pool.size(),
                    "idle_connections": pool.num_idle(),
                }),
            ),
            Err(e) => ServiceHealth::unhealthy("database", format!("Query failed: {}", e))
                .with_time(start.elapsed()),
        }
    }

    /// A backend is healthy when reachable; a missing model is reported, not failed
    pub async fn check_ollama(&self, name: &str, client: &OllamaClient) -> ServiceHealth {
        let start = Instant::now();
        let model = client.config().model.clone();

        match client.list_models().await {
            Ok(models) => {
                let elapsed = start.elapsed();
                let model_available = models
                    .iter()
                    .any(|m| *m == model || m.starts_with(&format!("{}:", model)));

                let mut health = ServiceHealth::healthy(name, elapsed).with_details(
                    serde_json::json!({
                        "configured_model": model,
                        "model_available": model_available,
                        "available_models": models.len(),
                    }),
                );
                if !model_available {
                    health.error = Some(format!(
                        "Configured model '{}' not found. Available: {}",
                        model,
                        models.join(", ")
                    ));
                }
                health
            }
            Err(e) => ServiceHealth::unhealthy(name, format!("Request failed: {}", e))
                .with_time(start.elapsed()),
        }
    }

    /// Run all checks in parallel
    pub async fn check_all(&self) -> HealthCheckResponse {
        let start = Instant::now();

        let backend_checks = futures_util::future::join_all(
            self.backends
                .iter()
                .map(|(name, client)| self.check_ollama(name, client)),
        );
        let (database, backends) = tokio::join!(self.check_database(), backend_checks);

        let mut services = vec![database];
        services.extend(backends);

        HealthCheckResponse::new(services, start.elapsed())
    }
}
