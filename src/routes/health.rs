use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;

use crate::app_state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub providers: usize,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
}

#[derive(Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub latency_ms: Option<u64>,
}

impl ComponentHealth {
    fn from_probe<E>(started: Instant, probe: Result<(), E>) -> Self {
        match probe {
            Ok(()) => Self {
                status: "ok",
                latency_ms: Some(started.elapsed().as_millis() as u64),
            },
            Err(_) => Self {
                status: "error",
                latency_ms: None,
            },
        }
    }

    fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

/// GET /health: Postgres and Redis reachability plus the fan-out size.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let db_probe = sqlx::query("SELECT 1").execute(&state.db).await.map(|_| ());
    let database = ComponentHealth::from_probe(started, db_probe);

    let started = Instant::now();
    let redis = ComponentHealth::from_probe(started, state.cache.health_check().await);

    let healthy = database.is_ok() && redis.is_ok();
    if !healthy {
        tracing::warn!(
            database = database.status,
            redis = redis.status,
            "health_degraded"
        );
    }

    let response = HealthResponse {
        status: if healthy { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        providers: state.orchestrator.provider_count(),
        checks: HealthChecks { database, redis },
    };

    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(response))
}
