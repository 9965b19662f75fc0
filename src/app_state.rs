use sqlx::PgPool;
use std::sync::Arc;

use crate::db::PgJobStore;
use crate::services::{cache::RedisCache, hub::NotificationHub, orchestrator::Orchestrator};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub jobs: Arc<PgJobStore>,
    pub cache: Arc<RedisCache>,
    pub hub: NotificationHub,
    pub orchestrator: Orchestrator,
}

impl AppState {
    pub fn new(
        jobs: Arc<PgJobStore>,
        cache: Arc<RedisCache>,
        hub: NotificationHub,
        orchestrator: Orchestrator,
    ) -> Self {
        Self {
            db: jobs.pool().clone(),
            jobs,
            cache,
            hub,
            orchestrator,
        }
    }
}
