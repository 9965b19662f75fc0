use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use answer_relay::app_state::AppState;
use answer_relay::config::AppConfig;
use answer_relay::db::{self, PgJobStore};
use answer_relay::routes;
use answer_relay::services::{
    cache::RedisCache,
    hub::NotificationHub,
    image_prep::ImageOcrPreparer,
    ocr::OpenAiVisionClient,
    orchestrator::Orchestrator,
    providers::build_providers,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let config = AppConfig::from_env().expect("Failed to load configuration from environment");

    tracing::info!("Initializing answer-relay server");

    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus metrics recorder");
    let prometheus_handle = Arc::new(prometheus_handle);

    metrics::describe_counter!("jobs_started_total", "Pipeline runs that acquired the job lock");
    metrics::describe_counter!("jobs_completed_total", "Pipeline runs that reached completed");
    metrics::describe_counter!("jobs_failed_total", "Pipeline runs stopped by a hard fault");
    metrics::describe_counter!(
        "jobs_skipped_total",
        "Triggers dropped because another run held the job lock"
    );
    metrics::describe_counter!("ocr_cache_hits_total", "OCR results served from the cache");
    metrics::describe_counter!("ocr_requests_total", "OCR calls sent to the vision backend");
    metrics::describe_counter!(
        "provider_answers_total",
        "Backend answers recorded, by provider and outcome"
    );
    metrics::describe_histogram!(
        "provider_latency_seconds",
        "Wall time of one backend call, by provider"
    );

    tracing::info!("Connecting to PostgreSQL database");
    let db_pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");
    let jobs = Arc::new(PgJobStore::new(db_pool));

    tracing::info!("Connecting to Redis");
    let cache = Arc::new(RedisCache::new(&config.redis_url).expect("Failed to initialize Redis"));

    let ocr_key = config.ocr_key().unwrap_or_default();
    if ocr_key.is_empty() {
        tracing::warn!("No OCR key configured; OCR calls will be rejected upstream");
    }
    let ocr = Arc::new(OpenAiVisionClient::new(
        ocr_key,
        &config.ocr_openai_model,
        config.ocr_rps,
        config.ocr_burst,
        config.provider_max_retries,
    ));
    let preparer = Arc::new(ImageOcrPreparer::new(
        config.ocr_img_max_w,
        config.ocr_img_quality,
        config.ocr_img_grayscale,
    ));

    let providers = build_providers(&config);
    if providers.is_empty() {
        tracing::warn!("No answer backend keys configured; jobs will complete without answers");
    }

    let hub = NotificationHub::new();
    let orchestrator = Orchestrator::new(
        jobs.clone(),
        cache.clone(),
        preparer,
        ocr,
        providers,
        hub.clone(),
        config.pipeline_settings(),
    );

    match orchestrator.resume_unfinished().await {
        Ok(handles) if !handles.is_empty() => {
            tracing::info!(count = handles.len(), "Resumed unfinished jobs");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "Failed to list unfinished jobs"),
    }

    let state = AppState::new(jobs, cache, hub, orchestrator.clone());

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/ws", get(routes::ws::websocket_handler))
        .route("/api/v1/jobs", post(routes::jobs::create_job))
        .route("/api/v1/jobs/{job_id}/process", post(routes::jobs::process_job))
        .with_state(state)
        .route(
            "/metrics",
            get(routes::metrics::prometheus_metrics).with_state(prometheus_handle),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .expect("Failed to bind to address");

    tracing::info!("Server listening on {}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("Server error");

    orchestrator.shutdown().await;
    tracing::info!("Server stopped");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
}
