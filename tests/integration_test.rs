use std::time::Duration;

use answer_relay::{
    config::AppConfig,
    db::{self, JobStore, PgJobStore},
    models::answer::{Answer, AnswerOutcome, Backend},
    models::job::JobStatus,
    services::cache::{job_lock_key, RedisCache, SharedCache},
};
use uuid::Uuid;

/// Postgres job store against a live database.
///
/// Note: requires PostgreSQL configured via DATABASE_URL (and REDIS_URL for
/// config loading).
#[tokio::test]
#[ignore] // Run with: cargo test --test integration_test -- --ignored
async fn test_job_store_roundtrip() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let pool = db::init_pool(&config.database_url, config.db_max_connections)
        .await
        .expect("Failed to connect to database");
    db::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    let store = PgJobStore::new(pool);

    let job = store
        .create_job(Uuid::new_v4(), "uploads/test.png", &Uuid::new_v4().to_string())
        .await
        .expect("Failed to create job");
    assert_eq!(job.status, JobStatus::Processing);
    assert!(job.ocr_text.is_none());

    store
        .update_ocr_text(job.id, "What is 2 + 2?")
        .await
        .expect("Failed to store OCR text");

    // Two writes for one backend leave one row holding the latest answer.
    let first = Answer {
        answer: "3".to_string(),
        ..Answer::default()
    };
    let second = Answer {
        answer: "4".to_string(),
        reason: Some("arithmetic".to_string()),
        options: vec!["3".to_string(), "4".to_string()],
        confidence: Some(0.95),
        latency_ms: 120,
        ..Answer::default()
    };
    for answer in [&first, &second] {
        store
            .upsert_answer(job.id, Backend::OpenAi, AnswerOutcome::Answered(answer))
            .await
            .expect("Failed to upsert answer");
    }
    store
        .upsert_answer(
            job.id,
            Backend::Gemini,
            AnswerOutcome::Failed {
                reason: "GEMINI http 503",
                latency_ms: 40,
            },
        )
        .await
        .expect("Failed to upsert error answer");

    let answers = store.answers_for_job(job.id).await.expect("Failed to list answers");
    assert_eq!(answers.len(), 2);
    assert!(answers.contains(&("OPENAI".to_string(), "4".to_string())));
    assert!(answers.contains(&("GEMINI".to_string(), "ERROR".to_string())));

    let pending = store.list_processing(1000).await.expect("Failed to list jobs");
    assert!(pending.contains(&job.id));

    store
        .update_status(job.id, JobStatus::Completed)
        .await
        .expect("Failed to complete job");
    // Terminal status sticks.
    store
        .update_status(job.id, JobStatus::Error)
        .await
        .expect("Failed to run status update");

    let reloaded = store
        .get_job(job.id)
        .await
        .expect("Failed to get job")
        .expect("Job not found");
    assert_eq!(reloaded.status, JobStatus::Completed);
    assert_eq!(reloaded.ocr_text.as_deref(), Some("What is 2 + 2?"));

    let pending = store.list_processing(1000).await.expect("Failed to list jobs");
    assert!(!pending.contains(&job.id));
}

/// Redis lock and cache primitives against a live server.
#[tokio::test]
#[ignore]
async fn test_redis_lock_is_single_flight() {
    let config = AppConfig::from_env().expect("Failed to load config");
    let cache = RedisCache::new(&config.redis_url).expect("Failed to initialize Redis");
    cache.health_check().await.expect("Redis unreachable");

    let key = job_lock_key(Uuid::new_v4());
    let ttl = Duration::from_secs(30);

    assert!(cache.set_if_absent(&key, "1", ttl).await.unwrap());
    assert!(!cache.set_if_absent(&key, "1", ttl).await.unwrap());
    assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some("1"));

    cache.delete(&key).await.unwrap();
    assert!(cache.get(&key).await.unwrap().is_none());
    assert!(cache.set_if_absent(&key, "1", ttl).await.unwrap());
    cache.delete(&key).await.unwrap();
}
