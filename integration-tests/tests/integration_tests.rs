// Integration tests against a live PostgreSQL
//
// Run with DATABASE_URL pointing at a disposable database:
//   cargo test -p integration-tests -- --ignored

use chrono::{Duration, Utc};
use common::clock::SystemClock;
use common::config::LeaseConfig;
use common::db::repositories::{
    JobRepository, JobServiceManagementRepository, PgJobRepository,
    PgJobServiceManagementRepository,
};
use common::db::DbPool;
use common::lease::InstanceLeaseManager;
use common::models::{
    HttpMethod, JobDetails, JobDetailsPatch, JobServiceManagementInfo, JobStatus, Recipient,
};
use common::trigger::Trigger;
use futures::TryStreamExt;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Helper function to setup a migrated test database connection
async fn setup_test_db() -> DbPool {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost:5432/jobs_service_test".to_string());

    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to test database");
    let db_pool = DbPool::from_pool(pool);
    db_pool.migrate().await.expect("Failed to run migrations");
    db_pool
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

fn http_recipient() -> Recipient {
    Recipient::Http {
        url: "http://localhost:8080/callback".to_string(),
        method: HttpMethod::Post,
        headers: HashMap::new(),
        payload: Some(serde_json::json!({"hello": "world"})),
    }
}

#[tokio::test]
#[ignore] // Requires PostgreSQL to be running
async fn test_job_repository_round_trip_and_merge() {
    let repo = PgJobRepository::new(setup_test_db().await);
    let id = unique("job");
    let fire_at = Utc::now() + Duration::minutes(5);

    let job = JobDetails::new(id.clone(), Trigger::point_in_time(fire_at), http_recipient())
        .with_retries(2)
        .with_priority(7)
        .with_correlation_id("corr-1");
    let saved = repo.save(&job).await.unwrap();
    assert!(saved.created.is_some());
    assert!(repo.exists(&id).await.unwrap());

    let loaded = repo.get(&id).await.unwrap().unwrap();
    assert_eq!(loaded.trigger, job.trigger);
    assert_eq!(loaded.recipient, job.recipient);
    assert_eq!(loaded.retries, 2);
    assert_eq!(loaded.priority, 7);

    let new_fire = fire_at + Duration::hours(1);
    let merged = repo
        .merge(&id, &JobDetailsPatch::trigger(Trigger::point_in_time(new_fire)))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(merged.fire_time().map(|t| t.timestamp()), Some(new_fire.timestamp()));
    assert_eq!(merged.created.map(|t| t.timestamp()), saved.created.map(|t| t.timestamp()));

    let deleted = repo.delete(&id).await.unwrap();
    assert!(deleted.is_some());
    assert!(repo.get(&id).await.unwrap().is_none());
    assert!(repo
        .merge(&id, &JobDetailsPatch::default())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore] // Requires PostgreSQL to be running
async fn test_find_by_status_window_orders_by_priority() {
    let repo = PgJobRepository::new(setup_test_db().await);
    // Far enough in the future not to collide with other test data
    let base = Utc::now() + Duration::days(3650 + rand_days());

    let low = JobDetails::new(unique("low"), Trigger::point_in_time(base), http_recipient())
        .with_priority(1);
    let high = JobDetails::new(
        unique("high"),
        Trigger::point_in_time(base + Duration::seconds(30)),
        http_recipient(),
    )
    .with_priority(9);
    let failed = JobDetails::new(
        unique("failed"),
        Trigger::point_in_time(base + Duration::seconds(10)),
        http_recipient(),
    )
    .with_status(JobStatus::Error);
    let outside = JobDetails::new(
        unique("outside"),
        Trigger::point_in_time(base + Duration::minutes(10)),
        http_recipient(),
    );

    for job in [&low, &high, &failed, &outside] {
        repo.save(job).await.unwrap();
    }

    let found: Vec<JobDetails> = repo
        .find_by_status_between_dates_order_by_priority(
            base,
            base + Duration::minutes(10),
            &[JobStatus::Scheduled, JobStatus::Retry],
        )
        .try_collect()
        .await
        .unwrap();

    let ids: Vec<&str> = found.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec![high.id.as_str(), low.id.as_str()]);

    for job in [&low, &high, &failed, &outside] {
        repo.delete(&job.id).await.unwrap();
    }
}

fn rand_days() -> i64 {
    (Uuid::new_v4().as_u128() % 1000) as i64
}

#[tokio::test]
#[ignore] // Requires PostgreSQL to be running
async fn test_management_repository_fencing() {
    let repo = PgJobServiceManagementRepository::new(setup_test_db().await);
    let slot = unique("slot");

    let a = JobServiceManagementInfo::new(slot.clone(), "token-a");
    let b = JobServiceManagementInfo::new(slot.clone(), "token-b");

    repo.set(&a).await.unwrap();
    let beat = repo.heartbeat(&a, Utc::now()).await.unwrap().unwrap();
    assert!(beat.last_heartbeat.is_some());

    // b takes the slot over; a is fenced out from then on
    let taken = repo.set(&b).await.unwrap();
    assert!(taken.last_heartbeat.is_none());
    assert!(repo.heartbeat(&a, Utc::now()).await.unwrap().is_none());
    assert!(repo.release(&a).await.unwrap().is_none());
    assert!(repo.heartbeat(&b, Utc::now()).await.unwrap().is_some());

    let released = repo.release(&b).await.unwrap().unwrap();
    assert!(released.token.is_none());
    assert!(released.last_heartbeat.is_none());
}

#[tokio::test]
#[ignore] // Requires PostgreSQL to be running
async fn test_heartbeat_stores_the_callers_time() {
    let repo = PgJobServiceManagementRepository::new(setup_test_db().await);
    let slot = unique("slot");
    let info = JobServiceManagementInfo::new(slot.clone(), "token-a");
    // far away from the database clock
    let at = Utc::now() - Duration::days(3);

    repo.set(&info).await.unwrap();
    let beat = repo.heartbeat(&info, at).await.unwrap().unwrap();
    assert_eq!(
        beat.last_heartbeat.map(|t| t.timestamp_micros()),
        Some(at.timestamp_micros())
    );
}

#[tokio::test]
#[ignore] // Requires PostgreSQL to be running
async fn test_get_and_update_is_atomic_per_row() {
    let repo = PgJobServiceManagementRepository::new(setup_test_db().await);
    let slot = unique("slot");

    assert!(repo
        .get_and_update(&slot, &|info: JobServiceManagementInfo| info)
        .await
        .unwrap()
        .is_none());

    repo.set(&JobServiceManagementInfo::new(slot.clone(), "first"))
        .await
        .unwrap();
    let updated = repo
        .get_and_update(&slot, &|mut info: JobServiceManagementInfo| {
            info.token = Some("second".to_string());
            info
        })
        .await
        .unwrap()
        .unwrap();
    assert!(updated.is_held_by("second"));
}

#[tokio::test]
#[ignore] // Requires PostgreSQL to be running
async fn test_only_one_lease_manager_owns_the_slot() {
    let pool = setup_test_db().await;
    let repo: Arc<dyn JobServiceManagementRepository> =
        Arc::new(PgJobServiceManagementRepository::new(pool));
    let config = LeaseConfig {
        slot: unique("slot"),
        heartbeat_interval_seconds: 1,
        expiry_seconds: 30,
    };

    let first = InstanceLeaseManager::new(repo.clone(), Arc::new(SystemClock), config.clone());
    let second = InstanceLeaseManager::new(repo.clone(), Arc::new(SystemClock), config);

    assert!(first.try_acquire().await.unwrap());
    assert!(!second.try_acquire().await.unwrap());
    assert!(first.is_owner());
    assert!(!second.is_owner());

    first.release().await.unwrap();
    assert!(second.try_acquire().await.unwrap());
    assert!(second.is_owner());
    second.release().await.unwrap();
}
