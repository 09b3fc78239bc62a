//! Cron-driven scan enqueuer.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::error::ConfigError;
use crate::jobs::{Job, JobQueue, JobType};

/// Parse the scan cron expression.
pub fn parse_schedule(schedule: &str) -> Result<cron::Schedule, ConfigError> {
    cron::Schedule::from_str(schedule).map_err(|e| ConfigError::InvalidValue {
        key: "BOARDROOM_SCAN_CRON".to_string(),
        message: format!("invalid cron: {e}"),
    })
}

/// The first fire time strictly after `after`, if the schedule has one.
pub fn next_fire(schedule: &cron::Schedule, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule.after(&after).next()
}

/// Enqueue a scan for `owner_ref` unless one is already queued or running.
pub async fn enqueue_scan(queue: &JobQueue, owner_ref: &str) -> Option<Job> {
    match queue
        .enqueue_unless_active(JobType::Scan, owner_ref, json!({}))
        .await
    {
        Ok(Some(job)) => Some(job),
        Ok(None) => {
            debug!(owner = owner_ref, "Scan already outstanding, not enqueueing");
            None
        }
        Err(e) => {
            error!(owner = owner_ref, error = %e, "Failed to enqueue scheduled scan");
            None
        }
    }
}

/// Spawn a task that enqueues a scan at every fire time of `schedule`.
///
/// Returns a `JoinHandle` and a shutdown flag, checked at each fire time.
pub fn spawn_scan_scheduler(
    queue: JobQueue,
    schedule: &str,
    owner_ref: String,
) -> Result<(JoinHandle<()>, Arc<AtomicBool>), ConfigError> {
    let cron_schedule = parse_schedule(schedule)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);
    let schedule = schedule.to_string();

    let handle = tokio::spawn(async move {
        info!(schedule = %schedule, owner = %owner_ref, "Scan scheduler started");

        loop {
            let Some(next) = next_fire(&cron_schedule, Utc::now()) else {
                info!("Scan schedule has no further fire times, stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            debug!(next = %next, "Next scheduled scan");
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Scan scheduler shutting down");
                return;
            }

            enqueue_scan(&queue, &owner_ref).await;
        }
    });

    Ok((handle, shutdown_flag))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::jobs::JobStatus;
    use crate::store::{Database, LibSqlBackend};

    #[test]
    fn next_fire_follows_schedule() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 7, 30, 0).unwrap();
        let schedule = parse_schedule("0 0 */6 * * *").unwrap();
        let next = next_fire(&schedule, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn invalid_schedule_is_a_config_error() {
        assert!(matches!(
            parse_schedule("not a cron"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[tokio::test]
    async fn enqueue_scan_keeps_one_outstanding() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let queue = JobQueue::new(db.clone());

        let first = enqueue_scan(&queue, "default").await.unwrap();
        assert!(enqueue_scan(&queue, "default").await.is_none());
        assert!(enqueue_scan(&queue, "other").await.is_some());

        // Once the scan is running it still blocks a second one.
        let claimed = db.claim_next(JobType::Scan).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert!(enqueue_scan(&queue, "default").await.is_none());

        db.fail_job(first.id, crate::jobs::ErrorKind::Unknown, "x")
            .await
            .unwrap();
        let next = enqueue_scan(&queue, "default").await.unwrap();
        assert_eq!(next.status, JobStatus::Queued);
    }

    #[tokio::test]
    async fn scheduler_rejects_bad_cron() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        assert!(spawn_scan_scheduler(JobQueue::new(db), "every tuesday", "default".into()).is_err());
    }

    #[tokio::test]
    async fn scheduler_enqueues_on_fire() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let (handle, shutdown) =
            spawn_scan_scheduler(JobQueue::new(db.clone()), "* * * * * *", "default".into())
                .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        shutdown.store(true, Ordering::Relaxed);
        handle.abort();

        let queued = db.list_jobs(JobStatus::Queued, 10).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].job_type, JobType::Scan);
    }
}
