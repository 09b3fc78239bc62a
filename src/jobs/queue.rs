//! Queue operations over the job store.

use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{DatabaseError, Error, JobError};
use crate::jobs::{Job, JobStatus, JobType};
use crate::store::Database;

/// Thin handle for producers and operators of the job queue.
#[derive(Clone)]
pub struct JobQueue {
    db: Arc<dyn Database>,
}

impl JobQueue {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Create a `queued` job.
    pub async fn enqueue(
        &self,
        job_type: JobType,
        owner_ref: &str,
        input: Value,
    ) -> Result<Job, DatabaseError> {
        let job = Job::new(job_type, owner_ref, input);
        self.db.insert_job(&job).await?;
        info!(job_id = %job.id, job_type = %job_type, owner = owner_ref, "Job enqueued");
        Ok(job)
    }

    /// Create a `queued` job unless the owner already has one of this type
    /// queued or running.
    pub async fn enqueue_unless_active(
        &self,
        job_type: JobType,
        owner_ref: &str,
        input: Value,
    ) -> Result<Option<Job>, DatabaseError> {
        let job = Job::new(job_type, owner_ref, input);
        if self.db.insert_job_unless_active(&job).await? {
            info!(job_id = %job.id, job_type = %job_type, owner = owner_ref, "Job enqueued");
            Ok(Some(job))
        } else {
            Ok(None)
        }
    }

    pub async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, DatabaseError> {
        self.db.claim_next(job_type).await
    }

    /// Operator re-queue of a failed or stalled job. Checkpoints are kept, so
    /// the next run resumes at the first missing phase.
    ///
    /// Returns `false` when the job is `queued` or `complete`.
    pub async fn requeue(&self, id: Uuid) -> Result<bool, Error> {
        let job = self
            .db
            .get_job(id)
            .await?
            .ok_or(JobError::NotFound { id })?;

        if !job.status.can_requeue() {
            warn!(job_id = %id, status = %job.status, "Refusing to re-queue job");
            return Ok(false);
        }

        let requeued = self.db.requeue_job(id).await?;
        if requeued {
            info!(
                job_id = %id,
                from = %job.status,
                checkpoints = job.checkpoints.len(),
                "Job re-queued"
            );
        }
        Ok(requeued)
    }

    pub async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        self.db.get_job(id).await
    }

    pub async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        self.db.list_jobs(status, limit).await
    }
}
