//! The worker loop: claim → run → complete or fail.
//!
//! Each round visits the configured job types in order and claims at most one
//! job of each. A round that found nothing sleeps for the poll interval plus a
//! random jitter. There is no retry inside a round; a failed job stays in
//! `error` until an operator re-queues it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::error::{Error, JobError};
use crate::jobs::{ErrorKind, Job, JobType, PhaseRunner, classify, failure_message};
use crate::llm::{LlmProvider, ProviderFactory};
use crate::pipelines::PipelineRegistry;
use crate::store::Database;

/// How a claimed job ended.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JobOutcome {
    Completed {
        executed: Vec<String>,
        skipped: Vec<String>,
    },
    Failed {
        kind: ErrorKind,
        message: String,
    },
}

/// One job handled by a poll round.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Processed {
    pub job_id: Uuid,
    pub job_type: JobType,
    #[serde(flatten)]
    pub outcome: JobOutcome,
}

pub struct Poller {
    db: Arc<dyn Database>,
    runner: PhaseRunner,
    registry: PipelineRegistry,
    providers: Arc<dyn ProviderFactory>,
    config: WorkerConfig,
    shutdown: Arc<AtomicBool>,
}

impl Poller {
    pub fn new(
        db: Arc<dyn Database>,
        registry: PipelineRegistry,
        providers: Arc<dyn ProviderFactory>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            runner: PhaseRunner::new(db.clone()),
            db,
            registry,
            providers,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set the returned flag to stop the loop after the current job.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Job types this worker claims: configured and registered.
    pub fn job_types(&self) -> Vec<JobType> {
        let registered = self.registry.job_types();
        self.config
            .job_types
            .iter()
            .copied()
            .filter(|t| registered.contains(t))
            .collect()
    }

    /// One poll round. Claim errors abort the round; job failures do not.
    pub async fn run_once(&self) -> Result<Vec<Processed>, Error> {
        let mut processed = Vec::new();
        for job_type in self.job_types() {
            if self.is_shutdown_requested() {
                break;
            }
            let Some(job) = self.db.claim_next(job_type).await? else {
                continue;
            };
            info!(
                job_id = %job.id,
                job_type = %job.job_type,
                owner = %job.owner_ref,
                attempt = job.attempts,
                resume_from = job.checkpoints.len(),
                "Job claimed"
            );
            processed.push(self.process(job).await);
        }
        Ok(processed)
    }

    /// Poll until shutdown is requested.
    pub async fn run(self) {
        info!(
            job_types = ?self.job_types(),
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Job poller started"
        );

        loop {
            if self.is_shutdown_requested() {
                info!("Job poller shutting down");
                return;
            }

            match self.run_once().await {
                Ok(processed) if !processed.is_empty() => {
                    debug!(count = processed.len(), "Poll round processed jobs");
                    continue;
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Poll round failed"),
            }

            tokio::time::sleep(self.idle_delay()).await;
        }
    }

    /// Spawn [`Poller::run`] on the runtime.
    ///
    /// Returns a `JoinHandle` and the shutdown flag.
    pub fn spawn(self) -> (JoinHandle<()>, Arc<AtomicBool>) {
        let shutdown = self.shutdown_handle();
        let handle = tokio::spawn(self.run());
        (handle, shutdown)
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = self.config.poll_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.config.poll_interval + Duration::from_millis(jitter)
    }

    async fn process(&self, job: Job) -> Processed {
        let job_id = job.id;
        let job_type = job.job_type;

        let outcome = match self.execute(&job).await {
            Ok((executed, skipped)) => JobOutcome::Completed { executed, skipped },
            Err(e) => self.record_failure(&job, &e).await,
        };

        Processed {
            job_id,
            job_type,
            outcome,
        }
    }

    async fn execute(&self, job: &Job) -> Result<(Vec<String>, Vec<String>), Error> {
        let pipeline = self
            .registry
            .get(job.job_type)
            .ok_or_else(|| JobError::UnknownJobType {
                job_type: job.job_type.to_string(),
            })?;
        let llm = self.provider_for(&job.owner_ref).await?;

        let outcome = self.runner.run(pipeline.as_ref(), job, llm.as_ref()).await?;
        Ok((outcome.executed, outcome.skipped))
    }

    /// A provider bound to the owner's credential.
    async fn provider_for(&self, owner_ref: &str) -> Result<Arc<dyn LlmProvider>, Error> {
        let credential = self.db.get_credential(owner_ref).await?.ok_or_else(|| {
            JobError::MissingCredential {
                owner_ref: owner_ref.to_string(),
            }
        })?;

        if !credential.is_valid() {
            return Err(JobError::CredentialInvalid {
                owner_ref: owner_ref.to_string(),
                reason: credential.invalid_reason.unwrap_or_default(),
            }
            .into());
        }

        Ok(self.providers.for_credential(&credential)?)
    }

    /// Classify, persist and log a failed run.
    async fn record_failure(&self, job: &Job, error: &Error) -> JobOutcome {
        let kind = classify(error);
        let message = failure_message(kind, error);

        match kind {
            ErrorKind::Auth => {
                warn!(job_id = %job.id, owner = %job.owner_ref, error = %error, "Job failed: credential rejected");
                if let Err(e) = self
                    .db
                    .invalidate_credential(&job.owner_ref, &error.to_string())
                    .await
                {
                    error!(owner = %job.owner_ref, error = %e, "Failed to flag credential invalid");
                }
            }
            ErrorKind::Transient => {
                warn!(job_id = %job.id, error = %error, "Job failed transiently; safe to re-queue");
            }
            ErrorKind::MalformedOutput => {
                warn!(job_id = %job.id, job_type = %job.job_type, error = %error, "Job failed: malformed output");
            }
            ErrorKind::Unknown => {
                error!(job_id = %job.id, job_type = %job.job_type, error = ?error, "Job failed");
            }
        }

        match self.db.fail_job(job.id, kind, &message).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(job_id = %job.id, "Job was no longer running; failure not recorded");
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
            }
        }

        JobOutcome::Failed { kind, message }
    }
}
