//! Generic ordered-phase executor.
//!
//! A [`Pipeline`] is an ordered list of [`Phase`]s plus a projection. The
//! [`PhaseRunner`] walks the phases in order, skipping every phase that
//! already has a checkpoint and durably appending the artifact of each phase
//! it executes before moving on. A run interrupted between any two phases
//! resumes at the first missing checkpoint.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, JobError, LlmError};
use crate::jobs::{Checkpoint, Checkpoints, Job, JobStatus, JobType};
use crate::llm::{GenerationRequest, GenerationResponse, LlmProvider};
use crate::store::{CheckpointWrite, Database, UsageRecord};

/// What a phase produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseOutput {
    pub artifact: String,
}

impl PhaseOutput {
    pub fn new(artifact: impl Into<String>) -> Self {
        Self {
            artifact: artifact.into(),
        }
    }
}

impl From<GenerationResponse> for PhaseOutput {
    fn from(response: GenerationResponse) -> Self {
        Self::new(response.text)
    }
}

/// One provider call made while a phase ran.
struct MeteredCall {
    input_tokens: u32,
    output_tokens: u32,
    text: String,
}

/// Wraps the job's provider for the length of one phase and remembers every
/// call, so usage is charged whether or not the phase succeeds.
struct MeteredProvider<'a> {
    inner: &'a dyn LlmProvider,
    calls: Mutex<Vec<MeteredCall>>,
}

impl<'a> MeteredProvider<'a> {
    fn new(inner: &'a dyn LlmProvider) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
        }
    }

    async fn take(&self) -> Vec<MeteredCall> {
        std::mem::take(&mut *self.calls.lock().await)
    }
}

#[async_trait]
impl LlmProvider for MeteredProvider<'_> {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let response = self.inner.generate(request).await?;
        self.calls.lock().await.push(MeteredCall {
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            text: response.text.clone(),
        });
        Ok(response)
    }
}

/// Everything a phase may read.
pub struct PhaseContext<'a> {
    pub job: &'a Job,
    pub phase: &'a str,
    /// Artifacts of the phases before this one.
    pub checkpoints: &'a Checkpoints,
    pub llm: &'a dyn LlmProvider,
}

impl PhaseContext<'_> {
    /// Artifact of an earlier phase.
    pub fn artifact(&self, phase: &str) -> Result<&str, Error> {
        self.checkpoints.get(phase).ok_or_else(|| {
            JobError::MissingCheckpoint {
                id: self.job.id,
                phase: self.phase.to_string(),
                missing: phase.to_string(),
            }
            .into()
        })
    }
}

/// One step of a pipeline.
#[async_trait]
pub trait Phase: Send + Sync {
    /// Checkpoint key. Unique within a pipeline.
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error>;
}

/// An ordered list of phases and the projection built from their artifacts.
#[async_trait]
pub trait Pipeline: Send + Sync {
    fn job_type(&self) -> JobType;

    fn phases(&self) -> &[Box<dyn Phase>];

    /// Reject a job whose input cannot be run, before any phase executes.
    fn validate(&self, _job: &Job) -> Result<(), Error> {
        Ok(())
    }

    /// Build the structured record stored with the `complete` transition.
    async fn project(&self, job: &Job, checkpoints: &Checkpoints) -> Result<Value, Error>;
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub projection: Value,
}

/// Executes pipelines against claimed jobs.
#[derive(Clone)]
pub struct PhaseRunner {
    db: Arc<dyn Database>,
}

impl PhaseRunner {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// One usage row per provider call, charged to the job owner.
    async fn charge(&self, job: &Job, phase: &str, calls: &[MeteredCall]) -> Result<(), Error> {
        for call in calls {
            self.db
                .record_usage(&UsageRecord {
                    job_id: job.id,
                    owner_ref: job.owner_ref.clone(),
                    phase: phase.to_string(),
                    input_tokens: call.input_tokens,
                    output_tokens: call.output_tokens,
                })
                .await?;
        }
        Ok(())
    }

    /// Store the last response of a phase that rejected it. Never a checkpoint.
    async fn keep_rejected(&self, job: &Job, phase: &str, calls: &[MeteredCall]) {
        let Some(last) = calls.last() else {
            return;
        };
        if let Err(e) = self
            .db
            .record_rejected_output(job.id, phase, &last.text)
            .await
        {
            warn!(job_id = %job.id, phase, error = %e, "Failed to keep rejected output");
        }
    }

    /// Run every phase that has no checkpoint yet, then project and complete.
    ///
    /// Any phase error aborts the run immediately; the caller classifies it
    /// and marks the job failed. Checkpoints written so far are kept.
    pub async fn run(
        &self,
        pipeline: &dyn Pipeline,
        job: &Job,
        llm: &dyn LlmProvider,
    ) -> Result<RunOutcome, Error> {
        if job.status != JobStatus::Running {
            return Err(JobError::NotRunning {
                id: job.id,
                status: job.status.to_string(),
            }
            .into());
        }
        pipeline.validate(job)?;

        let mut checkpoints = job.checkpoints.clone();
        let mut executed = Vec::new();
        let mut skipped = Vec::new();

        for phase in pipeline.phases() {
            let name = phase.name();
            if checkpoints.contains(name) {
                debug!(job_id = %job.id, phase = name, "Checkpoint present, skipping phase");
                skipped.push(name.to_string());
                continue;
            }

            self.db.set_current_phase(job.id, name).await?;
            info!(job_id = %job.id, job_type = %job.job_type, phase = name, "Phase started");
            let started = Instant::now();

            let metered = MeteredProvider::new(llm);
            let result = {
                let ctx = PhaseContext {
                    job,
                    phase: name,
                    checkpoints: &checkpoints,
                    llm: &metered,
                };
                phase.run(&ctx).await
            };
            let calls = metered.take().await;

            let output = match result {
                Ok(output) => {
                    self.charge(job, name, &calls).await?;
                    output
                }
                Err(e) => {
                    if let Err(charge_err) = self.charge(job, name, &calls).await {
                        warn!(job_id = %job.id, phase = name, error = %charge_err, "Failed to record usage of failed phase");
                    }
                    if matches!(e, Error::Parse(_)) {
                        self.keep_rejected(job, name, &calls).await;
                    }
                    return Err(e);
                }
            };

            match self
                .db
                .append_checkpoint(job.id, name, &output.artifact)
                .await?
            {
                CheckpointWrite::Written => {
                    checkpoints.insert(Checkpoint {
                        phase: name.to_string(),
                        artifact: output.artifact,
                        written_at: Utc::now(),
                    });
                }
                CheckpointWrite::AlreadyPresent => {
                    // Another run got there first; continue from what it stored.
                    warn!(job_id = %job.id, phase = name, "Phase artifact already stored, using stored copy");
                    checkpoints = self
                        .db
                        .get_job(job.id)
                        .await?
                        .ok_or(JobError::NotFound { id: job.id })?
                        .checkpoints;
                }
            }

            info!(
                job_id = %job.id,
                phase = name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Phase finished"
            );
            executed.push(name.to_string());
        }

        let projection = pipeline.project(job, &checkpoints).await?;
        if !self.db.complete_job(job.id, &projection).await? {
            let status = self
                .db
                .get_job(job.id)
                .await?
                .map(|j| j.status.to_string())
                .unwrap_or_else(|| "missing".to_string());
            return Err(JobError::NotRunning { id: job.id, status }.into());
        }

        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            executed = executed.len(),
            skipped = skipped.len(),
            "Job complete"
        );
        Ok(RunOutcome {
            executed,
            skipped,
            projection,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::{LlmError, ParseError};
    use crate::jobs::ErrorKind;
    use crate::llm::GenerationRequest;
    use crate::store::LibSqlBackend;

    /// Provider that answers with the prompt, counting calls.
    struct EchoLlm {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for EchoLlm {
        fn model_name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(GenerationResponse {
                text: request.prompt,
                input_tokens: 10,
                output_tokens: 5,
            })
        }
    }

    /// Phase that echoes its name plus the previous artifact through the LLM.
    struct EchoPhase {
        name: &'static str,
        previous: Option<&'static str>,
        runs: Arc<Mutex<Vec<&'static str>>>,
        fail: bool,
    }

    #[async_trait]
    impl Phase for EchoPhase {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error> {
            self.runs.lock().unwrap().push(self.name);
            if self.fail {
                return Err(ParseError::MissingJson {
                    context: self.name.to_string(),
                }
                .into());
            }
            let prior = match self.previous {
                Some(p) => ctx.artifact(p)?.to_string(),
                None => String::new(),
            };
            let response = ctx
                .llm
                .generate(GenerationRequest::new("", format!("{prior}{}", self.name), 100))
                .await?;
            Ok(response.into())
        }
    }

    struct TestPipeline {
        phases: Vec<Box<dyn Phase>>,
    }

    #[async_trait]
    impl Pipeline for TestPipeline {
        fn job_type(&self) -> JobType {
            JobType::Evaluation
        }

        fn phases(&self) -> &[Box<dyn Phase>] {
            &self.phases
        }

        async fn project(&self, _job: &Job, checkpoints: &Checkpoints) -> Result<Value, Error> {
            Ok(json!({ "final": checkpoints.get("c") }))
        }
    }

    fn pipeline(runs: &Arc<Mutex<Vec<&'static str>>>, failing: Option<&str>) -> TestPipeline {
        let layout = [("a", None), ("b", Some("a")), ("c", Some("b"))];
        TestPipeline {
            phases: layout
                .into_iter()
                .map(|(name, previous)| {
                    Box::new(EchoPhase {
                        name,
                        previous,
                        runs: Arc::clone(runs),
                        fail: failing == Some(name),
                    }) as Box<dyn Phase>
                })
                .collect(),
        }
    }

    async fn claimed_job(db: &Arc<dyn Database>) -> Job {
        db.insert_job(&Job::new(JobType::Evaluation, "acme", json!({})))
            .await
            .unwrap();
        db.claim_next(JobType::Evaluation).await.unwrap().unwrap()
    }

    fn echo() -> EchoLlm {
        EchoLlm {
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn runs_all_phases_and_completes() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runs = Arc::new(Mutex::new(Vec::new()));
        let llm = echo();
        let job = claimed_job(&db).await;

        let outcome = PhaseRunner::new(Arc::clone(&db))
            .run(&pipeline(&runs, None), &job, &llm)
            .await
            .unwrap();

        assert_eq!(outcome.executed, vec!["a", "b", "c"]);
        assert!(outcome.skipped.is_empty());
        assert_eq!(outcome.projection, json!({"final": "abc"}));

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        assert_eq!(stored.current_phase.as_deref(), Some("c"));
        assert_eq!(stored.checkpoints.len(), 3);

        let usage = db.usage_for_owner("acme").await.unwrap();
        assert_eq!(usage.calls, 3);
        assert_eq!(usage.input_tokens, 30);
    }

    #[tokio::test]
    async fn failed_phase_keeps_earlier_checkpoints_and_resume_skips_them() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runs = Arc::new(Mutex::new(Vec::new()));
        let llm = echo();
        let runner = PhaseRunner::new(Arc::clone(&db));
        let job = claimed_job(&db).await;

        let err = runner
            .run(&pipeline(&runs, Some("c")), &job, &llm)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        db.fail_job(job.id, ErrorKind::MalformedOutput, "x").await.unwrap();

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert_eq!(stored.checkpoints.phases().collect::<Vec<_>>(), vec!["a", "b"]);

        db.requeue_job(job.id).await.unwrap();
        let resumed = db.claim_next(JobType::Evaluation).await.unwrap().unwrap();
        runs.lock().unwrap().clear();
        let calls_before = llm.calls.load(Ordering::SeqCst);

        let outcome = runner
            .run(&pipeline(&runs, None), &resumed, &llm)
            .await
            .unwrap();

        assert_eq!(*runs.lock().unwrap(), vec!["c"]);
        assert_eq!(llm.calls.load(Ordering::SeqCst), calls_before + 1);
        assert_eq!(outcome.skipped, vec!["a", "b"]);
        assert_eq!(outcome.projection, json!({"final": "abc"}));
    }

    #[tokio::test]
    async fn fully_checkpointed_job_makes_no_calls() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runs = Arc::new(Mutex::new(Vec::new()));
        let llm = echo();
        let job = claimed_job(&db).await;
        for (phase, artifact) in [("a", "a"), ("b", "ab"), ("c", "abc")] {
            db.append_checkpoint(job.id, phase, artifact).await.unwrap();
        }
        let job = db.get_job(job.id).await.unwrap().unwrap();

        let outcome = PhaseRunner::new(Arc::clone(&db))
            .run(&pipeline(&runs, None), &job, &llm)
            .await
            .unwrap();

        assert!(outcome.executed.is_empty());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(outcome.projection, json!({"final": "abc"}));
    }

    #[tokio::test]
    async fn refuses_jobs_that_are_not_running() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runs = Arc::new(Mutex::new(Vec::new()));
        let job = Job::new(JobType::Evaluation, "acme", json!({}));
        db.insert_job(&job).await.unwrap();

        let err = PhaseRunner::new(Arc::clone(&db))
            .run(&pipeline(&runs, None), &job, &echo())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::NotRunning { .. })));
        assert!(runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn job_finished_elsewhere_is_not_overwritten() {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        let runs = Arc::new(Mutex::new(Vec::new()));
        let job = claimed_job(&db).await;
        db.fail_job(job.id, ErrorKind::Unknown, "operator stop").await.unwrap();

        // The in-memory copy still says running; the store refuses the first write.
        let err = PhaseRunner::new(Arc::clone(&db))
            .run(&pipeline(&runs, None), &job, &echo())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Database(_)));

        let stored = db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Error);
        assert!(stored.checkpoints.is_empty());
    }
}
