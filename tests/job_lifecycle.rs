//! Queue and runner behaviour against a real libSQL store.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{Value, json};

use boardroom::error::{Error, LlmError};
use boardroom::jobs::{
    Checkpoints, ErrorKind, Job, JobQueue, JobStatus, JobType, Phase, PhaseContext, PhaseOutput,
    PhaseRunner, Pipeline,
};
use boardroom::llm::{GenerationRequest, GenerationResponse, LlmProvider};
use boardroom::store::{Database, LibSqlBackend};

struct CountingLlm {
    calls: AtomicUsize,
}

#[async_trait]
impl LlmProvider for CountingLlm {
    fn model_name(&self) -> &str {
        "counting"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GenerationResponse {
            text: format!("out({})", request.prompt),
            input_tokens: 1,
            output_tokens: 1,
        })
    }
}

/// Phase that can be told to fail with a rate limit on its next run.
struct FlakyPhase {
    name: &'static str,
    fail_next: Arc<AtomicBool>,
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Phase for FlakyPhase {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(LlmError::RateLimited {
                provider: "test".to_string(),
                retry_after: None,
            }
            .into());
        }
        let prior: Vec<&str> = ctx.checkpoints.iter().map(|c| c.artifact.as_str()).collect();
        let response = ctx
            .llm
            .generate(GenerationRequest::new("", format!("{}:{}", self.name, prior.join("|")), 64))
            .await?;
        Ok(response.into())
    }
}

struct ThreePhase {
    phases: Vec<Box<dyn Phase>>,
}

#[async_trait]
impl Pipeline for ThreePhase {
    fn job_type(&self) -> JobType {
        JobType::IdeaGeneration
    }

    fn phases(&self) -> &[Box<dyn Phase>] {
        &self.phases
    }

    async fn project(&self, _job: &Job, checkpoints: &Checkpoints) -> Result<Value, Error> {
        Ok(json!({ "phases": checkpoints.phases().collect::<Vec<_>>() }))
    }
}

fn three_phase(fail_second: &Arc<AtomicBool>, runs: &[Arc<AtomicUsize>; 3]) -> ThreePhase {
    let names = ["one", "two", "three"];
    ThreePhase {
        phases: names
            .into_iter()
            .zip(runs)
            .map(|(name, runs)| {
                Box::new(FlakyPhase {
                    name,
                    fail_next: if name == "two" {
                        fail_second.clone()
                    } else {
                        Arc::new(AtomicBool::new(false))
                    },
                    runs: runs.clone(),
                }) as Box<dyn Phase>
            })
            .collect(),
    }
}

async fn memory_db() -> Arc<dyn Database> {
    Arc::new(LibSqlBackend::new_memory().await.unwrap())
}

#[tokio::test]
async fn requeued_job_resumes_after_last_checkpoint() {
    let db = memory_db().await;
    let queue = JobQueue::new(db.clone());
    let runner = PhaseRunner::new(db.clone());
    let llm = CountingLlm {
        calls: AtomicUsize::new(0),
    };
    let fail_second = Arc::new(AtomicBool::new(true));
    let runs = [
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
    ];
    let pipeline = three_phase(&fail_second, &runs);

    let job = queue
        .enqueue(JobType::IdeaGeneration, "acme", json!({}))
        .await
        .unwrap();

    // First attempt: phase one checkpoints, phase two hits a rate limit.
    let claimed = queue.claim_next(JobType::IdeaGeneration).await.unwrap().unwrap();
    let err = runner.run(&pipeline, &claimed, &llm).await.unwrap_err();
    assert_eq!(boardroom::jobs::classify(&err), ErrorKind::Transient);
    db.fail_job(job.id, ErrorKind::Transient, "transient: rate limited")
        .await
        .unwrap();

    let failed = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Error);
    assert_eq!(failed.checkpoints.phases().collect::<Vec<_>>(), vec!["one"]);

    // Operator re-queues; the second attempt skips phase one.
    assert!(queue.requeue(job.id).await.unwrap());
    let claimed = queue.claim_next(JobType::IdeaGeneration).await.unwrap().unwrap();
    assert_eq!(claimed.attempts, 2);
    let outcome = runner.run(&pipeline, &claimed, &llm).await.unwrap();

    assert_eq!(outcome.skipped, vec!["one"]);
    assert_eq!(outcome.executed, vec!["two", "three"]);
    assert_eq!(runs[0].load(Ordering::SeqCst), 1);
    assert_eq!(runs[1].load(Ordering::SeqCst), 2);
    assert_eq!(runs[2].load(Ordering::SeqCst), 1);
    assert_eq!(llm.calls.load(Ordering::SeqCst), 3);

    let done = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Complete);
    assert_eq!(done.projection.unwrap()["phases"], json!(["one", "two", "three"]));
    // Phase three saw the artifacts of one and two, in order.
    assert_eq!(
        done.checkpoints.get("three"),
        Some("out(three:out(one:)|out(two:out(one:)))")
    );
}

#[tokio::test]
async fn concurrent_claimers_never_share_a_job() {
    let db = memory_db().await;
    let queue = JobQueue::new(db.clone());
    for i in 0..5 {
        queue
            .enqueue(JobType::Evaluation, "acme", json!({ "n": i }))
            .await
            .unwrap();
    }

    let claims = join_all((0..8).map(|_| {
        let queue = queue.clone();
        async move { queue.claim_next(JobType::Evaluation).await.unwrap() }
    }))
    .await;

    let claimed: Vec<_> = claims.into_iter().flatten().collect();
    assert_eq!(claimed.len(), 5);
    let distinct: HashSet<_> = claimed.iter().map(|j| j.id).collect();
    assert_eq!(distinct.len(), 5);
    assert!(claimed.iter().all(|j| j.status == JobStatus::Running));
    assert!(queue.list_jobs(JobStatus::Queued, 10).await.unwrap().is_empty());
}

/// Two independently opened backends on one file behave like two worker
/// processes: only SQLite's write lock stands between their claims.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_connections_never_share_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("shared.db");

    let first: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let second: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());

    let queue = JobQueue::new(first.clone());
    for i in 0..40 {
        queue
            .enqueue(JobType::Evaluation, "acme", json!({ "n": i }))
            .await
            .unwrap();
    }

    let claimers = (0..8).map(|i| {
        let queue = JobQueue::new(if i % 2 == 0 { first.clone() } else { second.clone() });
        tokio::spawn(async move {
            let mut mine = Vec::new();
            while let Some(job) = queue.claim_next(JobType::Evaluation).await.unwrap() {
                mine.push(job.id);
            }
            mine
        })
    });

    let claimed: Vec<_> = join_all(claimers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();
    let distinct: HashSet<_> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), 40);
    assert_eq!(distinct.len(), 40);
    assert!(queue.list_jobs(JobStatus::Queued, 50).await.unwrap().is_empty());
}

#[tokio::test]
async fn terminal_jobs_stay_terminal() {
    let db = memory_db().await;
    let queue = JobQueue::new(db.clone());
    let runner = PhaseRunner::new(db.clone());
    let llm = CountingLlm {
        calls: AtomicUsize::new(0),
    };
    let runs = [
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
        Arc::new(AtomicUsize::new(0)),
    ];
    let pipeline = three_phase(&Arc::new(AtomicBool::new(false)), &runs);

    let job = queue
        .enqueue(JobType::IdeaGeneration, "acme", json!({}))
        .await
        .unwrap();
    let claimed = queue.claim_next(JobType::IdeaGeneration).await.unwrap().unwrap();
    runner.run(&pipeline, &claimed, &llm).await.unwrap();

    assert!(!db.fail_job(job.id, ErrorKind::Unknown, "late failure").await.unwrap());
    assert!(!queue.requeue(job.id).await.unwrap());
    assert!(
        db.append_checkpoint(job.id, "four", "late artifact")
            .await
            .is_err()
    );
    // A stale copy of the running job cannot be run again.
    assert!(runner.run(&pipeline, &claimed, &llm).await.is_err());

    let stored = queue.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status, JobStatus::Complete);
    assert_eq!(stored.checkpoints.len(), 3);
    assert!(stored.error_message.is_none());
}

#[tokio::test]
async fn file_backed_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("boardroom.db");

    let job_id = {
        let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
        let queue = JobQueue::new(db.clone());
        let job = queue
            .enqueue(JobType::CommitteeBuild, "acme", json!({"company": "Acme"}))
            .await
            .unwrap();
        queue.claim_next(JobType::CommitteeBuild).await.unwrap().unwrap();
        db.append_checkpoint(job.id, "research", "notes").await.unwrap();
        job.id
    };

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&path).await.unwrap());
    let job = db.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.checkpoints.get("research"), Some("notes"));
}
