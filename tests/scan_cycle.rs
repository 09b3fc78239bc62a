//! Scan jobs end to end: feed → poller → movement cycle.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::{Value, json};

use boardroom::config::{DedupConfig, LifecycleConfig, ScanConfig, WorkerConfig};
use boardroom::error::{Error, LlmError};
use boardroom::jobs::{JobOutcome, JobQueue, JobStatus, JobType, Poller};
use boardroom::llm::{GenerationRequest, GenerationResponse, LlmProvider, ProviderFactory};
use boardroom::movements::{EvidenceFeed, FeedItem, Stage};
use boardroom::pipelines::PipelineRegistry;
use boardroom::store::{Credential, Database, LibSqlBackend};

/// Feed whose items can be swapped between scans.
#[derive(Default)]
struct SwappableFeed {
    items: Mutex<Vec<FeedItem>>,
}

impl SwappableFeed {
    fn set(&self, items: Vec<FeedItem>) {
        *self.items.lock().unwrap() = items;
    }
}

#[async_trait]
impl EvidenceFeed for SwappableFeed {
    async fn fetch_all_signals(&self) -> Result<Vec<FeedItem>, Error> {
        Ok(self.items.lock().unwrap().clone())
    }
}

/// Scripted scanner model: everything is relevant, and all relevant signals
/// form a single "Repair cafes" movement whose momentum rises each scan.
struct ScannerLlm {
    profile_calls: AtomicUsize,
    match_calls: AtomicUsize,
}

fn json_after<'a>(prompt: &'a str, marker: &str) -> &'a str {
    let start = prompt.find(marker).map_or(0, |i| i + marker.len());
    let rest = &prompt[start..];
    rest.split("\n\n").next().unwrap_or(rest)
}

#[async_trait]
impl LlmProvider for ScannerLlm {
    fn model_name(&self) -> &str {
        "scanner"
    }

    async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
        let text = if request.prompt.starts_with("Signals (JSON):") {
            let signals: Vec<Value> = serde_json::from_str(json_after(&request.prompt, ":\n"))?;
            let out: Vec<Value> = signals
                .iter()
                .map(|s| json!({"signal_id": s["id"], "topic": "repair", "relevant": true}))
                .collect();
            serde_json::to_string(&out)?
        } else if request.prompt.starts_with("Relevant signals (JSON):") {
            let n = self.profile_calls.fetch_add(1, Ordering::SeqCst);
            let signals: Vec<Value> = serde_json::from_str(json_after(&request.prompt, ":\n"))?;
            let ids: Vec<Value> = signals.iter().map(|s| s["id"].clone()).collect();
            format!(
                "```json\n{}\n```",
                json!([{
                    "name": if n == 0 { "Repair cafes" } else { "repair-cafes" },
                    "summary": "Neighbourhood repair events",
                    "momentum_score": if n == 0 { 25 } else { 45 },
                    "signal_ids": ids,
                }])
            )
        } else {
            self.match_calls.fetch_add(1, Ordering::SeqCst);
            "[]".to_string()
        };

        Ok(GenerationResponse {
            text,
            input_tokens: 5,
            output_tokens: 5,
        })
    }
}

struct ScannerFactory {
    llm: Arc<ScannerLlm>,
}

impl ProviderFactory for ScannerFactory {
    fn for_credential(&self, _c: &Credential) -> Result<Arc<dyn LlmProvider>, LlmError> {
        Ok(self.llm.clone())
    }
}

fn item(source: &str, id: &str) -> FeedItem {
    FeedItem {
        source: source.to_string(),
        source_id: id.to_string(),
        title: format!("{source} post {id}"),
        content: "A repair cafe opened downtown.".to_string(),
        url: None,
        metadata: Value::Null,
    }
}

struct Harness {
    db: Arc<dyn Database>,
    feed: Arc<SwappableFeed>,
    llm: Arc<ScannerLlm>,
    poller: Poller,
    queue: JobQueue,
}

async fn harness() -> Harness {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.upsert_credential("default", &SecretString::from("sk-test"))
        .await
        .unwrap();

    let feed = Arc::new(SwappableFeed::default());
    let llm = Arc::new(ScannerLlm {
        profile_calls: AtomicUsize::new(0),
        match_calls: AtomicUsize::new(0),
    });
    let registry = PipelineRegistry::standard(
        db.clone(),
        feed.clone(),
        &ScanConfig {
            classify_chunk_size: 2,
            ..ScanConfig::default()
        },
        &LifecycleConfig::default(),
        &DedupConfig::default(),
    );
    let poller = Poller::new(
        db.clone(),
        registry,
        Arc::new(ScannerFactory { llm: llm.clone() }),
        WorkerConfig {
            job_types: vec![JobType::Scan],
            ..WorkerConfig::default()
        },
    );

    Harness {
        queue: JobQueue::new(db.clone()),
        db,
        feed,
        llm,
        poller,
    }
}

impl Harness {
    async fn scan(&self) -> Value {
        let job = self
            .queue
            .enqueue_unless_active(JobType::Scan, "default", json!({}))
            .await
            .unwrap()
            .expect("no scan outstanding");
        let processed = self.poller.run_once().await.unwrap();
        assert_eq!(processed.len(), 1);
        assert!(
            matches!(processed[0].outcome, JobOutcome::Completed { .. }),
            "{:?}",
            processed[0].outcome
        );
        let stored = self.db.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Complete);
        stored.projection.unwrap()
    }
}

#[tokio::test]
async fn scans_create_then_grow_a_movement() {
    let h = harness().await;

    h.feed.set(vec![item("reddit", "1"), item("hn", "2"), item("reddit", "3")]);
    let first = h.scan().await;

    let created = first["created"].as_array().unwrap();
    assert_eq!(created.len(), 1);
    assert_eq!(first["signals_linked"], 3);
    // No tracked movements yet, so no match call.
    assert_eq!(h.llm.match_calls.load(Ordering::SeqCst), 0);

    let movements = h.db.list_active_movements().await.unwrap();
    assert_eq!(movements.len(), 1);
    let movement = &movements[0];
    assert_eq!(movement.stage, Stage::Verified);
    assert_eq!(movement.momentum_score, 25);

    // Second scan: one new item; the profile name normalises to the same
    // movement, so it is matched rather than duplicated.
    h.feed.set(vec![item("reddit", "1"), item("hn", "2"), item("reddit", "3"), item("mastodon", "4")]);
    let second = h.scan().await;

    assert!(second["created"].as_array().unwrap().is_empty());
    assert_eq!(second["matched"], json!([movement.id]));
    assert_eq!(second["signals_linked"], 1);
    assert_eq!(second["transitions"][0]["to"], "growing");
    assert_eq!(h.llm.match_calls.load(Ordering::SeqCst), 1);

    let updated = h.db.get_movement(movement.id).await.unwrap().unwrap();
    assert_eq!(updated.stage, Stage::Growing);
    assert_eq!(updated.momentum_score, 45);
    assert_eq!(h.db.signals_for_movement(movement.id).await.unwrap().len(), 4);
}

#[tokio::test]
async fn scan_with_nothing_new_makes_no_model_calls() {
    let h = harness().await;
    let report = h.scan().await;

    assert!(report["created"].as_array().unwrap().is_empty());
    assert_eq!(h.llm.profile_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.db.usage_for_owner("default").await.unwrap().calls, 0);
}

#[tokio::test]
async fn only_one_scan_outstanding_per_owner() {
    let h = harness().await;
    assert!(
        h.queue
            .enqueue_unless_active(JobType::Scan, "default", json!({}))
            .await
            .unwrap()
            .is_some()
    );
    assert!(
        h.queue
            .enqueue_unless_active(JobType::Scan, "default", json!({}))
            .await
            .unwrap()
            .is_none()
    );
}
