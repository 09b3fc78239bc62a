//! `scan`: turn fresh evidence into movement updates.
//!
//! ingest → classify → profile → match, then the projection runs one
//! [`MovementCycle`] over the profiles and match proposals. Every artifact is
//! canonical JSON so a resumed run reads exactly what the earlier run decided.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{DedupConfig, LifecycleConfig, ScanConfig};
use crate::error::{Error, ParseError};
use crate::jobs::{Checkpoints, Job, JobType, Phase, PhaseContext, PhaseOutput, Pipeline};
use crate::llm::GenerationRequest;
use crate::movements::{
    EvidenceFeed, MatchProposal, MovementCycle, MovementProfile, Signal,
};
use crate::pipelines::parse::extract_json_as;
use crate::store::Database;

const SNIPPET_CHARS: usize = 280;

const CLASSIFY_SYSTEM: &str = "You triage evidence for a cultural trend scanner. For each \
    signal decide whether it is evidence of an emerging social, consumer or cultural movement. \
    Respond with a JSON array of objects with \"signal_id\", \"topic\" (two to five words) and \
    \"relevant\" (true or false), one per signal. ONLY output the JSON array.";

const PROFILE_SYSTEM: &str = "You group evidence into movements. Respond with a JSON array of \
    objects with \"name\", \"summary\", \"momentum_score\" (0-100, how fast it is spreading) and \
    \"signal_ids\" (the ids of the signals that evidence it). ONLY output the JSON array.";

const MATCH_SYSTEM: &str = "You deduplicate movements. For each new profile that describes \
    the same movement as a tracked one, output an object with \"profile_index\", \
    \"movement_id\" and \"confidence\" (0.0-1.0). Respond with a JSON array, empty if nothing \
    matches. ONLY output the JSON array.";

/// What the ingest phase records about each new signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDigest {
    pub id: Uuid,
    pub source: String,
    pub title: String,
    pub snippet: String,
}

impl From<&Signal> for SignalDigest {
    fn from(signal: &Signal) -> Self {
        Self {
            id: signal.id,
            source: signal.source.clone(),
            title: signal.title.clone(),
            snippet: signal.content.chars().take(SNIPPET_CHARS).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub signal_id: Uuid,
    #[serde(default)]
    pub topic: String,
    #[serde(default = "default_relevant")]
    pub relevant: bool,
}

fn default_relevant() -> bool {
    true
}

fn to_artifact<T: Serialize>(value: &T, context: &str) -> Result<String, Error> {
    serde_json::to_string(value).map_err(|source| {
        ParseError::InvalidJson {
            context: context.to_string(),
            source,
        }
        .into()
    })
}

fn read_artifact<T: DeserializeOwned>(ctx: &PhaseContext<'_>, phase: &str) -> Result<T, Error> {
    Ok(extract_json_as(ctx.artifact(phase)?, phase)?)
}

/// Pulls the feed and stores every item not seen before, stamped with the
/// scan job. The artifact lists every signal this job stamped, so a re-run
/// after a crash before the checkpoint reproduces it.
struct IngestPhase {
    db: Arc<dyn Database>,
    feed: Arc<dyn EvidenceFeed>,
}

#[async_trait]
impl Phase for IngestPhase {
    fn name(&self) -> &'static str {
        "ingest"
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error> {
        let items = self.feed.fetch_all_signals().await?;
        let fetched = items.len();
        let now = Utc::now();
        let signals: Vec<Signal> = items
            .into_iter()
            .map(|item| Signal::from_feed(item, now))
            .collect();

        let inserted = self.db.insert_signals(&signals, ctx.job.id).await?;
        let stamped = self.db.signals_from_scan(ctx.job.id).await?;
        info!(
            job_id = %ctx.job.id,
            fetched,
            new = inserted.len(),
            total = stamped.len(),
            "Evidence ingested"
        );

        let digests: Vec<SignalDigest> = stamped.iter().map(SignalDigest::from).collect();
        Ok(PhaseOutput::new(to_artifact(&digests, "ingest")?))
    }
}

/// Classifies ingested signals in fixed-size chunks, merged into one artifact.
struct ClassifyPhase {
    chunk_size: usize,
}

#[async_trait]
impl Phase for ClassifyPhase {
    fn name(&self) -> &'static str {
        "classify"
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error> {
        let digests: Vec<SignalDigest> = read_artifact(ctx, "ingest")?;
        let mut merged: Vec<Classification> = Vec::with_capacity(digests.len());

        for (i, chunk) in digests.chunks(self.chunk_size.max(1)).enumerate() {
            let listing = to_artifact(&chunk, "classify")?;
            let request = GenerationRequest::new(
                CLASSIFY_SYSTEM,
                format!("Signals (JSON):\n{listing}"),
                4096,
            );
            let response = ctx.llm.generate(request).await?;

            let known: HashSet<Uuid> = chunk.iter().map(|d| d.id).collect();
            let classified: Vec<Classification> =
                extract_json_as(&response.text, "signal classification")?;
            merged.extend(classified.into_iter().filter(|c| known.contains(&c.signal_id)));
            debug!(job_id = %ctx.job.id, chunk = i, size = chunk.len(), "Chunk classified");
        }

        Ok(PhaseOutput::new(to_artifact(&merged, "classify")?))
    }
}

/// Groups relevant signals into movement profiles.
struct ProfilePhase;

#[async_trait]
impl Phase for ProfilePhase {
    fn name(&self) -> &'static str {
        "profile"
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error> {
        let digests: Vec<SignalDigest> = read_artifact(ctx, "ingest")?;
        let classified: Vec<Classification> = read_artifact(ctx, "classify")?;
        let relevant: HashSet<Uuid> = classified
            .iter()
            .filter(|c| c.relevant)
            .map(|c| c.signal_id)
            .collect();

        let evidence: Vec<Value> = digests
            .iter()
            .filter(|d| relevant.contains(&d.id))
            .map(|d| {
                let topic = classified
                    .iter()
                    .find(|c| c.signal_id == d.id)
                    .map_or("", |c| c.topic.as_str());
                serde_json::json!({
                    "id": d.id,
                    "source": d.source,
                    "title": d.title,
                    "topic": topic,
                })
            })
            .collect();

        if evidence.is_empty() {
            return Ok(PhaseOutput::new("[]"));
        }

        let request = GenerationRequest::new(
            PROFILE_SYSTEM,
            format!(
                "Relevant signals (JSON):\n{}",
                to_artifact(&evidence, "profile")?
            ),
            4096,
        );
        let response = ctx.llm.generate(request).await?;

        let profiles: Vec<MovementProfile> = extract_json_as(&response.text, "movement profiles")?;
        let profiles: Vec<MovementProfile> = profiles
            .into_iter()
            .filter(|p| !p.name.trim().is_empty())
            .map(|mut p| {
                p.signal_ids.retain(|id| relevant.contains(id));
                p.momentum_score = p.momentum_score.min(100);
                p
            })
            .collect();

        Ok(PhaseOutput::new(to_artifact(&profiles, "profile")?))
    }
}

/// Proposes matches between new profiles and tracked movements.
struct MatchPhase {
    db: Arc<dyn Database>,
}

#[async_trait]
impl Phase for MatchPhase {
    fn name(&self) -> &'static str {
        "match"
    }

    async fn run(&self, ctx: &PhaseContext<'_>) -> Result<PhaseOutput, Error> {
        let profiles: Vec<MovementProfile> = read_artifact(ctx, "profile")?;
        if profiles.is_empty() {
            return Ok(PhaseOutput::new("[]"));
        }

        let movements = self.db.list_active_movements().await?;
        if movements.is_empty() {
            debug!(job_id = %ctx.job.id, "No tracked movements, skipping match call");
            return Ok(PhaseOutput::new("[]"));
        }

        let new_profiles: Vec<Value> = profiles
            .iter()
            .enumerate()
            .map(|(i, p)| serde_json::json!({"profile_index": i, "name": p.name, "summary": p.summary}))
            .collect();
        let tracked: Vec<Value> = movements
            .iter()
            .map(|m| serde_json::json!({"movement_id": m.id, "name": m.name, "summary": m.summary, "stage": m.stage}))
            .collect();

        let request = GenerationRequest::new(
            MATCH_SYSTEM,
            format!(
                "New profiles (JSON):\n{}\n\nTracked movements (JSON):\n{}",
                to_artifact(&new_profiles, "match")?,
                to_artifact(&tracked, "match")?
            ),
            2048,
        );
        let response = ctx.llm.generate(request).await?;
        let proposals: Vec<MatchProposal> = extract_json_as(&response.text, "match proposals")?;

        Ok(PhaseOutput::new(to_artifact(&proposals, "match")?))
    }
}

pub struct ScanPipeline {
    db: Arc<dyn Database>,
    phases: Vec<Box<dyn Phase>>,
    cycle: MovementCycle,
}

impl ScanPipeline {
    pub fn new(
        db: Arc<dyn Database>,
        feed: Arc<dyn EvidenceFeed>,
        scan: &ScanConfig,
        lifecycle: &LifecycleConfig,
        dedup: &DedupConfig,
    ) -> Self {
        Self {
            phases: vec![
                Box::new(IngestPhase {
                    db: db.clone(),
                    feed,
                }),
                Box::new(ClassifyPhase {
                    chunk_size: scan.classify_chunk_size,
                }),
                Box::new(ProfilePhase),
                Box::new(MatchPhase { db: db.clone() }),
            ],
            cycle: MovementCycle::new(lifecycle, dedup),
            db,
        }
    }
}

#[async_trait]
impl Pipeline for ScanPipeline {
    fn job_type(&self) -> JobType {
        JobType::Scan
    }

    fn phases(&self) -> &[Box<dyn Phase>] {
        &self.phases
    }

    /// Commits the movement cycle keyed by the job id. The job is completed
    /// afterwards; a re-queued job whose cycle already committed gets the
    /// stored report back instead of a second lifecycle step.
    async fn project(&self, job: &Job, checkpoints: &Checkpoints) -> Result<Value, Error> {
        let profiles: Vec<MovementProfile> =
            extract_json_as(checkpoints.get("profile").unwrap_or("[]"), "profile")?;
        let proposals: Vec<MatchProposal> =
            extract_json_as(checkpoints.get("match").unwrap_or("[]"), "match")?;

        let report = self
            .cycle
            .run(self.db.as_ref(), job.id, &profiles, &proposals, Utc::now())
            .await?;
        Ok(serde_json::to_value(&report).map_err(|source| ParseError::InvalidJson {
            context: "cycle report".to_string(),
            source,
        })?)
    }
}
