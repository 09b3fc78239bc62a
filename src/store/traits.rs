//! Unified `Database` trait, the single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use secrecy::SecretString;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{ErrorKind, Job, JobStatus, JobType};
use crate::movements::{Movement, Signal};

/// An owner's provider credential.
#[derive(Debug, Clone)]
pub struct Credential {
    pub owner_ref: String,
    pub api_key: SecretString,
    /// Set when the provider rejected the key; cleared when it is replaced.
    pub invalid_at: Option<DateTime<Utc>>,
    pub invalid_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    pub fn new(owner_ref: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            owner_ref: owner_ref.into(),
            api_key,
            invalid_at: None,
            invalid_reason: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.invalid_at.is_none()
    }
}

/// Tokens charged to an owner for one provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRecord {
    pub job_id: Uuid,
    pub owner_ref: String,
    pub phase: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Aggregate usage for an owner.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageSummary {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Raw provider output a phase refused, kept for diagnosis only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOutput {
    pub job_id: Uuid,
    pub phase: String,
    pub text: String,
    pub recorded_at: DateTime<Utc>,
}

/// Outcome of appending a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointWrite {
    Written,
    /// The phase already had an artifact; the existing one is kept.
    AlreadyPresent,
}

/// An open transaction over the movement and signal tables.
///
/// Reads and writes issued through the handle commit or roll back together.
/// Dropping the handle without calling `commit` discards the writes.
#[async_trait]
pub trait MovementTx: Send {
    /// All movements that are not dormant.
    async fn active_movements(&mut self) -> Result<Vec<Movement>, DatabaseError>;

    async fn insert_movement(&mut self, movement: &Movement) -> Result<(), DatabaseError>;

    async fn update_movement(&mut self, movement: &Movement) -> Result<(), DatabaseError>;

    /// Append a copy of an ingested signal linked to `movement_id`.
    /// Returns `false` when that link already existed.
    async fn link_signal(&mut self, signal_id: Uuid, movement_id: Uuid)
    -> Result<bool, DatabaseError>;

    /// Number of distinct sources among the signals linked to a movement.
    async fn distinct_sources(&mut self, movement_id: Uuid) -> Result<usize, DatabaseError>;

    /// Report stored by the cycle a scan job already applied, if any.
    async fn applied_cycle(&mut self, job_id: Uuid)
    -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Mark the scan job's cycle applied, storing its report.
    async fn record_cycle(
        &mut self,
        job_id: Uuid,
        report: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError>;

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError>;
}

/// Backend-agnostic database trait covering jobs, credentials and movements.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job. The job must be `queued`.
    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError>;

    /// Insert the job only if the owner has no queued or running job of the
    /// same type. Returns whether it was inserted.
    async fn insert_job_unless_active(&self, job: &Job) -> Result<bool, DatabaseError>;

    /// Get a job with its checkpoints.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError>;

    /// Jobs in a status, oldest first.
    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, DatabaseError>;

    /// Atomically move the oldest claimable `queued` job of `job_type` to
    /// `running` and return it. Jobs whose owner credential is flagged invalid
    /// are not claimable. Each queued job is returned to exactly one caller.
    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, DatabaseError>;

    /// Record the phase the runner is entering.
    async fn set_current_phase(&self, id: Uuid, phase: &str) -> Result<(), DatabaseError>;

    /// Append a phase artifact. Refused with `DatabaseError::Constraint` if the
    /// job is not `running`.
    async fn append_checkpoint(
        &self,
        id: Uuid,
        phase: &str,
        artifact: &str,
    ) -> Result<CheckpointWrite, DatabaseError>;

    /// `running` → `complete`, storing the projection. Returns `false` if the
    /// job was not running.
    async fn complete_job(
        &self,
        id: Uuid,
        projection: &serde_json::Value,
    ) -> Result<bool, DatabaseError>;

    /// `running` → `error`. Returns `false` if the job was not running.
    async fn fail_job(&self, id: Uuid, kind: ErrorKind, message: &str)
    -> Result<bool, DatabaseError>;

    /// Operator action: `error`/`running` → `queued`, keeping checkpoints.
    /// Returns `false` if the job is queued or complete.
    async fn requeue_job(&self, id: Uuid) -> Result<bool, DatabaseError>;

    /// Keep output a phase rejected. It is never a checkpoint.
    async fn record_rejected_output(
        &self,
        job_id: Uuid,
        phase: &str,
        text: &str,
    ) -> Result<(), DatabaseError>;

    /// Rejected outputs of a job, oldest first.
    async fn rejected_outputs(&self, job_id: Uuid) -> Result<Vec<RejectedOutput>, DatabaseError>;

    // ── Credentials ─────────────────────────────────────────────────

    /// Insert or replace an owner's key. Replacing clears the invalid flag.
    async fn upsert_credential(
        &self,
        owner_ref: &str,
        api_key: &SecretString,
    ) -> Result<(), DatabaseError>;

    async fn get_credential(&self, owner_ref: &str) -> Result<Option<Credential>, DatabaseError>;

    /// Flag an owner's credential invalid for every worker.
    async fn invalidate_credential(&self, owner_ref: &str, reason: &str)
    -> Result<(), DatabaseError>;

    // ── Usage ───────────────────────────────────────────────────────

    async fn record_usage(&self, usage: &UsageRecord) -> Result<(), DatabaseError>;

    async fn usage_for_owner(&self, owner_ref: &str) -> Result<UsageSummary, DatabaseError>;

    // ── Signals & movements ─────────────────────────────────────────

    /// Insert unlinked signals stamped with the scan job that ingested them,
    /// skipping any (source, source_id) already ingested. Returns only the
    /// rows actually inserted.
    async fn insert_signals(
        &self,
        signals: &[Signal],
        scan_job_id: Uuid,
    ) -> Result<Vec<Signal>, DatabaseError>;

    /// Unlinked signals stamped with `scan_job_id`, in ingest order.
    async fn signals_from_scan(&self, scan_job_id: Uuid) -> Result<Vec<Signal>, DatabaseError>;

    async fn get_signals(&self, ids: &[Uuid]) -> Result<Vec<Signal>, DatabaseError>;

    /// Signals linked to a movement, newest first.
    async fn signals_for_movement(&self, movement_id: Uuid) -> Result<Vec<Signal>, DatabaseError>;

    async fn get_movement(&self, id: Uuid) -> Result<Option<Movement>, DatabaseError>;

    /// Non-dormant movements.
    async fn list_active_movements(&self) -> Result<Vec<Movement>, DatabaseError>;

    /// Open a transaction over the movement tables.
    async fn begin_movement_tx(&self) -> Result<Box<dyn MovementTx>, DatabaseError>;
}
