//! Job records, statuses and the checkpoint map.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The fixed set of pipelines a job can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    CommitteeBuild,
    Evaluation,
    IdeaGeneration,
    Scan,
}

impl JobType {
    /// All job types, in the order the poller visits them.
    pub const ALL: [JobType; 4] = [
        JobType::CommitteeBuild,
        JobType::Evaluation,
        JobType::IdeaGeneration,
        JobType::Scan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::CommitteeBuild => "committee_build",
            JobType::Evaluation => "evaluation",
            JobType::IdeaGeneration => "idea_generation",
            JobType::Scan => "scan",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "committee_build" => Ok(JobType::CommitteeBuild),
            "evaluation" => Ok(JobType::Evaluation),
            "idea_generation" => Ok(JobType::IdeaGeneration),
            "scan" => Ok(JobType::Scan),
            other => Err(format!(
                "unknown job type '{other}': expected committee_build, evaluation, idea_generation, or scan"
            )),
        }
    }
}

/// Lifecycle status of a job row.
///
/// `Queued → Running → Complete | Error`. Terminal states are only left
/// through an explicit operator re-queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Complete,
    Error,
}

impl JobStatus {
    /// Transitions the engine itself may perform.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Queued, Running) | (Running, Complete) | (Running, Error)
        )
    }

    /// Whether an operator re-queue is allowed from this status.
    ///
    /// `Running` is included so a job orphaned by a crashed worker can be
    /// handed back to the queue.
    pub fn can_requeue(&self) -> bool {
        matches!(self, JobStatus::Error | JobStatus::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Complete => "complete",
            JobStatus::Error => "error",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "complete" => Ok(JobStatus::Complete),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Classification of a failed run, persisted next to the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The provider rejected the owner's credential.
    Auth,
    /// Rate limiting or provider overload; re-queueing is safe.
    Transient,
    /// A phase artifact could not be parsed into its structured shape.
    MalformedOutput,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Auth => "auth",
            ErrorKind::Transient => "transient",
            ErrorKind::MalformedOutput => "malformed_output",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Whether a re-queue of the failed job is expected to make progress.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auth" => Ok(ErrorKind::Auth),
            "transient" => Ok(ErrorKind::Transient),
            "malformed_output" => Ok(ErrorKind::MalformedOutput),
            "unknown" => Ok(ErrorKind::Unknown),
            other => Err(format!("unknown error kind: {other}")),
        }
    }
}

/// One persisted phase output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub phase: String,
    pub artifact: String,
    pub written_at: DateTime<Utc>,
}

/// Phase name → artifact, ordered by write sequence.
///
/// Append-only: an entry is never replaced once present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoints {
    entries: Vec<Checkpoint>,
}

impl Checkpoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from rows already sorted by write sequence.
    pub fn from_entries(entries: Vec<Checkpoint>) -> Self {
        let mut checkpoints = Self::new();
        for entry in entries {
            checkpoints.insert(entry);
        }
        checkpoints
    }

    /// Append a checkpoint. Returns `false` (and keeps the existing artifact)
    /// if the phase already has one.
    pub fn insert(&mut self, checkpoint: Checkpoint) -> bool {
        if self.contains(&checkpoint.phase) {
            return false;
        }
        self.entries.push(checkpoint);
        true
    }

    pub fn get(&self, phase: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|c| c.phase == phase)
            .map(|c| c.artifact.as_str())
    }

    pub fn contains(&self, phase: &str) -> bool {
        self.entries.iter().any(|c| c.phase == phase)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn phases(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|c| c.phase.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Checkpoint> {
        self.entries.iter()
    }
}

/// A durable job record.
#[derive(Debug, Clone, Serialize)]
pub struct Job {
    pub id: Uuid,
    pub job_type: JobType,
    pub status: JobStatus,
    /// Last phase the runner entered. Observability only.
    pub current_phase: Option<String>,
    pub checkpoints: Checkpoints,
    /// Credential owner whose external-call budget is charged.
    pub owner_ref: String,
    /// The brief this job generates from.
    pub input: serde_json::Value,
    pub error_message: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Structured record derived from all checkpoints on completion.
    pub projection: Option<serde_json::Value>,
    /// Number of successful claims (operator re-queues show up here).
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a fresh queued job (not yet persisted).
    pub fn new(job_type: JobType, owner_ref: impl Into<String>, input: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type,
            status: JobStatus::Queued,
            current_phase: None,
            checkpoints: Checkpoints::new(),
            owner_ref: owner_ref.into(),
            input,
            error_message: None,
            error_kind: None,
            projection: None,
            attempts: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Read a string field from the job input.
    pub fn input_str(&self, key: &str) -> Option<&str> {
        self.input.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(phase: &str, artifact: &str) -> Checkpoint {
        Checkpoint {
            phase: phase.to_string(),
            artifact: artifact.to_string(),
            written_at: Utc::now(),
        }
    }

    #[test]
    fn status_transitions_valid() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Complete));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Error));
    }

    #[test]
    fn status_transitions_invalid() {
        assert!(!JobStatus::Complete.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Error.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Complete));
    }

    #[test]
    fn requeue_only_from_error_or_running() {
        assert!(JobStatus::Error.can_requeue());
        assert!(JobStatus::Running.can_requeue());
        assert!(!JobStatus::Complete.can_requeue());
        assert!(!JobStatus::Queued.can_requeue());
    }

    #[test]
    fn checkpoints_are_append_only() {
        let mut cps = Checkpoints::new();
        assert!(cps.insert(checkpoint("research", "first")));
        assert!(!cps.insert(checkpoint("research", "second")));
        assert_eq!(cps.get("research"), Some("first"));
        assert_eq!(cps.len(), 1);
    }

    #[test]
    fn checkpoints_keep_write_order() {
        let cps = Checkpoints::from_entries(vec![
            checkpoint("b", "2"),
            checkpoint("a", "1"),
            checkpoint("c", "3"),
        ]);
        let phases: Vec<&str> = cps.phases().collect();
        assert_eq!(phases, vec!["b", "a", "c"]);
    }

    #[test]
    fn job_type_parse_accepts_dashes() {
        assert_eq!("committee-build".parse::<JobType>().unwrap(), JobType::CommitteeBuild);
        assert_eq!("SCAN".parse::<JobType>().unwrap(), JobType::Scan);
        assert!("payroll".parse::<JobType>().is_err());
    }

    #[test]
    fn job_status_serde_roundtrip() {
        let json = serde_json::to_string(&JobStatus::Complete).unwrap();
        assert_eq!(json, "\"complete\"");
        let parsed: JobStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, JobStatus::Complete);
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(ErrorKind::Transient.is_retryable());
        assert!(!ErrorKind::Auth.is_retryable());
        assert!(!ErrorKind::MalformedOutput.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }
}
