//! libSQL implementation of the async `Database` trait.
//!
//! A single connection is shared by every task. SQLite transactions are
//! scoped to a connection, so writes and transactions serialize on an
//! in-process gate; otherwise one task's statements could land inside
//! another task's open transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::{Checkpoint, Checkpoints, ErrorKind, Job, JobStatus, JobType};
use crate::movements::{Movement, Signal, Stage};
use crate::store::migrations;
use crate::store::traits::{
    CheckpointWrite, Credential, Database, MovementTx, RejectedOutput, UsageRecord, UsageSummary,
};

/// How long a statement waits on another process's write lock.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_gate: Arc<Mutex<()>>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        // Several worker processes may share the file.
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;
        pragma(&conn, &format!("PRAGMA busy_timeout = {BUSY_TIMEOUT_MS}")).await?;

        let backend = Self::with_connection(db, conn);
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self::with_connection(db, conn);
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn with_connection(db: LibSqlDatabase, conn: Connection) -> Self {
        Self {
            db: Arc::new(db),
            conn,
            write_gate: Arc::new(Mutex::new(())),
        }
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn load_checkpoints(&self, job_id: Uuid) -> Result<Checkpoints, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT phase, artifact, written_at FROM job_checkpoints WHERE job_id = ?1 ORDER BY seq",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("load_checkpoints"))?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("load_checkpoints"))? {
            let written_at: String = row.get(2).map_err(query_err("checkpoint.written_at"))?;
            entries.push(Checkpoint {
                phase: row.get(0).map_err(query_err("checkpoint.phase"))?,
                artifact: row.get(1).map_err(query_err("checkpoint.artifact"))?,
                written_at: parse_datetime(&written_at),
            });
        }
        Ok(Checkpoints::from_entries(entries))
    }

    async fn job_status(&self, id: Uuid) -> Result<Option<JobStatus>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT status FROM jobs WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err("job_status"))?;

        match rows.next().await.map_err(query_err("job_status"))? {
            Some(row) => {
                let status: String = row.get(0).map_err(query_err("job.status"))?;
                Ok(Some(parse_enum(&status, "job.status")?))
            }
            None => Ok(None),
        }
    }

    async fn query_signals(
        &self,
        sql: &str,
        args: impl libsql::params::IntoParams,
        context: &'static str,
    ) -> Result<Vec<Signal>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, args)
            .await
            .map_err(query_err(context))?;

        let mut signals = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err(context))? {
            signals.push(row_to_signal(&row)?);
        }
        Ok(signals)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Map a libsql error into a query error tagged with the calling operation.
fn query_err(context: &'static str) -> impl Fn(libsql::Error) -> DatabaseError {
    move |e| DatabaseError::Query(format!("{context}: {e}"))
}

/// Run a PRAGMA. PRAGMAs may return a row, so they go through `query`.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    let mut rows = conn
        .query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    while rows
        .next()
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?
        .is_some()
    {}
    Ok(())
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str, field: &str) -> Result<Uuid, DatabaseError> {
    Uuid::parse_str(s).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn parse_enum<T: std::str::FromStr<Err = String>>(s: &str, field: &str) -> Result<T, DatabaseError> {
    s.parse()
        .map_err(|e: String| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn parse_json(s: &str, field: &str) -> Result<serde_json::Value, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

fn to_json(value: &serde_json::Value, field: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{field}: {e}")))
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> libsql::Value {
    match dt {
        Some(dt) => libsql::Value::Text(ts(dt)),
        None => libsql::Value::Null,
    }
}

const JOB_COLUMNS: &str = "id, job_type, status, current_phase, owner_ref, input, error_message, error_kind, projection, attempts, created_at, updated_at, started_at, finished_at";

const MOVEMENT_COLUMNS: &str = "id, name, summary, stage, momentum_score, peak_momentum_score, peak_at, last_signal_at, created_at, updated_at";

const SIGNAL_COLUMNS: &str =
    "id, source, source_id, title, content, url, metadata, movement_id, ingested_at";

/// Map a row selected with JOB_COLUMNS. Checkpoints are loaded separately.
fn row_to_job(row: &libsql::Row) -> Result<Job, DatabaseError> {
    let id: String = row.get(0).map_err(query_err("job.id"))?;
    let job_type: String = row.get(1).map_err(query_err("job.job_type"))?;
    let status: String = row.get(2).map_err(query_err("job.status"))?;
    let input: String = row.get(5).map_err(query_err("job.input"))?;
    let error_kind: Option<String> = row.get(7).map_err(query_err("job.error_kind"))?;
    let projection: Option<String> = row.get(8).map_err(query_err("job.projection"))?;
    let attempts: i64 = row.get(9).map_err(query_err("job.attempts"))?;
    let created_at: String = row.get(10).map_err(query_err("job.created_at"))?;
    let updated_at: String = row.get(11).map_err(query_err("job.updated_at"))?;
    let started_at: Option<String> = row.get(12).map_err(query_err("job.started_at"))?;
    let finished_at: Option<String> = row.get(13).map_err(query_err("job.finished_at"))?;

    Ok(Job {
        id: parse_uuid(&id, "job.id")?,
        job_type: parse_enum::<JobType>(&job_type, "job.job_type")?,
        status: parse_enum::<JobStatus>(&status, "job.status")?,
        current_phase: row.get(3).map_err(query_err("job.current_phase"))?,
        checkpoints: Checkpoints::new(),
        owner_ref: row.get(4).map_err(query_err("job.owner_ref"))?,
        input: parse_json(&input, "job.input")?,
        error_message: row.get(6).map_err(query_err("job.error_message"))?,
        error_kind: error_kind
            .map(|k| parse_enum::<ErrorKind>(&k, "job.error_kind"))
            .transpose()?,
        projection: projection
            .map(|p| parse_json(&p, "job.projection"))
            .transpose()?,
        attempts: attempts.max(0) as u32,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
        started_at: parse_optional_datetime(&started_at),
        finished_at: parse_optional_datetime(&finished_at),
    })
}

fn row_to_movement(row: &libsql::Row) -> Result<Movement, DatabaseError> {
    let id: String = row.get(0).map_err(query_err("movement.id"))?;
    let stage: String = row.get(3).map_err(query_err("movement.stage"))?;
    let momentum: i64 = row.get(4).map_err(query_err("movement.momentum_score"))?;
    let peak: i64 = row.get(5).map_err(query_err("movement.peak_momentum_score"))?;
    let peak_at: Option<String> = row.get(6).map_err(query_err("movement.peak_at"))?;
    let last_signal_at: String = row.get(7).map_err(query_err("movement.last_signal_at"))?;
    let created_at: String = row.get(8).map_err(query_err("movement.created_at"))?;
    let updated_at: String = row.get(9).map_err(query_err("movement.updated_at"))?;

    Ok(Movement {
        id: parse_uuid(&id, "movement.id")?,
        name: row.get(1).map_err(query_err("movement.name"))?,
        summary: row.get(2).map_err(query_err("movement.summary"))?,
        stage: parse_enum::<Stage>(&stage, "movement.stage")?,
        momentum_score: momentum.clamp(0, 100) as u8,
        peak_momentum_score: peak.clamp(0, 100) as u8,
        peak_at: parse_optional_datetime(&peak_at),
        last_signal_at: parse_datetime(&last_signal_at),
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

fn row_to_signal(row: &libsql::Row) -> Result<Signal, DatabaseError> {
    let id: String = row.get(0).map_err(query_err("signal.id"))?;
    let metadata: String = row.get(6).map_err(query_err("signal.metadata"))?;
    let movement_id: Option<String> = row.get(7).map_err(query_err("signal.movement_id"))?;
    let ingested_at: String = row.get(8).map_err(query_err("signal.ingested_at"))?;

    Ok(Signal {
        id: parse_uuid(&id, "signal.id")?,
        source: row.get(1).map_err(query_err("signal.source"))?,
        source_id: row.get(2).map_err(query_err("signal.source_id"))?,
        title: row.get(3).map_err(query_err("signal.title"))?,
        content: row.get(4).map_err(query_err("signal.content"))?,
        url: row.get(5).map_err(query_err("signal.url"))?,
        metadata: parse_json(&metadata, "signal.metadata")?,
        movement_id: movement_id
            .map(|m| parse_uuid(&m, "signal.movement_id"))
            .transpose()?,
        ingested_at: parse_datetime(&ingested_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        migrations::run_migrations(self.conn()).await
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), DatabaseError> {
        if job.status != JobStatus::Queued {
            return Err(DatabaseError::Constraint(format!(
                "new job {} must be queued, got {}",
                job.id, job.status
            )));
        }
        let _gate = self.write_gate.lock().await;
        self.conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS}) VALUES (?1, ?2, 'queued', NULL, ?3, ?4, NULL, NULL, NULL, 0, ?5, ?6, NULL, NULL)"
                ),
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.owner_ref.as_str(),
                    to_json(&job.input, "job.input")?,
                    ts(job.created_at),
                    ts(job.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_job"))?;

        debug!(job_id = %job.id, job_type = %job.job_type, owner = %job.owner_ref, "Job enqueued");
        Ok(())
    }

    async fn insert_job_unless_active(&self, job: &Job) -> Result<bool, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let inserted = self
            .conn()
            .execute(
                &format!(
                    "INSERT INTO jobs ({JOB_COLUMNS})
                     SELECT ?1, ?2, 'queued', NULL, ?3, ?4, NULL, NULL, NULL, 0, ?5, ?6, NULL, NULL
                     WHERE NOT EXISTS (
                         SELECT 1 FROM jobs
                         WHERE owner_ref = ?3 AND job_type = ?2 AND status IN ('queued', 'running')
                     )"
                ),
                params![
                    job.id.to_string(),
                    job.job_type.as_str(),
                    job.owner_ref.as_str(),
                    to_json(&job.input, "job.input")?,
                    ts(job.created_at),
                    ts(job.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_job_unless_active"))?;

        Ok(inserted == 1)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_job"))?;

        let row = rows.next().await.map_err(query_err("get_job"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = row_to_job(&row)?;
        drop(rows);
        job.checkpoints = self.load_checkpoints(id).await?;
        Ok(Some(job))
    }

    async fn list_jobs(&self, status: JobStatus, limit: usize) -> Result<Vec<Job>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {JOB_COLUMNS} FROM jobs WHERE status = ?1 ORDER BY created_at, rowid LIMIT ?2"
                ),
                params![status.as_str(), limit as i64],
            )
            .await
            .map_err(query_err("list_jobs"))?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("list_jobs"))? {
            jobs.push(row_to_job(&row)?);
        }
        drop(rows);

        for job in &mut jobs {
            job.checkpoints = self.load_checkpoints(job.id).await?;
        }
        Ok(jobs)
    }

    async fn claim_next(&self, job_type: JobType) -> Result<Option<Job>, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let now = ts(Utc::now());

        // A single UPDATE ... RETURNING: SQLite holds the write lock for the
        // whole statement, so the select and the status flip cannot interleave
        // with another claimer in this or any other process.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE jobs
                     SET status = 'running', attempts = attempts + 1,
                         started_at = ?1, updated_at = ?1, finished_at = NULL
                     WHERE id = (
                         SELECT j.id FROM jobs j
                         WHERE j.status = 'queued' AND j.job_type = ?2
                           AND NOT EXISTS (
                               SELECT 1 FROM credentials c
                               WHERE c.owner_ref = j.owner_ref AND c.invalid_at IS NOT NULL
                           )
                         ORDER BY j.created_at, j.rowid
                         LIMIT 1
                     )
                     RETURNING {JOB_COLUMNS}"
                ),
                params![now, job_type.as_str()],
            )
            .await
            .map_err(query_err("claim_next"))?;

        let row = rows.next().await.map_err(query_err("claim_next"))?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = row_to_job(&row)?;
        drop(rows);

        job.checkpoints = self.load_checkpoints(job.id).await?;
        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            checkpoints = job.checkpoints.len(),
            "Job claimed"
        );
        Ok(Some(job))
    }

    async fn set_current_phase(&self, id: Uuid, phase: &str) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        self.conn()
            .execute(
                "UPDATE jobs SET current_phase = ?1, updated_at = ?2 WHERE id = ?3 AND status = 'running'",
                params![phase, ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("set_current_phase"))?;
        Ok(())
    }

    async fn append_checkpoint(
        &self,
        id: Uuid,
        phase: &str,
        artifact: &str,
    ) -> Result<CheckpointWrite, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let now = ts(Utc::now());

        let written = self
            .conn()
            .execute(
                "INSERT INTO job_checkpoints (job_id, phase, artifact, written_at)
                 SELECT ?1, ?2, ?3, ?4
                 WHERE EXISTS (SELECT 1 FROM jobs WHERE id = ?1 AND status = 'running')
                 ON CONFLICT (job_id, phase) DO NOTHING",
                params![id.to_string(), phase, artifact, now.as_str()],
            )
            .await
            .map_err(query_err("append_checkpoint"))?;

        if written == 1 {
            self.conn()
                .execute(
                    "UPDATE jobs SET updated_at = ?1 WHERE id = ?2",
                    params![now.as_str(), id.to_string()],
                )
                .await
                .map_err(query_err("append_checkpoint"))?;
            return Ok(CheckpointWrite::Written);
        }

        match self.job_status(id).await? {
            None => Err(DatabaseError::NotFound {
                entity: "job".to_string(),
                id: id.to_string(),
            }),
            Some(JobStatus::Running) => {
                warn!(job_id = %id, phase, "Checkpoint already present, keeping existing artifact");
                Ok(CheckpointWrite::AlreadyPresent)
            }
            Some(status) => Err(DatabaseError::Constraint(format!(
                "cannot checkpoint job {id} in status {status}"
            ))),
        }
    }

    async fn complete_job(
        &self,
        id: Uuid,
        projection: &serde_json::Value,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let now = ts(Utc::now());
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'complete', projection = ?1, error_message = NULL, error_kind = NULL,
                     finished_at = ?2, updated_at = ?2
                 WHERE id = ?3 AND status = 'running'",
                params![to_json(projection, "job.projection")?, now, id.to_string()],
            )
            .await
            .map_err(query_err("complete_job"))?;
        Ok(updated == 1)
    }

    async fn fail_job(
        &self,
        id: Uuid,
        kind: ErrorKind,
        message: &str,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let now = ts(Utc::now());
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'error', error_kind = ?1, error_message = ?2,
                     finished_at = ?3, updated_at = ?3
                 WHERE id = ?4 AND status = 'running'",
                params![kind.as_str(), message, now, id.to_string()],
            )
            .await
            .map_err(query_err("fail_job"))?;
        Ok(updated == 1)
    }

    async fn requeue_job(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE jobs
                 SET status = 'queued', error_kind = NULL, error_message = NULL,
                     finished_at = NULL, updated_at = ?1
                 WHERE id = ?2 AND status IN ('error', 'running')",
                params![ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err("requeue_job"))?;
        Ok(updated == 1)
    }

    async fn record_rejected_output(
        &self,
        job_id: Uuid,
        phase: &str,
        text: &str,
    ) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        self.conn()
            .execute(
                "INSERT INTO rejected_outputs (job_id, phase, text, recorded_at) VALUES (?1, ?2, ?3, ?4)",
                params![job_id.to_string(), phase, text, ts(Utc::now())],
            )
            .await
            .map_err(query_err("record_rejected_output"))?;
        debug!(job_id = %job_id, phase, bytes = text.len(), "Rejected output kept");
        Ok(())
    }

    async fn rejected_outputs(&self, job_id: Uuid) -> Result<Vec<RejectedOutput>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT phase, text, recorded_at FROM rejected_outputs WHERE job_id = ?1 ORDER BY id",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("rejected_outputs"))?;

        let mut outputs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err("rejected_outputs"))? {
            let recorded_at: String = row.get(2).map_err(query_err("rejected_output.recorded_at"))?;
            outputs.push(RejectedOutput {
                job_id,
                phase: row.get(0).map_err(query_err("rejected_output.phase"))?,
                text: row.get(1).map_err(query_err("rejected_output.text"))?,
                recorded_at: parse_datetime(&recorded_at),
            });
        }
        Ok(outputs)
    }

    // ── Credentials ─────────────────────────────────────────────────

    async fn upsert_credential(
        &self,
        owner_ref: &str,
        api_key: &SecretString,
    ) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        self.conn()
            .execute(
                "INSERT INTO credentials (owner_ref, api_key, invalid_at, invalid_reason, updated_at)
                 VALUES (?1, ?2, NULL, NULL, ?3)
                 ON CONFLICT (owner_ref) DO UPDATE SET
                     api_key = excluded.api_key,
                     invalid_at = NULL,
                     invalid_reason = NULL,
                     updated_at = excluded.updated_at",
                params![owner_ref, api_key.expose_secret(), ts(Utc::now())],
            )
            .await
            .map_err(query_err("upsert_credential"))?;
        Ok(())
    }

    async fn get_credential(&self, owner_ref: &str) -> Result<Option<Credential>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT owner_ref, api_key, invalid_at, invalid_reason, updated_at FROM credentials WHERE owner_ref = ?1",
                params![owner_ref],
            )
            .await
            .map_err(query_err("get_credential"))?;

        let Some(row) = rows.next().await.map_err(query_err("get_credential"))? else {
            return Ok(None);
        };
        let api_key: String = row.get(1).map_err(query_err("credential.api_key"))?;
        let invalid_at: Option<String> = row.get(2).map_err(query_err("credential.invalid_at"))?;
        let updated_at: String = row.get(4).map_err(query_err("credential.updated_at"))?;

        Ok(Some(Credential {
            owner_ref: row.get(0).map_err(query_err("credential.owner_ref"))?,
            api_key: SecretString::from(api_key),
            invalid_at: parse_optional_datetime(&invalid_at),
            invalid_reason: row.get(3).map_err(query_err("credential.invalid_reason"))?,
            updated_at: parse_datetime(&updated_at),
        }))
    }

    async fn invalidate_credential(
        &self,
        owner_ref: &str,
        reason: &str,
    ) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let now = ts(Utc::now());
        let updated = self
            .conn()
            .execute(
                "UPDATE credentials SET invalid_at = ?1, invalid_reason = ?2, updated_at = ?1
                 WHERE owner_ref = ?3 AND invalid_at IS NULL",
                params![now, reason, owner_ref],
            )
            .await
            .map_err(query_err("invalidate_credential"))?;

        if updated == 1 {
            warn!(owner = owner_ref, reason, "Credential flagged invalid");
        }
        Ok(())
    }

    // ── Usage ───────────────────────────────────────────────────────

    async fn record_usage(&self, usage: &UsageRecord) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        self.conn()
            .execute(
                "INSERT INTO llm_usage (job_id, owner_ref, phase, input_tokens, output_tokens, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    usage.job_id.to_string(),
                    usage.owner_ref.as_str(),
                    usage.phase.as_str(),
                    usage.input_tokens as i64,
                    usage.output_tokens as i64,
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(query_err("record_usage"))?;
        Ok(())
    }

    async fn usage_for_owner(&self, owner_ref: &str) -> Result<UsageSummary, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0)
                 FROM llm_usage WHERE owner_ref = ?1",
                params![owner_ref],
            )
            .await
            .map_err(query_err("usage_for_owner"))?;

        let Some(row) = rows.next().await.map_err(query_err("usage_for_owner"))? else {
            return Ok(UsageSummary::default());
        };
        let calls: i64 = row.get(0).map_err(query_err("usage.calls"))?;
        let input: i64 = row.get(1).map_err(query_err("usage.input_tokens"))?;
        let output: i64 = row.get(2).map_err(query_err("usage.output_tokens"))?;
        Ok(UsageSummary {
            calls: calls.max(0) as u64,
            input_tokens: input.max(0) as u64,
            output_tokens: output.max(0) as u64,
        })
    }

    // ── Signals & movements ─────────────────────────────────────────

    async fn insert_signals(
        &self,
        signals: &[Signal],
        scan_job_id: Uuid,
    ) -> Result<Vec<Signal>, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(query_err("insert_signals"))?;

        let mut inserted = Vec::new();
        for signal in signals {
            let metadata = to_json(&signal.metadata, "signal.metadata")?;
            let result = tx
                .execute(
                    &format!(
                        "INSERT OR IGNORE INTO signals ({SIGNAL_COLUMNS}, scan_job_id)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?9)"
                    ),
                    params![
                        signal.id.to_string(),
                        signal.source.as_str(),
                        signal.source_id.as_str(),
                        signal.title.as_str(),
                        signal.content.as_str(),
                        opt_text(signal.url.as_deref()),
                        metadata,
                        ts(signal.ingested_at),
                        scan_job_id.to_string(),
                    ],
                )
                .await;

            match result {
                Ok(1) => {
                    let mut stored = signal.clone();
                    stored.movement_id = None;
                    inserted.push(stored);
                }
                Ok(_) => {}
                Err(e) => {
                    if let Err(rollback) = tx.rollback().await {
                        warn!(error = %rollback, "insert_signals rollback failed");
                    }
                    return Err(DatabaseError::Query(format!("insert_signals: {e}")));
                }
            }
        }

        tx.commit().await.map_err(query_err("insert_signals"))?;
        debug!(
            offered = signals.len(),
            inserted = inserted.len(),
            "Signals ingested"
        );
        Ok(inserted)
    }

    async fn signals_from_scan(&self, scan_job_id: Uuid) -> Result<Vec<Signal>, DatabaseError> {
        self.query_signals(
            &format!(
                "SELECT {SIGNAL_COLUMNS} FROM signals
                 WHERE scan_job_id = ?1 AND movement_id IS NULL
                 ORDER BY ingested_at, rowid"
            ),
            params![scan_job_id.to_string()],
            "signals_from_scan",
        )
        .await
    }

    async fn get_signals(&self, ids: &[Uuid]) -> Result<Vec<Signal>, DatabaseError> {
        let mut signals = Vec::with_capacity(ids.len());
        for id in ids {
            let found = self
                .query_signals(
                    &format!("SELECT {SIGNAL_COLUMNS} FROM signals WHERE id = ?1"),
                    params![id.to_string()],
                    "get_signals",
                )
                .await?;
            signals.extend(found);
        }
        Ok(signals)
    }

    async fn signals_for_movement(&self, movement_id: Uuid) -> Result<Vec<Signal>, DatabaseError> {
        self.query_signals(
            &format!(
                "SELECT {SIGNAL_COLUMNS} FROM signals WHERE movement_id = ?1 ORDER BY ingested_at DESC, rowid DESC"
            ),
            params![movement_id.to_string()],
            "signals_for_movement",
        )
        .await
    }

    async fn get_movement(&self, id: Uuid) -> Result<Option<Movement>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {MOVEMENT_COLUMNS} FROM movements WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err("get_movement"))?;

        match rows.next().await.map_err(query_err("get_movement"))? {
            Some(row) => Ok(Some(row_to_movement(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_active_movements(&self) -> Result<Vec<Movement>, DatabaseError> {
        select_active_movements(self.conn()).await
    }

    async fn begin_movement_tx(&self) -> Result<Box<dyn MovementTx>, DatabaseError> {
        let gate = self.write_gate.clone().lock_owned().await;
        let tx = self
            .conn()
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(query_err("begin_movement_tx"))?;
        Ok(Box::new(LibSqlMovementTx { tx, _gate: gate }))
    }
}

async fn select_active_movements(conn: &Connection) -> Result<Vec<Movement>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {MOVEMENT_COLUMNS} FROM movements WHERE stage != 'dormant' ORDER BY created_at, rowid"
            ),
            (),
        )
        .await
        .map_err(query_err("list_active_movements"))?;

    let mut movements = Vec::new();
    while let Some(row) = rows.next().await.map_err(query_err("list_active_movements"))? {
        movements.push(row_to_movement(&row)?);
    }
    Ok(movements)
}

/// An open IMMEDIATE transaction holding the backend's write gate.
struct LibSqlMovementTx {
    tx: libsql::Transaction,
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl MovementTx for LibSqlMovementTx {
    async fn active_movements(&mut self) -> Result<Vec<Movement>, DatabaseError> {
        select_active_movements(&self.tx).await
    }

    async fn insert_movement(&mut self, movement: &Movement) -> Result<(), DatabaseError> {
        self.tx
            .execute(
                &format!(
                    "INSERT INTO movements ({MOVEMENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
                ),
                params![
                    movement.id.to_string(),
                    movement.name.as_str(),
                    movement.summary.as_str(),
                    movement.stage.as_str(),
                    movement.momentum_score as i64,
                    movement.peak_momentum_score as i64,
                    opt_datetime(movement.peak_at),
                    ts(movement.last_signal_at),
                    ts(movement.created_at),
                    ts(movement.updated_at),
                ],
            )
            .await
            .map_err(query_err("insert_movement"))?;
        Ok(())
    }

    async fn update_movement(&mut self, movement: &Movement) -> Result<(), DatabaseError> {
        let updated = self
            .tx
            .execute(
                "UPDATE movements
                 SET name = ?1, summary = ?2, stage = ?3, momentum_score = ?4,
                     peak_momentum_score = ?5, peak_at = ?6, last_signal_at = ?7, updated_at = ?8
                 WHERE id = ?9",
                params![
                    movement.name.as_str(),
                    movement.summary.as_str(),
                    movement.stage.as_str(),
                    movement.momentum_score as i64,
                    movement.peak_momentum_score as i64,
                    opt_datetime(movement.peak_at),
                    ts(movement.last_signal_at),
                    ts(movement.updated_at),
                    movement.id.to_string(),
                ],
            )
            .await
            .map_err(query_err("update_movement"))?;

        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "movement".to_string(),
                id: movement.id.to_string(),
            });
        }
        Ok(())
    }

    async fn link_signal(
        &mut self,
        signal_id: Uuid,
        movement_id: Uuid,
    ) -> Result<bool, DatabaseError> {
        let linked = self
            .tx
            .execute(
                &format!(
                    "INSERT OR IGNORE INTO signals ({SIGNAL_COLUMNS})
                     SELECT ?1, source, source_id, title, content, url, metadata, ?2, ingested_at
                     FROM signals WHERE id = ?3"
                ),
                params![
                    Uuid::new_v4().to_string(),
                    movement_id.to_string(),
                    signal_id.to_string(),
                ],
            )
            .await
            .map_err(query_err("link_signal"))?;
        Ok(linked == 1)
    }

    async fn distinct_sources(&mut self, movement_id: Uuid) -> Result<usize, DatabaseError> {
        let mut rows = self
            .tx
            .query(
                "SELECT COUNT(DISTINCT source) FROM signals WHERE movement_id = ?1",
                params![movement_id.to_string()],
            )
            .await
            .map_err(query_err("distinct_sources"))?;

        match rows.next().await.map_err(query_err("distinct_sources"))? {
            Some(row) => {
                let count: i64 = row.get(0).map_err(query_err("distinct_sources"))?;
                Ok(count.max(0) as usize)
            }
            None => Ok(0),
        }
    }

    async fn applied_cycle(
        &mut self,
        job_id: Uuid,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .tx
            .query(
                "SELECT report FROM movement_cycles WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .await
            .map_err(query_err("applied_cycle"))?;

        match rows.next().await.map_err(query_err("applied_cycle"))? {
            Some(row) => {
                let report: String = row.get(0).map_err(query_err("movement_cycle.report"))?;
                Ok(Some(parse_json(&report, "movement_cycle.report")?))
            }
            None => Ok(None),
        }
    }

    async fn record_cycle(
        &mut self,
        job_id: Uuid,
        report: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.tx
            .execute(
                "INSERT INTO movement_cycles (job_id, report, applied_at) VALUES (?1, ?2, ?3)",
                params![
                    job_id.to_string(),
                    to_json(report, "movement_cycle.report")?,
                    ts(Utc::now()),
                ],
            )
            .await
            .map_err(query_err("record_cycle"))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), DatabaseError> {
        let this = *self;
        this.tx.commit().await.map_err(query_err("movement_tx commit"))
    }

    async fn rollback(self: Box<Self>) -> Result<(), DatabaseError> {
        let this = *self;
        this.tx
            .rollback()
            .await
            .map_err(query_err("movement_tx rollback"))
    }
}
