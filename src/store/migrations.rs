//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "job_queue",
        sql: r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'queued',
                current_phase TEXT,
                owner_ref TEXT NOT NULL,
                input TEXT NOT NULL DEFAULT '{}',
                error_message TEXT,
                error_kind TEXT,
                projection TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                started_at TEXT,
                finished_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(job_type, status, created_at);
            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner_ref);

            CREATE TABLE IF NOT EXISTS job_checkpoints (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                phase TEXT NOT NULL,
                artifact TEXT NOT NULL,
                written_at TEXT NOT NULL,
                UNIQUE (job_id, phase)
            );
            CREATE INDEX IF NOT EXISTS idx_job_checkpoints_job ON job_checkpoints(job_id);

            CREATE TABLE IF NOT EXISTS credentials (
                owner_ref TEXT PRIMARY KEY,
                api_key TEXT NOT NULL,
                invalid_at TEXT,
                invalid_reason TEXT,
                updated_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "usage_tracking",
        sql: r#"
            CREATE TABLE IF NOT EXISTS llm_usage (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                owner_ref TEXT NOT NULL,
                phase TEXT NOT NULL,
                input_tokens INTEGER NOT NULL DEFAULT 0,
                output_tokens INTEGER NOT NULL DEFAULT 0,
                recorded_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_llm_usage_owner ON llm_usage(owner_ref);
            CREATE INDEX IF NOT EXISTS idx_llm_usage_job ON llm_usage(job_id);
        "#,
    },
    Migration {
        version: 3,
        name: "movements",
        sql: r#"
            CREATE TABLE IF NOT EXISTS movements (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                summary TEXT NOT NULL DEFAULT '',
                stage TEXT NOT NULL DEFAULT 'detected',
                momentum_score INTEGER NOT NULL DEFAULT 0,
                peak_momentum_score INTEGER NOT NULL DEFAULT 0,
                peak_at TEXT,
                last_signal_at TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_movements_stage ON movements(stage);

            CREATE TABLE IF NOT EXISTS signals (
                id TEXT PRIMARY KEY,
                source TEXT NOT NULL,
                source_id TEXT NOT NULL,
                title TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                url TEXT,
                metadata TEXT NOT NULL DEFAULT 'null',
                movement_id TEXT REFERENCES movements(id),
                ingested_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_signals_identity
                ON signals(source, source_id, IFNULL(movement_id, ''));
            CREATE INDEX IF NOT EXISTS idx_signals_movement ON signals(movement_id);
        "#,
    },
    Migration {
        version: 4,
        name: "scan_recovery",
        sql: r#"
            ALTER TABLE signals ADD COLUMN scan_job_id TEXT;
            CREATE INDEX IF NOT EXISTS idx_signals_scan_job ON signals(scan_job_id);

            CREATE TABLE IF NOT EXISTS movement_cycles (
                job_id TEXT PRIMARY KEY,
                report TEXT NOT NULL,
                applied_at TEXT NOT NULL
            );
        "#,
    },
    Migration {
        version: 5,
        name: "rejected_outputs",
        sql: r#"
            CREATE TABLE IF NOT EXISTS rejected_outputs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL REFERENCES jobs(id),
                phase TEXT NOT NULL,
                text TEXT NOT NULL,
                recorded_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_rejected_outputs_job ON rejected_outputs(job_id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "_migrations",
            "jobs",
            "job_checkpoints",
            "credentials",
            "llm_usage",
            "movements",
            "signals",
            "movement_cycles",
            "rejected_outputs",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 5);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();
        let expected = [
            (1, "job_queue"),
            (2, "usage_tracking"),
            (3, "movements"),
            (4, "scan_recovery"),
            (5, "rejected_outputs"),
        ];
        for (version, name) in expected {
            let row = rows.next().await.unwrap().unwrap();
            let v: i64 = row.get(0).unwrap();
            let n: String = row.get(1).unwrap();
            assert_eq!(v, version);
            assert_eq!(n, name);
        }
    }

    #[test]
    fn migration_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let conn = runtime.block_on(test_conn());
        let fut = run_migrations(&conn);
        assert_send(&fut);
        runtime.block_on(fut).unwrap();
    }

    #[tokio::test]
    async fn signal_identity_treats_unlinked_rows_as_equal() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let insert = "INSERT OR IGNORE INTO signals (id, source, source_id, title, ingested_at)
                      VALUES (?1, 'reddit', 'abc', 't', '2026-01-01T00:00:00Z')";
        let first = conn.execute(insert, libsql::params!["s1"]).await.unwrap();
        let second = conn.execute(insert, libsql::params!["s2"]).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 0);
    }
}
