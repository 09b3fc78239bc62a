//! Persistence layer: libSQL-backed storage for jobs, credentials and movements.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    CheckpointWrite, Credential, Database, MovementTx, RejectedOutput, UsageRecord, UsageSummary,
};
