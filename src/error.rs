//! Error types for the boardroom worker.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error type for the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Evidence feed error: {0}")]
    Feed(String),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} overloaded (status {status})")]
    Overloaded { provider: String, status: u16 },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider} (status {status})")]
    AuthFailed { provider: String, status: u16 },

    #[error("Provider {provider} returned status {status}: {body}")]
    Http {
        provider: String,
        status: u16,
        body: String,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures turning a phase artifact into a structured record.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("No JSON payload found in {context}")]
    MissingJson { context: String },

    #[error("Malformed JSON in {context}: {source}")]
    InvalidJson {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Missing section '{heading}' in {context}")]
    MissingSection { heading: String, context: String },

    #[error("Missing field '{field}' in {context}")]
    MissingField { field: String, context: String },

    #[error("Value out of range for {field}: {value}")]
    OutOfRange { field: String, value: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is {status}, expected running")]
    NotRunning { id: Uuid, status: String },

    #[error("Phase '{phase}' of job {id} depends on missing checkpoint '{missing}'")]
    MissingCheckpoint {
        id: Uuid,
        phase: String,
        missing: String,
    },

    #[error("Invalid job input for {id}: {reason}")]
    InvalidInput { id: Uuid, reason: String },

    #[error("No credential registered for owner {owner_ref}")]
    MissingCredential { owner_ref: String },

    #[error("Credential for owner {owner_ref} is flagged invalid: {reason}")]
    CredentialInvalid { owner_ref: String, reason: String },

    #[error("No pipeline registered for job type {job_type}")]
    UnknownJobType { job_type: String },
}
