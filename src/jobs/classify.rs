//! Failure classification.
//!
//! Every error that aborts a job run is labelled with an [`ErrorKind`]; the
//! kind decides what else happens (credential invalidation for `Auth`) and
//! is persisted next to the message.

use crate::error::{Error, JobError, LlmError};
use crate::jobs::ErrorKind;

/// Label a failure that aborted a job run.
pub fn classify(error: &Error) -> ErrorKind {
    match error {
        Error::Llm(e) => classify_llm(e),
        Error::Parse(_) => ErrorKind::MalformedOutput,
        Error::Job(JobError::MissingCredential { .. } | JobError::CredentialInvalid { .. }) => {
            ErrorKind::Auth
        }
        _ => ErrorKind::Unknown,
    }
}

fn classify_llm(error: &LlmError) -> ErrorKind {
    match error {
        LlmError::AuthFailed { .. } => ErrorKind::Auth,
        LlmError::RateLimited { .. } | LlmError::Overloaded { .. } | LlmError::Timeout { .. } => {
            ErrorKind::Transient
        }
        LlmError::RequestFailed { .. }
        | LlmError::InvalidResponse { .. }
        | LlmError::Http { .. }
        | LlmError::Json(_) => ErrorKind::Unknown,
    }
}

/// The `error_message` persisted on the job row.
pub fn failure_message(kind: ErrorKind, error: &Error) -> String {
    match kind {
        ErrorKind::Auth => format!(
            "auth: {error}; the owner's credential has been flagged invalid and must be replaced before re-queueing"
        ),
        ErrorKind::Transient => format!(
            "transient: {error}; safe to re-queue, completed phases will not be repeated"
        ),
        ErrorKind::MalformedOutput => format!("malformed_output: {error}"),
        ErrorKind::Unknown => format!("unknown: {error}"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;
    use crate::error::{DatabaseError, ParseError};
    use crate::llm::anthropic::error_for_status;

    fn http(status: u16) -> Error {
        Error::Llm(error_for_status(status, None, String::new()))
    }

    #[test]
    fn provider_statuses() {
        assert_eq!(classify(&http(401)), ErrorKind::Auth);
        assert_eq!(classify(&http(403)), ErrorKind::Auth);
        assert_eq!(classify(&http(429)), ErrorKind::Transient);
        assert_eq!(classify(&http(529)), ErrorKind::Transient);
        assert_eq!(classify(&http(503)), ErrorKind::Transient);
        assert_eq!(classify(&http(500)), ErrorKind::Unknown);
        assert_eq!(classify(&http(400)), ErrorKind::Unknown);
    }

    #[test]
    fn timeouts_are_transient() {
        let err = Error::Llm(LlmError::Timeout {
            provider: "anthropic".into(),
            timeout: Duration::from_secs(600),
        });
        assert_eq!(classify(&err), ErrorKind::Transient);
    }

    #[test]
    fn parse_failures_are_malformed_output() {
        let err = Error::Parse(ParseError::MissingJson {
            context: "classify".into(),
        });
        assert_eq!(classify(&err), ErrorKind::MalformedOutput);
    }

    #[test]
    fn credential_problems_are_auth() {
        let err = Error::Job(JobError::MissingCredential {
            owner_ref: "acme".into(),
        });
        assert_eq!(classify(&err), ErrorKind::Auth);
    }

    #[test]
    fn everything_else_is_unknown() {
        let err = Error::Database(DatabaseError::Query("disk I/O error".into()));
        assert_eq!(classify(&err), ErrorKind::Unknown);
        let err = Error::Job(JobError::NotFound { id: Uuid::new_v4() });
        assert_eq!(classify(&err), ErrorKind::Unknown);
    }

    #[test]
    fn message_is_prefixed_with_kind() {
        let err = http(429);
        let message = failure_message(ErrorKind::Transient, &err);
        assert!(message.starts_with("transient: "));
        assert!(message.contains("safe to re-queue"));

        let err = http(500);
        assert!(failure_message(ErrorKind::Unknown, &err).starts_with("unknown: "));
    }
}
