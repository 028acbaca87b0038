// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;

use thiserror::Error;

use crate::app::types::{DecisionRecord, JobState, StateTransition};

pub mod codes {
    pub const AUTHENTICATION_FAILURE: &str = "authentication_failure";
    pub const CONNECTION_FAILURE: &str = "connection_failure";
    pub const NETWORK_ERROR: &str = "network_error";
    pub const TIMEOUT: &str = "timeout";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const CONFLICT: &str = "conflict";
    pub const INTERNAL_ERROR: &str = "internal_error";
    pub const CANCELED: &str = "canceled";
    pub const REMOTE_ERROR: &str = "remote_error";
    pub const LOCAL_ERROR: &str = "local_error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppErrorKind {
    InvalidArgument,
    NotFound,
    Conflict,
    Internal,
    Aborted,
    Cancelled,
    DeadlineExceeded,
}

/// Error surfaced by ports and adapters.
#[derive(Debug, Clone)]
pub struct AppError {
    kind: AppErrorKind,
    code: &'static str,
    message: String,
    context: Option<String>,
}

impl AppError {
    pub fn new(kind: AppErrorKind, code: &'static str) -> Self {
        Self {
            kind,
            code,
            message: code.to_string(),
            context: None,
        }
    }

    pub fn with_message(
        kind: AppErrorKind,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
            context: None,
        }
    }

    pub fn timeout(operation: &str) -> Self {
        Self::with_message(
            AppErrorKind::DeadlineExceeded,
            codes::TIMEOUT,
            format!("{operation} exceeded its deadline"),
        )
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn kind(&self) -> AppErrorKind {
        self.kind
    }

    pub fn code(&self) -> &'static str {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Connection drops, I/O failures on an open channel and missed deadlines
    /// are worth retrying. Authentication and argument errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.code,
            codes::CONNECTION_FAILURE | codes::NETWORK_ERROR | codes::TIMEOUT | codes::REMOTE_ERROR
        )
    }

    pub fn is_not_found(&self) -> bool {
        self.code == codes::NOT_FOUND
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ctx) = &self.context {
            write!(f, "{} ({})", self.message, ctx)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

/// A role that failed its structural check, with the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRole {
    pub role: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error(
    "invalid bundle: missing roles {missing_roles:?}, empty roles {empty_roles:?}, malformed roles {}",
    format_malformed(.malformed_roles)
)]
pub struct ValidationError {
    pub missing_roles: Vec<String>,
    pub empty_roles: Vec<String>,
    pub malformed_roles: Vec<MalformedRole>,
}

impl ValidationError {
    pub fn is_empty(&self) -> bool {
        self.missing_roles.is_empty()
            && self.empty_roles.is_empty()
            && self.malformed_roles.is_empty()
    }

    /// Every role named by this error, in the order missing, empty, malformed.
    pub fn roles(&self) -> impl Iterator<Item = &str> {
        self.missing_roles
            .iter()
            .map(String::as_str)
            .chain(self.empty_roles.iter().map(String::as_str))
            .chain(self.malformed_roles.iter().map(|m| m.role.as_str()))
    }
}

fn format_malformed(roles: &[MalformedRole]) -> String {
    let parts: Vec<String> = roles
        .iter()
        .map(|m| format!("{} ({})", m.role, m.reason))
        .collect();
    format!("[{}]", parts.join(", "))
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("scheduler rejected the job (exit code {exit_code}): {detail}")]
    Rejected { exit_code: i32, detail: String },
    #[error("could not read a job id from scheduler output: {output:?}")]
    UnparsableJobId { output: String },
    #[error("invalid submission: {0}")]
    InvalidRequest(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerateError {
    #[error("no generator registered for role {0}")]
    NoGenerator(String),
    #[error("missing parameters for role {role}: {detail}")]
    MissingParams { role: String, detail: String },
    #[error("generated {role} failed validation: {source}")]
    Invalid {
        role: String,
        #[source]
        source: ValidationError,
    },
}

/// Why supervision of a job stopped without success.
#[derive(Debug, Clone, Error)]
pub enum JobFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("transport failure: {0}")]
    Transport(AppError),
    #[error(transparent)]
    Submission(#[from] SubmissionError),
    #[error("job outcome is ambiguous: {0}")]
    Interrupted(String),
    #[error("recovery exhausted after {attempts} attempts")]
    RecoveryExhausted { attempts: u32 },
    #[error("unrecoverable failure: {0}")]
    Unrecoverable(String),
    #[error("scheduler still reports job {scheduler_id} as running after cancellation")]
    Cancellation { scheduler_id: String },
    #[error("job was cancelled")]
    Cancelled,
    #[error("result collection failed: {0}")]
    Collection(AppError),
    #[error("job {0} is already under supervision")]
    Conflict(String),
    #[error("summary store failure: {0}")]
    Store(AppError),
}

/// Terminal error returned by the controller. Carries enough of the job's
/// record for a human to see why automatic recovery stopped.
#[derive(Debug, Clone, Error)]
#[error(
    "{failure} [last state: {last_state}, last decision: {}]",
    .last_decision.as_deref().unwrap_or("none")
)]
pub struct JobError {
    pub failure: JobFailure,
    pub last_state: JobState,
    pub last_decision: Option<String>,
    pub history: Vec<StateTransition>,
    pub decisions: Vec<DecisionRecord>,
}

impl JobError {
    pub fn bare(failure: JobFailure, last_state: JobState) -> Self {
        Self {
            failure,
            last_state,
            last_decision: None,
            history: Vec::new(),
            decisions: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_codes_are_retryable() {
        assert!(AppError::timeout("poll").is_transient());
        assert!(AppError::new(AppErrorKind::Aborted, codes::CONNECTION_FAILURE).is_transient());
        assert!(
            !AppError::new(AppErrorKind::Aborted, codes::AUTHENTICATION_FAILURE).is_transient()
        );
        assert!(!AppError::new(AppErrorKind::NotFound, codes::NOT_FOUND).is_transient());
    }

    #[test]
    fn validation_error_lists_every_role() {
        let err = ValidationError {
            missing_roles: vec!["parameters".into()],
            empty_roles: vec!["k-mesh".into()],
            malformed_roles: vec![MalformedRole {
                role: "potentials".into(),
                reason: "no record for Fe".into(),
            }],
        };
        let roles: Vec<&str> = err.roles().collect();
        assert_eq!(roles, vec!["parameters", "k-mesh", "potentials"]);
        assert!(err.to_string().contains("potentials (no record for Fe)"));
    }

    #[test]
    fn job_error_display_includes_state_and_decision() {
        let mut err = JobError::bare(
            JobFailure::RecoveryExhausted { attempts: 3 },
            JobState::Failed,
        );
        assert!(err.to_string().ends_with("last decision: none]"));
        err.last_decision = Some("retry bound reached".into());
        let text = err.to_string();
        assert!(text.contains("last state: failed"));
        assert!(text.contains("retry bound reached"));
    }
}
