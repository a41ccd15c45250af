//! Error types for kyrorules.
//!
//! All errors are strongly typed using thiserror. Evaluation failures carry an
//! [`ErrorKind`] so callers can tell a rule that concluded "false/absent" apart
//! from an engine that gave up.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::StoreError;

/// Coarse classification of evaluation failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A rule raised a logic error (or a strict boundary turned "absent" into an error).
    Generic,
    /// Data is missing. Only ever an `Outcome` tag, never surfaced to callers.
    NotLoaded,
    /// A referenced rule identifier has no registered unit.
    RulesNotFound,
    /// The pass or time budget ran out while data was still missing.
    Timeout,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Generic => write!(f, "generic"),
            Self::NotLoaded => write!(f, "not_loaded"),
            Self::RulesNotFound => write!(f, "rules_not_found"),
            Self::Timeout => write!(f, "timeout"),
        }
    }
}

/// Why the resolution loop stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// The configured number of fetch rounds was used up.
    MaxPasses,
    /// The wall-clock budget elapsed.
    Deadline,
    /// Every fetch the unit still asked for had already been served.
    NoProgress,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxPasses => write!(f, "max passes exceeded"),
            Self::Deadline => write!(f, "deadline exceeded"),
            Self::NoProgress => write!(f, "no progress"),
        }
    }
}

/// Validation errors that occur before evaluation starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Invalid options: {reason}")]
    InvalidOptions {
        reason: String,
    },

    #[error("Queryable name cannot be empty")]
    EmptyQueryable,

    #[error("Rule identifier cannot be empty")]
    EmptyRuleId,

    #[error("Field path cannot be empty")]
    EmptyFieldPath,

    #[error("Rule '{rule}' is already registered")]
    DuplicateRule {
        rule: String,
    },

    #[error("Invalid condition: {reason}")]
    InvalidCondition {
        reason: String,
    },
}

/// Evaluation errors carried by `Outcome::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("Rule failed: {message}")]
    Generic {
        message: String,
    },

    #[error("Not found: {what}")]
    NotFound {
        what: String,
    },

    #[error("No rule registered for '{rule}'")]
    RulesNotFound {
        rule: String,
    },

    #[error("Evaluation timed out ({reason}) after {passes} passes and {elapsed_ms}ms")]
    Timeout {
        reason: AbortReason,
        passes: usize,
        elapsed_ms: u64,
    },

    #[error("Store error: {message}")]
    Store {
        message: String,
    },

    #[error("Unbound reference: {name}")]
    Unbound {
        name: String,
    },
}

impl EvalError {
    /// Creates a generic rule error.
    #[must_use]
    pub fn generic(message: impl Into<String>) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Creates a missing-rule error.
    #[must_use]
    pub fn rules_not_found(rule: impl Into<String>) -> Self {
        Self::RulesNotFound { rule: rule.into() }
    }

    /// Returns the coarse kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Generic { .. }
            | Self::NotFound { .. }
            | Self::Store { .. }
            | Self::Unbound { .. } => ErrorKind::Generic,
            Self::RulesNotFound { .. } => ErrorKind::RulesNotFound,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

impl From<StoreError> for EvalError {
    fn from(err: StoreError) -> Self {
        Self::Store {
            message: err.to_string(),
        }
    }
}

/// Top-level error type for kyrorules.
#[derive(Debug, Error)]
pub enum RuleError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvalError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl RuleError {
    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is an evaluation error.
    #[must_use]
    pub const fn is_evaluation(&self) -> bool {
        matches!(self, Self::Evaluation(_))
    }

    /// Returns true if the engine gave up on its budget.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Evaluation(EvalError::Timeout { .. }))
    }

    /// Returns the evaluation error kind, if this is an evaluation error.
    #[must_use]
    pub const fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Evaluation(e) => Some(e.kind()),
            Self::Store(_) => Some(ErrorKind::Generic),
            Self::Validation(_) => None,
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// Only budget exhaustion is worth retrying (with a larger budget or a warm cache).
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.is_timeout()
    }
}

/// Result type alias for kyrorules operations.
pub type RuleResult<T> = Result<T, RuleError>;
