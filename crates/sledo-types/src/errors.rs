use thiserror::Error;

use crate::trial::{TrialId, TrialState};

/// Main error type for SLEDO
#[derive(Error, Debug)]
pub enum SledoError {
    #[error("Invalid search space: {0}")]
    InvalidSearchSpace(#[from] SearchSpaceError),

    #[error("Invalid proposal from {algorithm}: {reason}")]
    InvalidProposal { algorithm: String, reason: String },

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Trial error: {0}")]
    Trial(#[from] TrialError),

    #[error("No trial has reached a terminal state yet")]
    NoResults,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Search space validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchSpaceError {
    #[error("search space declares no parameters")]
    Empty,

    #[error("duplicate parameter name: {name}")]
    DuplicateName { name: String },

    #[error("parameter {name} has unsupported kind: {kind}")]
    UnsupportedKind { name: String, kind: String },

    #[error("parameter {name} has invalid bounds [{low}, {high}]: {reason}")]
    InvalidBounds {
        name: String,
        low: f64,
        high: f64,
        reason: String,
    },

    #[error("parameter {name} is missing {field}")]
    MissingField { name: String, field: String },

    #[error("categorical parameter {name} declares no values")]
    EmptyChoices { name: String },
}

/// Failure of a single design evaluation. Recovered per trial; never aborts a run.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("invalid input {parameter}: {message}")]
    InvalidInput { parameter: String, message: String },

    #[error("evaluation process failed with {status}: {stderr}")]
    ProcessFailed { status: String, stderr: String },

    #[error("evaluation timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    #[error("malformed evaluator output: {message}")]
    MalformedOutput { message: String },

    #[error("metric mismatch: expected {expected:?}, got {found:?}")]
    MetricMismatch {
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("metric {metric} is not finite")]
    NonFiniteMetric { metric: String },

    #[error("evaluator panicked: {message}")]
    Panicked { message: String },

    #[error("{0}")]
    Other(String),
}

/// Checkpoint boundary violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CheckpointError {
    #[error("cannot checkpoint while trials are in flight: {trial_ids:?}")]
    Unsafe { trial_ids: Vec<TrialId> },

    #[error("incompatible checkpoint: found {found}, expected {expected}")]
    Incompatible { found: String, expected: String },

    #[error("checkpoint was written by search algorithm {found}, resuming with {expected}")]
    AlgorithmMismatch { expected: String, found: String },

    #[error("corrupt checkpoint: {message}")]
    Corrupt { message: String },
}

/// Trial lifecycle violations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrialError {
    #[error("trial {trial_id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        trial_id: TrialId,
        from: TrialState,
        to: TrialState,
    },
}

/// Raised by a search algorithm that cannot produce another distinct candidate.
///
/// This is an expected terminal condition, not a failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("search algorithm {algorithm} has no further candidates")]
pub struct SearchExhausted {
    pub algorithm: String,
}

/// Result type alias for SLEDO operations
pub type SledoResult<T> = Result<T, SledoError>;

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::SledoError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SledoError::Config(format!($($arg)*))
    };
}
