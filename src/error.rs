//! Unified error type hierarchy for the diskbench service.
//!
//! Provides structured error handling with ResolverError, PlanError,
//! ParseError, SupervisorError, StoreError, and the top-level BenchError.

use std::io;
use thiserror::Error;

/// Worker binary resolution errors.
///
/// Both variants carry an installation hint so the operator always knows
/// how to get a usable worker onto the machine.
#[derive(Error, Debug)]
pub enum ResolverError {
    #[error("benchmark worker not found: {hint}")]
    WorkerMissing { hint: String },

    #[error("benchmark worker at {path} is unusable: {hint}")]
    WorkerUnusable { path: String, hint: String },
}

impl ResolverError {
    /// Installation hint attached to the failure.
    pub fn hint(&self) -> &str {
        match self {
            ResolverError::WorkerMissing { hint } => hint,
            ResolverError::WorkerUnusable { hint, .. } => hint,
        }
    }
}

/// Workload planning errors.
#[derive(Error, Debug)]
pub enum PlanError {
    #[error("unknown test profile: {0}")]
    UnknownProfile(String),

    #[error("refusing to test system-critical path: {0}")]
    SystemPath(String),

    #[error("invalid target path: {0}")]
    InvalidTarget(String),

    #[error("insufficient free space: need {required_gb:.1} GB, {available_gb:.1} GB available")]
    InsufficientSpace {
        required_gb: f64,
        available_gb: f64,
    },
}

/// Worker output parsing errors.
///
/// Missing optional fields never produce an error; only structural failures
/// (no balanced JSON object, or a document that is not valid JSON) do.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("no balanced JSON object in worker output (scanned from byte {position}): {excerpt}")]
    NoJsonObject { position: usize, excerpt: String },

    #[error("worker output is not valid JSON: {excerpt}")]
    InvalidJson { excerpt: String },
}

impl ParseError {
    /// Short excerpt of the offending output, for operator-facing records.
    pub fn excerpt(&self) -> &str {
        match self {
            ParseError::NoJsonObject { excerpt, .. } => excerpt,
            ParseError::InvalidJson { excerpt } => excerpt,
        }
    }
}

/// Process supervision errors.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to spawn worker process: {0}")]
    SpawnFailed(String),

    #[error("worker stdout/stderr pipe unavailable: {0}")]
    PipeUnavailable(String),

    #[error("IO error while supervising worker: {0}")]
    Io(#[from] io::Error),
}

/// State store errors.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to encode result blob: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("test not found: {0}")]
    NotFound(String),

    #[error("IO error on state directory: {0}")]
    Io(#[from] io::Error),
}

/// Global error type for the orchestrator's public surface.
///
/// Every named failure kind from the service contract is a first-class
/// variant; callers match on the variant instead of string-typing.
#[derive(Error, Debug)]
pub enum BenchError {
    #[error(transparent)]
    WorkerUnavailable(#[from] ResolverError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("failed to launch worker: {0}")]
    Launch(String),

    #[error("worker exited with code {return_code}: {stderr_tail}")]
    WorkerFailed {
        return_code: i32,
        stderr_tail: String,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("supervision deadline of {deadline_secs}s exceeded")]
    DeadlineExceeded { deadline_secs: u64 },

    #[error("a test is already running (id: {0})")]
    AlreadyRunning(String),

    #[error("test not found: {0}")]
    NotFound(String),

    #[error("test {id} is not stoppable (status: {state})")]
    NotStoppable { id: String, state: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl BenchError {
    /// Get a user-facing error message suitable for API responses.
    pub fn user_message(&self) -> String {
        match self {
            BenchError::WorkerUnavailable(e) => format!("{} ({})", e, e.hint()),
            other => other.to_string(),
        }
    }
}

/// Top-level result type for fallible service operations.
pub type Result<T> = std::result::Result<T, BenchError>;
