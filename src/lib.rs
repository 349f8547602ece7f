//! Disk benchmark orchestration service for QLab-style show workloads.
//!
//! The service drives an external benchmark worker (FIO) through
//! long-running, show-shaped disk tests, survives operator disconnects and
//! service restarts, and grades results against show-profile thresholds.
//!
//! The system is organized into functional modules:
//! - **error**: Unified error type hierarchy
//! - **models**: Core record types (tests, profiles, summaries, gradings)
//! - **planner**: Profile templates -> concrete worker job plans
//! - **parser**: Worker JSON output -> canonical summaries
//! - **evaluator**: Summaries -> pass/fail gradings
//! - **supervisor**: Worker process-group lifecycle (spawn/signal/reap)
//! - **store**: Durable SQLite test state with recovery queries
//! - **orchestrator**: Admission, lifecycle, restart recovery, cleanup
//! - **worker**: Worker binary resolution and invocation contract
//! - **disks**: Mounted-volume enumeration for the disk picker
//! - **server**: Loopback HTTP/JSON bridge for the web UI
//! - **logger**: Decoupled file logging behind the `log` facade

// Core foundational modules
pub mod error;
pub mod models;

// Service configuration
pub mod config;

// Workload planning and result handling
pub mod evaluator;
pub mod parser;
pub mod planner;

// Worker integration and process supervision
pub mod supervisor;
pub mod worker;

// Durable state
pub mod store;

// Orchestration and recovery
pub mod orchestrator;

// System probing
pub mod disks;

// HTTP/JSON bridge
pub mod server;

// Decoupled logging pipeline
pub mod logger;

// Re-export the log crate for macro usage
pub use log;

pub use error::{BenchError, Result};
pub use models::{ProfileId, Summary, TestId, TestRecord, TestState, Verdict};
pub use orchestrator::Orchestrator;
