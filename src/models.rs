//! Core data structures shared across the diskbench service.
//!
//! Records are explicit types with named fields; the only place legacy
//! profile aliases are interpreted is [`ProfileId::parse`], which the
//! orchestrator calls at admission.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Opaque unique identifier of one test instance.
///
/// Generated by the orchestrator at admission; the wire format matches the
/// historical `test_<timestamp>` shape the web UI already links against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(pub String);

impl TestId {
    /// Mint a fresh id from the wall clock plus a process-local sequence,
    /// so ids stay unique under rapid admission.
    pub fn generate() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SEQUENCE: AtomicU64 = AtomicU64::new(0);
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        TestId(format!("test_{}_{seq}", Utc::now().timestamp_millis()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TestId {
    fn from(s: &str) -> Self {
        TestId(s.to_string())
    }
}

/// Closed set of named workload profiles.
///
/// Legacy aliases from the first-generation web UI are accepted on input
/// and normalised here; everything downstream sees canonical values only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileId {
    /// Short mixed read test, ~1 minute.
    QuickMaxMix,
    /// Multi-phase realistic ProRes 422 show, ~2.5 hours.
    Prores422Real,
    /// Higher-bitrate ProRes HQ show, ~2.5 hours.
    Prores422HqReal,
    /// Graduated sustained throughput test, ~1.5 hours.
    ThermalMaximum,
}

impl ProfileId {
    /// All profiles, in UI presentation order.
    pub const ALL: [ProfileId; 4] = [
        ProfileId::QuickMaxMix,
        ProfileId::Prores422Real,
        ProfileId::Prores422HqReal,
        ProfileId::ThermalMaximum,
    ];

    /// Parse a canonical name or legacy alias. Returns `None` for anything
    /// outside the closed set.
    pub fn parse(name: &str) -> Option<ProfileId> {
        match name {
            "quick_max_mix" | "quick_max_speed" => Some(ProfileId::QuickMaxMix),
            "prores_422_real" | "qlab_prores_422_show" => Some(ProfileId::Prores422Real),
            "prores_422_hq_real" | "qlab_prores_hq_show" => Some(ProfileId::Prores422HqReal),
            "thermal_maximum" | "max_sustained" => Some(ProfileId::ThermalMaximum),
            _ => None,
        }
    }

    /// Canonical wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileId::QuickMaxMix => "quick_max_mix",
            ProfileId::Prores422Real => "prores_422_real",
            ProfileId::Prores422HqReal => "prores_422_hq_real",
            ProfileId::ThermalMaximum => "thermal_maximum",
        }
    }

    /// Human-readable profile title, matching the UI test cards.
    pub fn title(&self) -> &'static str {
        match self {
            ProfileId::QuickMaxMix => "Quick Speed Test",
            ProfileId::Prores422Real => "ProRes 422 Production Test",
            ProfileId::Prores422HqReal => "ProRes HQ Production Test",
            ProfileId::ThermalMaximum => "Max Sustained Performance",
        }
    }

    /// Estimated wall-clock duration of the whole plan, in seconds.
    pub fn estimated_duration_secs(&self) -> u64 {
        match self {
            ProfileId::QuickMaxMix => 60,
            ProfileId::Prores422Real => 9_300,
            ProfileId::Prores422HqReal => 9_300,
            ProfileId::ThermalMaximum => 5_400,
        }
    }

    /// Minimum usable test-file size in GiB. Requests below the floor are
    /// raised to it by the planner.
    pub fn size_floor_gb(&self) -> f64 {
        match self {
            ProfileId::QuickMaxMix => 0.1,
            ProfileId::Prores422Real => 50.0,
            ProfileId::Prores422HqReal => 50.0,
            ProfileId::ThermalMaximum => 100.0,
        }
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a test record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestState {
    /// Admitted, worker not yet spawned.
    Starting,
    /// Worker process alive and owned by this service instance.
    Running,
    /// Clean worker exit with parseable output.
    Completed,
    /// Non-zero exit, unparseable output, or lost orphan.
    Failed,
    /// Explicitly stopped by the operator.
    Stopped,
    /// Supervision wall-clock deadline expired.
    Timeout,
    /// Survived a service restart with its process still alive; not adopted.
    Disconnected,
    /// Recovery could not determine what happened to the worker.
    Unknown,
}

impl TestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestState::Starting => "starting",
            TestState::Running => "running",
            TestState::Completed => "completed",
            TestState::Failed => "failed",
            TestState::Stopped => "stopped",
            TestState::Timeout => "timeout",
            TestState::Disconnected => "disconnected",
            TestState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Option<TestState> {
        match s {
            "starting" => Some(TestState::Starting),
            "running" => Some(TestState::Running),
            "completed" => Some(TestState::Completed),
            "failed" => Some(TestState::Failed),
            "stopped" => Some(TestState::Stopped),
            "timeout" => Some(TestState::Timeout),
            "disconnected" => Some(TestState::Disconnected),
            "unknown" => Some(TestState::Unknown),
            _ => None,
        }
    }

    /// Terminal states are immutable except for history pruning.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TestState::Completed
                | TestState::Failed
                | TestState::Stopped
                | TestState::Timeout
                | TestState::Unknown
        )
    }

    /// States that block admission of a new test.
    pub fn blocks_admission(&self) -> bool {
        matches!(
            self,
            TestState::Starting | TestState::Running | TestState::Disconnected
        )
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of an admitted test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub id: TestId,
    /// Canonical profile. Aliases never survive admission.
    pub profile: ProfileId,
    /// The profile name exactly as the caller sent it, for echoing back.
    pub requested_profile: String,
    /// Mounted volume (or legacy raw-device path) under test.
    pub target_path: PathBuf,
    /// Test-file size in GB after planner clamping.
    pub size_gb: f64,
    /// Planned wall-clock duration in seconds.
    pub estimated_duration_secs: u64,
    /// Worker JSON artifact path, owned by the orchestrator.
    pub output_path: PathBuf,
}

/// Canonical parsed worker output, unit-normalised.
///
/// Bandwidths are KiB/s, latencies are milliseconds, runtime is
/// milliseconds. Missing values are zero, never a sentinel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub read_bw_kib: f64,
    pub write_bw_kib: f64,
    pub read_iops: f64,
    pub write_iops: f64,
    pub avg_read_latency_ms: f64,
    pub avg_write_latency_ms: f64,
    pub max_runtime_ms: u64,
    /// Σ per-job bw_min / Σ per-job bw_mean across read legs, when the
    /// worker reports those fields.
    pub stability_ratio: Option<f64>,
}

impl Summary {
    /// Read bandwidth in MiB/s, the unit the thresholds are written in.
    pub fn read_bw_mb(&self) -> f64 {
        self.read_bw_kib / 1024.0
    }

    /// Write bandwidth in MiB/s.
    pub fn write_bw_mb(&self) -> f64 {
        self.write_bw_kib / 1024.0
    }
}

/// Verdict of grading a summary against show-profile thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Excellent,
    Pass,
    Fail,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Excellent => "excellent",
            Verdict::Pass => "pass",
            Verdict::Fail => "fail",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Threshold set one profile is graded against (MiB/s, ms, ratios).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_bw_mb: f64,
    pub rec_bw_mb: Option<f64>,
    pub excellent_bw_mb: Option<f64>,
    pub max_latency_ms: f64,
    pub min_read_iops: Option<f64>,
    pub min_stability_ratio: Option<f64>,
}

/// Result of applying profile thresholds to a summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grading {
    pub profile: ProfileId,
    pub read_bw_mb: f64,
    pub read_iops: f64,
    pub avg_read_latency_ms: f64,
    pub stability_ratio: Option<f64>,
    pub thresholds: Thresholds,
    pub verdict: Verdict,
    /// Populated when the verdict is `fail`; one entry per violated bound.
    pub reasons: Vec<String>,
}

/// Full observable state of one test: the request plus everything the
/// orchestrator has learned about it since.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: TestId,
    pub state: TestState,
    pub profile: ProfileId,
    pub requested_profile: String,
    pub target_path: PathBuf,
    pub size_gb: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub pid: Option<i32>,
    pub pgid: Option<i32>,
    pub estimated_duration_secs: u64,
    pub output_path: PathBuf,
    pub summary: Option<Summary>,
    pub grading: Option<Grading>,
    pub error: Option<String>,
    /// Derived completion percentage (0-100). 100 only after a terminal
    /// transition; capped at 95 while running.
    pub progress: f64,
}

impl TestRecord {
    /// Build the initial record for a freshly admitted request.
    pub fn starting(request: &TestRequest) -> Self {
        TestRecord {
            id: request.id.clone(),
            state: TestState::Starting,
            profile: request.profile,
            requested_profile: request.requested_profile.clone(),
            target_path: request.target_path.clone(),
            size_gb: request.size_gb,
            started_at: Utc::now(),
            completed_at: None,
            pid: None,
            pgid: None,
            estimated_duration_secs: request.estimated_duration_secs,
            output_path: request.output_path.clone(),
            summary: None,
            grading: None,
            error: None,
            progress: 0.0,
        }
    }

    /// Seconds elapsed since the test started.
    pub fn elapsed_secs(&self) -> f64 {
        let end = self.completed_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds() as f64 / 1000.0
    }

    /// Recompute the derived progress estimate from elapsed time.
    pub fn refresh_progress(&mut self) {
        self.progress = if self.state.is_terminal() {
            100.0
        } else if self.state == TestState::Running && self.estimated_duration_secs > 0 {
            (self.elapsed_secs() / self.estimated_duration_secs as f64 * 100.0).min(95.0)
        } else {
            self.progress
        };
    }
}

/// One mounted filesystem as reported by `/api/disks`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    pub name: String,
    pub device: String,
    pub mount_point: String,
    pub size: String,
    pub size_bytes: u64,
    pub free_space: String,
    pub free_space_bytes: u64,
    pub file_system: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub writable: bool,
    pub removable: bool,
    pub suitable_for_testing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_parse_canonical() {
        assert_eq!(
            ProfileId::parse("quick_max_mix"),
            Some(ProfileId::QuickMaxMix)
        );
        assert_eq!(
            ProfileId::parse("thermal_maximum"),
            Some(ProfileId::ThermalMaximum)
        );
        assert_eq!(ProfileId::parse("warp_drive"), None);
    }

    #[test]
    fn test_profile_parse_legacy_aliases() {
        assert_eq!(
            ProfileId::parse("quick_max_speed"),
            Some(ProfileId::QuickMaxMix)
        );
        assert_eq!(
            ProfileId::parse("qlab_prores_422_show"),
            Some(ProfileId::Prores422Real)
        );
        assert_eq!(
            ProfileId::parse("qlab_prores_hq_show"),
            Some(ProfileId::Prores422HqReal)
        );
        assert_eq!(
            ProfileId::parse("max_sustained"),
            Some(ProfileId::ThermalMaximum)
        );
    }

    #[test]
    fn test_canonicalisation_is_idempotent() {
        for profile in ProfileId::ALL {
            let canonical = profile.as_str();
            assert_eq!(ProfileId::parse(canonical), Some(profile));
            // A second round through the table changes nothing.
            assert_eq!(
                ProfileId::parse(ProfileId::parse(canonical).unwrap().as_str()),
                Some(profile)
            );
        }
    }

    #[test]
    fn test_terminal_states() {
        assert!(TestState::Completed.is_terminal());
        assert!(TestState::Failed.is_terminal());
        assert!(TestState::Stopped.is_terminal());
        assert!(TestState::Timeout.is_terminal());
        assert!(TestState::Unknown.is_terminal());
        assert!(!TestState::Starting.is_terminal());
        assert!(!TestState::Running.is_terminal());
        assert!(!TestState::Disconnected.is_terminal());
    }

    #[test]
    fn test_admission_blocking_states() {
        assert!(TestState::Running.blocks_admission());
        assert!(TestState::Disconnected.blocks_admission());
        assert!(!TestState::Completed.blocks_admission());
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            TestState::Starting,
            TestState::Running,
            TestState::Completed,
            TestState::Failed,
            TestState::Stopped,
            TestState::Timeout,
            TestState::Disconnected,
            TestState::Unknown,
        ] {
            assert_eq!(TestState::parse(state.as_str()), Some(state));
        }
    }

    #[test]
    fn test_summary_unit_conversion() {
        let summary = Summary {
            read_bw_kib: 614_400.0,
            ..Default::default()
        };
        assert!((summary.read_bw_mb() - 600.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_record_progress_caps_at_95_while_running() {
        let request = TestRequest {
            id: TestId::generate(),
            profile: ProfileId::QuickMaxMix,
            requested_profile: "quick_max_speed".to_string(),
            target_path: PathBuf::from("/Volumes/Scratch"),
            size_gb: 1.0,
            estimated_duration_secs: 1,
            output_path: PathBuf::from("/tmp/out.json"),
        };
        let mut record = TestRecord::starting(&request);
        record.state = TestState::Running;
        record.started_at = Utc::now() - chrono::Duration::seconds(3600);
        record.refresh_progress();
        assert!((record.progress - 95.0).abs() < f64::EPSILON);

        record.state = TestState::Completed;
        record.refresh_progress();
        assert!((record.progress - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_test_id_display_shape() {
        let id = TestId::generate();
        assert!(id.as_str().starts_with("test_"));
    }
}
