//! Workload planning: turns a named profile plus a target device into a
//! concrete worker job plan.
//!
//! Every profile is a fixed template; the planner substitutes the target
//! file path and the (clamped) test size. Profiles are not user
//! configurable; adding one is a code change here, not a config file.

use crate::error::PlanError;
use crate::models::ProfileId;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};

/// Raw-device paths we still accept (deprecated input form).
static RAW_DEVICE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^/dev/(r?disk|nvme|sd)[0-9]+[a-z0-9]*$").unwrap());

/// Fraction of the device's free space a test file may occupy.
const MAX_FREE_SPACE_FRACTION: f64 = 0.25;

/// Mount points that must never host a test file.
const SYSTEM_CRITICAL_PATHS: [&str; 6] = ["/", "/System", "/usr", "/bin", "/sbin", "/etc"];

/// One contiguous phase of a workload plan with a fixed I/O pattern.
///
/// Stanzas are ordered and run within a single worker invocation;
/// `start_delay_secs` layers them into phases.
#[derive(Debug, Clone, PartialEq)]
pub struct JobStanza {
    pub name: String,
    /// Worker I/O pattern: `read`, `randread`, or `randrw`.
    pub rw: String,
    /// Read percentage for mixed patterns.
    pub rwmixread: Option<u32>,
    /// Block size, or comma-separated distribution like `1M,64K,4K`.
    pub block_size: String,
    pub iodepth: u32,
    pub numjobs: u32,
    /// Target throughput cap like `400M` or `400M,50M` (read,write).
    pub rate: Option<String>,
    /// Poisson-distributed request arrivals instead of a fixed pace.
    pub poisson_arrivals: bool,
    pub runtime_secs: u64,
    pub start_delay_secs: u64,
    /// Working-set size of this stanza in GB.
    pub size_gb: f64,
    pub thinktime_us: Option<u64>,
    pub thinktime_spin_us: Option<u64>,
}

impl JobStanza {
    fn new(name: &str, rw: &str, block_size: &str, iodepth: u32, numjobs: u32) -> Self {
        JobStanza {
            name: name.to_string(),
            rw: rw.to_string(),
            rwmixread: None,
            block_size: block_size.to_string(),
            iodepth,
            numjobs,
            rate: None,
            poisson_arrivals: false,
            runtime_secs: 0,
            start_delay_secs: 0,
            size_gb: 0.0,
            thinktime_us: None,
            thinktime_spin_us: None,
        }
    }

    /// Wall-clock point at which this stanza finishes.
    pub fn estimated_end_secs(&self) -> u64 {
        self.start_delay_secs + self.runtime_secs
    }
}

/// Ordered stanza sequence submitted as a single worker invocation.
#[derive(Debug, Clone)]
pub struct WorkloadPlan {
    pub profile: ProfileId,
    pub target_file: PathBuf,
    pub size_gb: f64,
    pub stanzas: Vec<JobStanza>,
    /// Set when clamping changed the requested size.
    pub warning: Option<String>,
}

impl WorkloadPlan {
    /// Total wall-clock duration of the plan: the latest stanza end.
    pub fn total_duration_secs(&self) -> u64 {
        self.stanzas
            .iter()
            .map(JobStanza::estimated_end_secs)
            .max()
            .unwrap_or(0)
    }

    /// Render the plan as a worker job file (INI format).
    pub fn to_job_file(&self) -> String {
        let mut out = String::new();
        out.push_str("[global]\n");
        out.push_str("ioengine=posixaio\n");
        out.push_str("direct=0\n");
        out.push_str("time_based=1\n");
        out.push_str("thread=1\n");
        out.push_str("log_avg_msec=1000\n");
        if self.stanzas.len() > 1 {
            out.push_str("group_reporting=1\n");
            out.push_str("lat_percentiles=1\n");
        }
        if self.stanzas.iter().any(|s| s.rw.starts_with("randr")) {
            out.push_str("norandommap=1\n");
            out.push_str("randrepeat=0\n");
            out.push_str("random_generator=tausworthe64\n");
        }
        let log_prefix = self.profile.as_str();
        out.push_str(&format!("write_bw_log={log_prefix}_bw\n"));
        out.push_str(&format!("write_lat_log={log_prefix}_lat\n"));

        for stanza in &self.stanzas {
            out.push('\n');
            out.push_str(&format!("[{}]\n", stanza.name));
            out.push_str(&format!("filename={}\n", self.target_file.display()));
            out.push_str(&format!("size={}\n", format_size_gb(stanza.size_gb)));
            out.push_str(&format!("bs={}\n", stanza.block_size));
            out.push_str(&format!("rw={}\n", stanza.rw));
            if let Some(mix) = stanza.rwmixread {
                out.push_str(&format!("rwmixread={mix}\n"));
            }
            out.push_str(&format!("numjobs={}\n", stanza.numjobs));
            out.push_str(&format!("iodepth={}\n", stanza.iodepth));
            if stanza.runtime_secs > 0 {
                out.push_str(&format!("runtime={}\n", stanza.runtime_secs));
            }
            if let Some(ref rate) = stanza.rate {
                out.push_str(&format!("rate={rate}\n"));
            }
            if stanza.poisson_arrivals {
                out.push_str("rate_process=poisson\n");
            }
            if let Some(tt) = stanza.thinktime_us {
                out.push_str(&format!("thinktime={tt}\n"));
            }
            if let Some(spin) = stanza.thinktime_spin_us {
                out.push_str(&format!("thinktime_spin={spin}\n"));
            }
            if stanza.start_delay_secs > 0 {
                out.push_str(&format!("startdelay={}\n", stanza.start_delay_secs));
            }
        }
        out
    }
}

/// Build a concrete plan for `profile` against `target_path`.
///
/// `available_bytes` is the free space reported for the target device; the
/// planner clamps the test size to 25% of it, with a per-profile floor.
pub fn plan(
    profile: ProfileId,
    target_path: &Path,
    requested_size_gb: f64,
    available_bytes: u64,
) -> Result<WorkloadPlan, PlanError> {
    let (size_gb, warning) = clamp_size(profile, requested_size_gb, available_bytes)?;
    let target_file = resolve_target_file(target_path, size_gb)?;

    let mut stanzas = match profile {
        ProfileId::QuickMaxMix => quick_max_mix_stanzas(),
        ProfileId::Prores422Real => prores_422_stanzas(),
        ProfileId::Prores422HqReal => prores_hq_stanzas(),
        ProfileId::ThermalMaximum => thermal_maximum_stanzas(),
    };
    for stanza in &mut stanzas {
        stanza.size_gb = size_gb;
    }

    Ok(WorkloadPlan {
        profile,
        target_file,
        size_gb,
        stanzas,
        warning,
    })
}

/// Apply the free-space cap and per-profile floor to the requested size.
fn clamp_size(
    profile: ProfileId,
    requested_gb: f64,
    available_bytes: u64,
) -> Result<(f64, Option<String>), PlanError> {
    let available_gb = available_bytes as f64 / 1e9;
    let cap_gb = available_gb * MAX_FREE_SPACE_FRACTION;
    let floor_gb = profile.size_floor_gb();

    if floor_gb > cap_gb {
        return Err(PlanError::InsufficientSpace {
            required_gb: floor_gb,
            available_gb,
        });
    }

    if requested_gb > cap_gb {
        let clamped = cap_gb.max(floor_gb);
        let warning = format!(
            "test size reduced from {requested_gb:.1} GB to {clamped:.1} GB (25% free-space cap)"
        );
        return Ok((clamped, Some(warning)));
    }

    if requested_gb < floor_gb {
        let warning = format!(
            "test size raised from {requested_gb:.1} GB to the {} profile floor of {floor_gb:.1} GB",
            profile.as_str()
        );
        return Ok((floor_gb, Some(warning)));
    }

    Ok((requested_gb, None))
}

/// Place the test file on the volume under test.
///
/// QLab reads media from mounted volumes, so tests run against filesystem
/// files. Legacy raw-device inputs land in the scratch directory instead.
/// System-critical mounts are rejected outright.
fn resolve_target_file(target_path: &Path, size_gb: f64) -> Result<PathBuf, PlanError> {
    let raw = target_path.to_string_lossy();
    if raw.contains("..") || raw.starts_with('~') {
        return Err(PlanError::InvalidTarget(raw.to_string()));
    }

    let trimmed = if raw.len() > 1 {
        raw.trim_end_matches('/')
    } else {
        raw.as_ref()
    };
    if SYSTEM_CRITICAL_PATHS.contains(&trimmed) || trimmed == "/System/Volumes/Data" {
        return Err(PlanError::SystemPath(trimmed.to_string()));
    }

    let file_name = format!("qlab_test_file_{}G", format_size_number(size_gb));
    if trimmed.starts_with("/dev/") {
        // Deprecated raw-device input; redirect to the scratch directory.
        if !RAW_DEVICE_RE.is_match(trimmed) {
            return Err(PlanError::InvalidTarget(trimmed.to_string()));
        }
        return Ok(std::env::temp_dir().join(file_name));
    }

    Ok(PathBuf::from(trimmed).join(file_name))
}

fn format_size_number(size_gb: f64) -> String {
    if (size_gb.fract()).abs() < 1e-9 {
        format!("{:.0}", size_gb)
    } else {
        format!("{:.1}", size_gb)
    }
}

fn format_size_gb(size_gb: f64) -> String {
    format!("{}G", format_size_number(size_gb))
}

/// One stanza: sequential read, 4 MiB blocks, queue depth 32, one minute.
fn quick_max_mix_stanzas() -> Vec<JobStanza> {
    let mut stanza = JobStanza::new("quick_speed_test", "read", "4M", 32, 1);
    stanza.runtime_secs = 60;
    vec![stanza]
}

/// Four phases: warmup, sustained show with Poisson arrivals, peak finale,
/// and a short random-read cue-response phase, layered by start delay.
fn prores_422_stanzas() -> Vec<JobStanza> {
    let mut warmup = JobStanza::new("p422_warmup", "randrw", "1M,64K,4K", 24, 4);
    warmup.rwmixread = Some(93);
    warmup.rate = Some("400M,50M".to_string());
    warmup.runtime_secs = 1_800;

    let mut show = JobStanza::new("p422_show_with_assets", "randrw", "1M,256K,16K", 32, 6);
    show.rwmixread = Some(96);
    show.rate = Some("700M,100M".to_string());
    show.poisson_arrivals = true;
    show.runtime_secs = 5_400;
    show.start_delay_secs = 1_800;
    show.thinktime_us = Some(12_000_000);
    show.thinktime_spin_us = Some(3_000_000);

    let mut peak = JobStanza::new("p422_peak_assets", "randrw", "2M,128K,8K", 48, 8);
    peak.rwmixread = Some(94);
    peak.rate = Some("2000M,200M".to_string());
    peak.poisson_arrivals = true;
    peak.runtime_secs = 1_800;
    peak.start_delay_secs = 7_200;

    let mut cue = JobStanza::new("cue_response", "randread", "4K,64K,1M", 1, 12);
    cue.runtime_secs = 300;
    cue.start_delay_secs = 9_000;

    vec![warmup, show, peak, cue]
}

/// Same phase shape as ProRes 422, at roughly doubled rates and block
/// sizes for the HQ codec's bitrate.
fn prores_hq_stanzas() -> Vec<JobStanza> {
    let mut warmup = JobStanza::new("hq_warmup", "randrw", "2M,128K,8K", 32, 4);
    warmup.rwmixread = Some(93);
    warmup.rate = Some("800M,100M".to_string());
    warmup.runtime_secs = 1_800;

    let mut show = JobStanza::new("hq_show_with_assets", "randrw", "2M,512K,32K", 48, 8);
    show.rwmixread = Some(96);
    show.rate = Some("1400M,200M".to_string());
    show.poisson_arrivals = true;
    show.runtime_secs = 5_400;
    show.start_delay_secs = 1_800;
    show.thinktime_us = Some(8_000_000);
    show.thinktime_spin_us = Some(2_000_000);

    let mut peak = JobStanza::new("hq_peak_assets", "randrw", "4M,256K,16K", 64, 12);
    peak.rwmixread = Some(94);
    peak.rate = Some("4000M,400M".to_string());
    peak.poisson_arrivals = true;
    peak.runtime_secs = 1_800;
    peak.start_delay_secs = 7_200;

    let mut cue = JobStanza::new("hq_cue_response", "randread", "8K,128K,2M", 1, 16);
    cue.runtime_secs = 300;
    cue.start_delay_secs = 9_000;

    vec![warmup, show, peak, cue]
}

/// Graduated rate caps, each held for six minutes, then an unconstrained
/// validation phase. Finds the maximum speed the device sustains without
/// dropouts.
fn thermal_maximum_stanzas() -> Vec<JobStanza> {
    const RATES_MB: [u32; 12] = [
        500, 750, 1_000, 1_250, 1_500, 1_750, 2_000, 2_500, 3_000, 3_500, 4_000, 5_000,
    ];
    let mut stanzas = Vec::with_capacity(RATES_MB.len() + 1);
    for (idx, rate) in RATES_MB.iter().enumerate() {
        let mut stanza = JobStanza::new(&format!("sustained_{rate}M"), "read", "8M", 64, 4);
        stanza.rate = Some(format!("{rate}M"));
        stanza.runtime_secs = 360;
        stanza.start_delay_secs = idx as u64 * 360;
        stanzas.push(stanza);
    }

    // Validation runs uncapped: the device holds whatever it can after the
    // graduated ramp, which is where thermal dropouts show up.
    let mut validation = JobStanza::new("final_validation", "read", "8M", 64, 4);
    validation.runtime_secs = 1_080;
    validation.start_delay_secs = 4_320;
    stanzas.push(validation);

    stanzas
}

#[cfg(test)]
mod tests {
    use super::*;

    const TB: u64 = 1_000_000_000_000;

    #[test]
    fn test_quick_plan_single_read_stanza() {
        let plan = plan(
            ProfileId::QuickMaxMix,
            Path::new("/Volumes/Scratch"),
            1.0,
            TB,
        )
        .unwrap();
        assert_eq!(plan.stanzas.len(), 1);
        let stanza = &plan.stanzas[0];
        assert_eq!(stanza.rw, "read");
        assert_eq!(stanza.block_size, "4M");
        assert_eq!(stanza.iodepth, 32);
        assert_eq!(stanza.runtime_secs, 60);
        assert!(stanza.rate.is_none());
        assert_eq!(plan.total_duration_secs(), 60);
        assert!(plan.warning.is_none());
    }

    #[test]
    fn test_show_plan_phase_layering() {
        let plan = plan(
            ProfileId::Prores422Real,
            Path::new("/Volumes/ShowDrive"),
            60.0,
            TB,
        )
        .unwrap();
        assert_eq!(plan.stanzas.len(), 4);
        // Phases layer by start delay and together span the full estimate.
        let delays: Vec<u64> = plan.stanzas.iter().map(|s| s.start_delay_secs).collect();
        assert_eq!(delays, vec![0, 1_800, 7_200, 9_000]);
        assert_eq!(
            plan.total_duration_secs(),
            ProfileId::Prores422Real.estimated_duration_secs()
        );
        assert!(plan.stanzas[1].poisson_arrivals);
    }

    #[test]
    fn test_thermal_plan_graduated_rates() {
        let plan = plan(
            ProfileId::ThermalMaximum,
            Path::new("/Volumes/ShowDrive"),
            120.0,
            4 * TB,
        )
        .unwrap();
        assert_eq!(plan.stanzas.len(), 13);
        assert_eq!(plan.stanzas[0].rate.as_deref(), Some("500M"));
        assert_eq!(plan.stanzas[11].rate.as_deref(), Some("5000M"));
        assert_eq!(plan.stanzas[12].name, "final_validation");
        assert!(plan.stanzas[12].rate.is_none());
        assert_eq!(
            plan.total_duration_secs(),
            ProfileId::ThermalMaximum.estimated_duration_secs()
        );
    }

    #[test]
    fn test_size_clamped_to_free_space_cap() {
        // 100 GB free: cap is 25 GB.
        let plan = plan(
            ProfileId::QuickMaxMix,
            Path::new("/Volumes/Small"),
            80.0,
            100_000_000_000,
        )
        .unwrap();
        assert!((plan.size_gb - 25.0).abs() < 0.01);
        assert!(plan.warning.is_some());
    }

    #[test]
    fn test_size_raised_to_profile_floor() {
        let plan = plan(
            ProfileId::Prores422Real,
            Path::new("/Volumes/Big"),
            1.0,
            TB,
        )
        .unwrap();
        assert!((plan.size_gb - 50.0).abs() < f64::EPSILON);
        assert!(plan.warning.unwrap().contains("floor"));
    }

    #[test]
    fn test_floor_above_cap_is_insufficient_space() {
        // thermal_maximum needs 100 GB but only 10 GB can be used.
        let err = plan(
            ProfileId::ThermalMaximum,
            Path::new("/Volumes/Tiny"),
            100.0,
            40_000_000_000,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InsufficientSpace { .. }));
    }

    #[test]
    fn test_system_paths_rejected() {
        for path in [
            "/",
            "/System",
            "/usr",
            "/bin",
            "/sbin",
            "/etc",
            "/System/Volumes/Data",
        ] {
            let err = plan(ProfileId::QuickMaxMix, Path::new(path), 1.0, TB).unwrap_err();
            assert!(matches!(err, PlanError::SystemPath(_)), "path {path}");
        }
    }

    #[test]
    fn test_traversal_rejected() {
        let err = plan(
            ProfileId::QuickMaxMix,
            Path::new("/Volumes/../etc"),
            1.0,
            TB,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidTarget(_)));
    }

    #[test]
    fn test_target_file_on_volume() {
        let plan = plan(
            ProfileId::QuickMaxMix,
            Path::new("/Volumes/Scratch"),
            1.0,
            TB,
        )
        .unwrap();
        assert_eq!(
            plan.target_file,
            PathBuf::from("/Volumes/Scratch/qlab_test_file_1G")
        );
    }

    #[test]
    fn test_raw_device_redirected_to_scratch() {
        let plan = plan(ProfileId::QuickMaxMix, Path::new("/dev/disk4"), 1.0, TB).unwrap();
        assert!(plan.target_file.starts_with(std::env::temp_dir()));
    }

    #[test]
    fn test_malformed_device_path_rejected() {
        let err = plan(
            ProfileId::QuickMaxMix,
            Path::new("/dev/disk4; rm -rf"),
            1.0,
            TB,
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::InvalidTarget(_)));
    }

    #[test]
    fn test_job_file_rendering() {
        let plan = plan(
            ProfileId::Prores422Real,
            Path::new("/Volumes/ShowDrive"),
            60.0,
            TB,
        )
        .unwrap();
        let rendered = plan.to_job_file();
        assert!(rendered.starts_with("[global]\n"));
        assert!(rendered.contains("ioengine=posixaio"));
        assert!(rendered.contains("group_reporting=1"));
        assert!(rendered.contains("[p422_show_with_assets]"));
        assert!(rendered.contains("rate=700M,100M"));
        assert!(rendered.contains("rate_process=poisson"));
        assert!(rendered.contains("startdelay=9000"));
        assert!(rendered.contains("filename=/Volumes/ShowDrive/qlab_test_file_60G"));
    }

    #[test]
    fn test_quick_job_file_has_no_rate_cap() {
        let plan = plan(
            ProfileId::QuickMaxMix,
            Path::new("/Volumes/Scratch"),
            1.0,
            TB,
        )
        .unwrap();
        let rendered = plan.to_job_file();
        assert!(!rendered.contains("rate="));
        assert!(rendered.contains("rw=read"));
    }
}
