//! Benchmark worker integration: binary resolution and the invocation
//! contract the orchestrator uses to drive it.

pub mod resolver;

pub use resolver::{resolve, WorkerInfo, WorkerSource};

use crate::supervisor::WorkerSpec;
use std::path::Path;

/// Package-manager prefixes prepended to PATH so a Homebrew-installed
/// worker is found even under a stripped service environment.
pub const PACKAGE_MANAGER_PREFIXES: [&str; 2] = ["/opt/homebrew/bin", "/usr/local/bin"];

/// Build the invocation for one plan run.
///
/// The worker is asked for JSON output into the test's artifact file, with
/// shared-memory features disabled (they fail under sandboxed launches on
/// the platforms this service targets) and TMPDIR pointed at scratch.
pub fn build_spec(
    worker_path: &Path,
    job_file: &Path,
    output_file: &Path,
    cwd: &Path,
) -> WorkerSpec {
    let current_path = std::env::var("PATH").unwrap_or_default();
    let path = format!(
        "{}:{}",
        PACKAGE_MANAGER_PREFIXES.join(":"),
        current_path
    );

    WorkerSpec {
        program: worker_path.to_path_buf(),
        args: vec![
            "--output-format=json".to_string(),
            format!("--output={}", output_file.display()),
            job_file.display().to_string(),
        ],
        env: vec![
            ("FIO_DISABLE_SHM".to_string(), "1".to_string()),
            ("TMPDIR".to_string(), cwd.display().to_string()),
            ("PATH".to_string(), path),
        ],
        cwd: cwd.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_spec_requests_json_artifact() {
        let spec = build_spec(
            Path::new("/usr/local/bin/fio"),
            Path::new("/tmp/plan.fio"),
            Path::new("/tmp/diskbench-test_1.json"),
            Path::new("/tmp"),
        );
        assert_eq!(spec.program, PathBuf::from("/usr/local/bin/fio"));
        assert_eq!(spec.args[0], "--output-format=json");
        assert_eq!(spec.args[1], "--output=/tmp/diskbench-test_1.json");
        assert_eq!(spec.args[2], "/tmp/plan.fio");
    }

    #[test]
    fn test_spec_environment_contract() {
        let spec = build_spec(
            Path::new("/usr/local/bin/fio"),
            Path::new("/tmp/plan.fio"),
            Path::new("/tmp/out.json"),
            Path::new("/tmp"),
        );
        let env: std::collections::HashMap<_, _> = spec.env.iter().cloned().collect();
        assert_eq!(env.get("FIO_DISABLE_SHM").map(String::as_str), Some("1"));
        assert!(env.contains_key("TMPDIR"));
        assert!(env.get("PATH").unwrap().starts_with("/opt/homebrew/bin:/usr/local/bin:"));
    }
}
