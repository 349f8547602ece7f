//! Worker binary resolution: find an acceptable benchmark worker and
//! report its capability.
//!
//! Candidates are probed in a fixed order (vendored build, package-manager
//! prefixes, PATH lookup); the first one that exists, is executable,
//! answers a version probe, and advertises JSON output wins. Later
//! candidates are never consulted.

use crate::error::ResolverError;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Probe commands block for at most this long.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Installation hint shown whenever resolution fails.
const INSTALL_HINT: &str =
    "install fio 3.x with `brew install fio` (or your package manager), \
     or place a vendored build under /usr/local/share/qlab-disk-tester/fio-3.37/";

/// Where the resolved worker came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerSource {
    Bundled,
    PackageManager,
    SystemPath,
}

/// A usable worker binary.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerInfo {
    pub path: PathBuf,
    pub version: String,
    pub source: WorkerSource,
    /// The worker advertises `--output-format=json`.
    pub supports_json: bool,
}

/// Locate an acceptable worker binary.
pub async fn resolve() -> Result<WorkerInfo, ResolverError> {
    let mut probed_any = false;
    let mut last_unusable: Option<PathBuf> = None;

    for (candidate, source) in candidates() {
        if !is_executable(&candidate) {
            continue;
        }
        probed_any = true;

        let version = match probe_version(&candidate).await {
            Some(version) => version,
            None => {
                log::warn!(
                    "worker candidate {} did not answer the version probe",
                    candidate.display()
                );
                last_unusable = Some(candidate);
                continue;
            }
        };

        if !probe_json_capability(&candidate).await {
            log::warn!(
                "worker candidate {} does not advertise JSON output",
                candidate.display()
            );
            last_unusable = Some(candidate);
            continue;
        }

        log::info!("resolved worker: {} ({version})", candidate.display());
        return Ok(WorkerInfo {
            path: candidate,
            version,
            source,
            supports_json: true,
        });
    }

    if probed_any {
        let path = last_unusable
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        Err(ResolverError::WorkerUnusable {
            path,
            hint: INSTALL_HINT.to_string(),
        })
    } else {
        Err(ResolverError::WorkerMissing {
            hint: INSTALL_HINT.to_string(),
        })
    }
}

/// Candidate paths in resolution priority order.
fn candidates() -> Vec<(PathBuf, WorkerSource)> {
    let mut list = Vec::new();

    // Vendored next to the service binary, then the shared install.
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            list.push((dir.join("fio-3.37").join("fio"), WorkerSource::Bundled));
            list.push((
                dir.join("resources").join("fio-3.37").join("fio"),
                WorkerSource::Bundled,
            ));
        }
    }
    list.push((
        PathBuf::from("/usr/local/share/qlab-disk-tester/fio-3.37/fio"),
        WorkerSource::Bundled,
    ));

    for prefix in crate::worker::PACKAGE_MANAGER_PREFIXES {
        list.push((Path::new(prefix).join("fio"), WorkerSource::PackageManager));
    }

    // Finally, whatever PATH offers.
    if let Some(paths) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&paths) {
            list.push((dir.join("fio"), WorkerSource::SystemPath));
        }
    }

    list
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// First line of `<worker> --version`, or None on failure/timeout.
async fn probe_version(path: &Path) -> Option<String> {
    let output = tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(path).arg("--version").output(),
    )
    .await
    .ok()?
    .ok()?;
    if !output.status.success() {
        return None;
    }
    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout.lines().next()?.trim().to_string();
    (!version.is_empty()).then_some(version)
}

/// The help output must advertise `--output-format` with a json choice.
async fn probe_json_capability(path: &Path) -> bool {
    let output = match tokio::time::timeout(
        PROBE_TIMEOUT,
        Command::new(path).arg("--help").output(),
    )
    .await
    {
        Ok(Ok(output)) => output,
        _ => return false,
    };
    let help = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
    help.contains("--output-format") && help.contains("json")
}
