//! Service configuration.
//!
//! Paths default to the conventions the web UI and helper scripts already
//! expect: persistent state in `memory-bank/`, scratch artifacts in the
//! system temp directory.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;

/// Default retention for terminal test records.
pub const DEFAULT_RETENTION_DAYS: i64 = 7;

/// Default HTTP bridge port.
pub const DEFAULT_PORT: u16 = 8847;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Directory holding the state database and service logs.
    pub state_dir: PathBuf,

    /// SQLite database file for test state.
    pub db_path: PathBuf,

    /// Directory for per-test job files and JSON artifacts.
    pub scratch_dir: PathBuf,

    /// HTTP bridge port; the bridge always binds loopback.
    pub port: u16,

    /// Days to keep terminal test records before pruning.
    pub history_retention_days: i64,

    /// Explicit worker binary, bypassing resolution. Used by deployments
    /// that vendor their own build, and by the test suite.
    pub worker_path: Option<PathBuf>,

    /// Supervision deadline override in seconds (test mode support).
    /// When unset the deadline is the plan duration plus a 120 s buffer.
    pub test_deadline_secs: Option<u64>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        let state_dir = PathBuf::from("memory-bank");
        ServiceConfig {
            db_path: state_dir.join("diskbench_state.db"),
            state_dir,
            scratch_dir: std::env::temp_dir(),
            port: DEFAULT_PORT,
            history_retention_days: DEFAULT_RETENTION_DAYS,
            worker_path: None,
            test_deadline_secs: None,
        }
    }
}

impl ServiceConfig {
    /// Loopback bind address for the HTTP bridge.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.port)
    }

    /// Config rooted at a specific state directory.
    pub fn with_state_dir(state_dir: PathBuf) -> Self {
        ServiceConfig {
            db_path: state_dir.join("diskbench_state.db"),
            state_dir,
            ..ServiceConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_use_memory_bank() {
        let config = ServiceConfig::default();
        assert_eq!(config.state_dir, PathBuf::from("memory-bank"));
        assert_eq!(
            config.db_path,
            PathBuf::from("memory-bank/diskbench_state.db")
        );
        assert_eq!(config.history_retention_days, 7);
    }

    #[test]
    fn test_bridge_binds_loopback_only() {
        let config = ServiceConfig::default();
        assert!(config.bind_addr().ip().is_loopback());
    }

    #[test]
    fn test_with_state_dir_rebases_db() {
        let config = ServiceConfig::with_state_dir(PathBuf::from("/srv/diskbench"));
        assert_eq!(
            config.db_path,
            PathBuf::from("/srv/diskbench/diskbench_state.db")
        );
    }
}
