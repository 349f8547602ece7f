//! Startup recovery: reconcile test records left behind by a previous
//! service instance.
//!
//! Policy: a previously-running record whose process is still alive is
//! parked as `disconnected` (never adopted); a record whose process is
//! gone is failed as orphaned after a sweep for detached workers; a record
//! with no pid is `unknown`. After recovery no record remains in
//! `starting` or `running`.

use crate::error::Result;
use crate::models::TestId;
use crate::store::{RecoveryDisposition, StateStore};
use crate::supervisor;

/// What startup recovery found and did.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Still-alive tests now parked as background records.
    pub disconnected: Vec<TestId>,
    /// Orphaned tests transitioned to failed.
    pub failed: Vec<TestId>,
    /// Records that could not be decided.
    pub unknown: Vec<TestId>,
    /// Detached worker processes killed during the sweep.
    pub killed_pids: Vec<i32>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.disconnected.is_empty() && self.failed.is_empty() && self.unknown.is_empty()
    }
}

/// Run the recovery pass against the store.
pub(crate) async fn reconcile(store: &StateStore) -> Result<RecoveryReport> {
    let reconciled = store.recover_orphans(0, supervisor::process_alive)?;
    let mut report = RecoveryReport::default();

    for (record, disposition) in reconciled {
        match disposition {
            RecoveryDisposition::StillAlive => {
                log::warn!(
                    "test {} survived restart with live worker pid {:?}; parked as disconnected",
                    record.id,
                    record.pid
                );
                report.disconnected.push(record.id);
            }
            RecoveryDisposition::Orphaned => {
                // The leader is gone, but the worker may have left detached
                // children referencing the test's artifact path.
                let marker = format!("diskbench-{}", record.id);
                let mut killed =
                    supervisor::sweep_matching(move |cmd| cmd.contains(&marker)).await;
                if !killed.is_empty() {
                    log::info!(
                        "killed {} detached workers for orphaned test {}",
                        killed.len(),
                        record.id
                    );
                }
                report.killed_pids.append(&mut killed);
                report.failed.push(record.id);
            }
            RecoveryDisposition::Undecidable => {
                log::warn!("test {} has no recorded pid; state is unknown", record.id);
                report.unknown.push(record.id);
            }
        }
    }

    if report.is_empty() {
        log::info!("no orphaned tests found at startup");
    } else {
        log::warn!(
            "startup recovery: {} disconnected, {} failed, {} unknown, {} pids killed",
            report.disconnected.len(),
            report.failed.len(),
            report.unknown.len(),
            report.killed_pids.len()
        );
    }
    Ok(report)
}
