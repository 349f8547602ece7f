//! Test orchestration: admission control, worker lifecycle, recovery, and
//! cleanup.
//!
//! The orchestrator owns its collaborators (store, planner, supervisor,
//! resolver) by value. The only shared mutable state is the "current test"
//! slot behind an async RwLock; long operations never run while holding it.

pub mod recovery;

pub use recovery::RecoveryReport;

use crate::config::ServiceConfig;
use crate::disks;
use crate::error::{BenchError, Result};
use crate::evaluator;
use crate::models::{ProfileId, TestId, TestRecord, TestRequest, TestState};
use crate::parser;
use crate::planner::{self, WorkloadPlan};
use crate::store::{ResultBlob, StateStore, StoreStats};
use crate::supervisor::{self, WaitOutcome};
use crate::worker;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock};

/// Slack added to the plan's wall clock before the supervisor kills a test.
pub const SUPERVISION_BUFFER_SECS: u64 = 120;

/// Stderr lines retained for failure records.
const STDERR_TAIL_LINES: usize = 40;

/// Response to a successfully admitted start request.
#[derive(Debug, Clone)]
pub struct StartedTest {
    pub test_id: TestId,
    pub estimated_duration_secs: u64,
    /// Planner clamp note, when the requested size was adjusted.
    pub warning: Option<String>,
}

/// Result of stopping one test.
#[derive(Debug, Clone)]
pub struct StopReport {
    pub id: TestId,
    pub killed_pids: Vec<i32>,
}

/// Result of background-test cleanup.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: Vec<TestId>,
    pub killed_pids: Vec<i32>,
}

/// In-memory handle to the one test this instance is supervising.
#[derive(Clone)]
struct CurrentTest {
    id: TestId,
    /// Worker process group, 0 until the spawn lands.
    pgid: Arc<AtomicI32>,
    stop_requested: Arc<AtomicBool>,
    done: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct Orchestrator {
    config: Arc<ServiceConfig>,
    store: Arc<StateStore>,
    current: Arc<RwLock<Option<CurrentTest>>>,
    admission: Arc<Mutex<()>>,
}

impl Orchestrator {
    /// Open the store, reconcile state left behind by a previous instance,
    /// and return a ready orchestrator.
    pub async fn init(config: ServiceConfig) -> Result<(Orchestrator, RecoveryReport)> {
        std::fs::create_dir_all(&config.state_dir)?;
        std::fs::create_dir_all(&config.scratch_dir)?;
        let store = Arc::new(StateStore::open(&config.db_path)?);

        let report = recovery::reconcile(&store).await?;

        let orchestrator = Orchestrator {
            config: Arc::new(config),
            store,
            current: Arc::new(RwLock::new(None)),
            admission: Arc::new(Mutex::new(())),
        };
        Ok((orchestrator, report))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Admit and launch a test. Returns as soon as the test is admitted;
    /// the worker runs on its own supervision task.
    pub async fn start_test(
        &self,
        profile_name: &str,
        disk_path: &str,
        size_gb: f64,
    ) -> Result<StartedTest> {
        let profile = ProfileId::parse(profile_name).ok_or_else(|| {
            BenchError::InvalidRequest(format!("unknown test profile: {profile_name}"))
        })?;
        if !(size_gb > 0.0) {
            return Err(BenchError::InvalidRequest(format!(
                "test size must be positive, got {size_gb}"
            )));
        }

        // Probes run before the admission lock is taken.
        let worker_path = match &self.config.worker_path {
            Some(path) => path.clone(),
            None => worker::resolve().await?.path,
        };
        let target = Path::new(disk_path);
        let available = disks::free_space_for(target).ok_or_else(|| {
            BenchError::InvalidRequest(format!("{disk_path} is not on a mounted volume"))
        })?;
        let plan = planner::plan(profile, target, size_gb, available)?;
        let estimated = plan.total_duration_secs();

        let admission = self.admission.lock().await;
        if let Some(blocker) = self.store.list_running()?.into_iter().next() {
            return Err(BenchError::AlreadyRunning(blocker.id.to_string()));
        }

        let id = TestId::generate();
        let output_path = self.config.scratch_dir.join(format!("diskbench-{id}.json"));
        let request = TestRequest {
            id: id.clone(),
            profile,
            requested_profile: profile_name.to_string(),
            target_path: target.to_path_buf(),
            size_gb: plan.size_gb,
            estimated_duration_secs: estimated,
            output_path,
        };
        self.store.save_start(&TestRecord::starting(&request))?;

        let pgid = Arc::new(AtomicI32::new(0));
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (done_tx, done_rx) = watch::channel(false);
        *self.current.write().await = Some(CurrentTest {
            id: id.clone(),
            pgid: pgid.clone(),
            stop_requested: stop_requested.clone(),
            done: done_rx,
        });
        drop(admission);

        let orchestrator = self.clone();
        let warning = plan.warning.clone();
        let task_request = request.clone();
        tokio::spawn(async move {
            orchestrator
                .run_test(task_request, plan, worker_path, pgid, stop_requested, done_tx)
                .await;
        });

        if let Some(ref note) = warning {
            log::warn!("{id}: {note}");
        }
        log::info!(
            "test {id} admitted: profile={} target={} size={:.1}GB estimated={}s",
            profile.as_str(),
            disk_path,
            request.size_gb,
            estimated
        );
        Ok(StartedTest {
            test_id: id,
            estimated_duration_secs: estimated,
            warning,
        })
    }

    /// Supervision task: drives one worker from spawn to terminal state.
    async fn run_test(
        &self,
        request: TestRequest,
        plan: WorkloadPlan,
        worker_path: PathBuf,
        pgid_slot: Arc<AtomicI32>,
        stop_requested: Arc<AtomicBool>,
        done_tx: watch::Sender<bool>,
    ) {
        let id = request.id.clone();
        if let Err(e) = self
            .run_test_inner(&request, &plan, &worker_path, &pgid_slot, &stop_requested)
            .await
        {
            let message = e.user_message();
            log::error!("test {id} aborted: {message}");
            let _ = self
                .store
                .update_state(&id, TestState::Failed, None, Some(&message));
        }

        {
            let mut current = self.current.write().await;
            if current.as_ref().map_or(false, |c| c.id == id) {
                *current = None;
            }
        }
        let _ = done_tx.send(true);
        log::info!("test {id} supervision finished");
    }

    async fn run_test_inner(
        &self,
        request: &TestRequest,
        plan: &WorkloadPlan,
        worker_path: &Path,
        pgid_slot: &AtomicI32,
        stop_requested: &AtomicBool,
    ) -> Result<()> {
        let id = &request.id;
        let job_file = self.config.scratch_dir.join(format!("diskbench-{id}.fio"));
        tokio::fs::write(&job_file, plan.to_job_file()).await?;

        let spec = worker::build_spec(
            worker_path,
            &job_file,
            &request.output_path,
            &self.config.scratch_dir,
        );
        let mut handle = match supervisor::launch(&spec) {
            Ok(handle) => handle,
            Err(e) => {
                let message = BenchError::Launch(e.to_string()).to_string();
                self.store
                    .update_state(id, TestState::Failed, None, Some(&message))?;
                let _ = tokio::fs::remove_file(&job_file).await;
                return Ok(());
            }
        };
        pgid_slot.store(handle.pgid, Ordering::SeqCst);

        let command = format!("{} {}", spec.program.display(), spec.args.join(" "));
        self.store.mark_running(id, handle.pid, handle.pgid, &command)?;

        // A stop that raced the spawn: honour it before doing any work.
        if stop_requested.load(Ordering::SeqCst) {
            handle.terminate().await?;
            self.store.update_state(
                id,
                TestState::Stopped,
                None,
                Some("test stopped by operator"),
            )?;
            let _ = tokio::fs::remove_file(&job_file).await;
            return Ok(());
        }

        let mut stderr_rx = handle.stream_stderr();
        let stderr_task = tokio::spawn(async move {
            let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Some(line) = stderr_rx.recv().await {
                log::debug!("worker stderr: {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let deadline_secs = self
            .config
            .test_deadline_secs
            .unwrap_or(plan.total_duration_secs() + SUPERVISION_BUFFER_SECS);
        let outcome = handle.wait(Duration::from_secs(deadline_secs)).await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if stop_requested.load(Ordering::SeqCst) {
            self.store.update_state(
                id,
                TestState::Stopped,
                None,
                Some("test stopped by operator"),
            )?;
        } else {
            match outcome {
                WaitOutcome::Exited { code: 0, stdout } => {
                    self.ingest_output(request, &stdout).await?;
                }
                WaitOutcome::Exited { code, .. } => {
                    let message = BenchError::WorkerFailed {
                        return_code: code,
                        stderr_tail,
                    }
                    .to_string();
                    self.store
                        .update_state(id, TestState::Failed, None, Some(&message))?;
                }
                WaitOutcome::KilledBySignal { .. } => {
                    self.store.update_state(
                        id,
                        TestState::Failed,
                        None,
                        Some("worker terminated by signal"),
                    )?;
                }
                WaitOutcome::KilledByTimeout => {
                    let message = BenchError::DeadlineExceeded { deadline_secs }.to_string();
                    self.store
                        .update_state(id, TestState::Timeout, None, Some(&message))?;
                }
            }
        }

        let _ = tokio::fs::remove_file(&job_file).await;
        let _ = tokio::fs::remove_file(&plan.target_file).await;
        Ok(())
    }

    /// Parse the worker's artifact (or captured stdout), grade it, and
    /// record the terminal state.
    async fn ingest_output(&self, request: &TestRequest, stdout: &str) -> Result<()> {
        let id = &request.id;
        let raw = match tokio::fs::read_to_string(&request.output_path).await {
            Ok(contents) => contents,
            Err(_) => {
                log::warn!(
                    "artifact {} missing, parsing captured stdout",
                    request.output_path.display()
                );
                stdout.to_string()
            }
        };

        match parser::parse(&raw) {
            Ok(summary) => {
                let grading = evaluator::evaluate(request.profile, &summary);
                log::info!(
                    "test {id} completed: read {:.1} MiB/s, verdict {}",
                    summary.read_bw_mb(),
                    grading.verdict
                );
                self.record_summary_metrics(id, &summary);
                let blob = ResultBlob {
                    summary,
                    grading: Some(grading),
                };
                self.store
                    .update_state(id, TestState::Completed, Some(&blob), None)?;
                // Artifact is owned by the orchestrator; drop it once ingested.
                let _ = tokio::fs::remove_file(&request.output_path).await;
            }
            Err(e) => {
                let message = format!("unparseable worker output: {e}");
                self.store
                    .update_state(id, TestState::Failed, None, Some(&message))?;
            }
        }
        Ok(())
    }

    /// Store the headline numbers as per-test metric samples. Failures here
    /// are logged, never propagated; the result blob is the authoritative
    /// record.
    fn record_summary_metrics(&self, id: &TestId, summary: &crate::models::Summary) {
        let samples = [
            ("read_bw", summary.read_bw_mb(), Some("MiB/s")),
            ("write_bw", summary.write_bw_mb(), Some("MiB/s")),
            ("read_iops", summary.read_iops, None),
            ("avg_read_latency", summary.avg_read_latency_ms, Some("ms")),
        ];
        for (name, value, unit) in samples {
            if let Err(e) = self.store.record_metric(id, name, value, unit) {
                log::warn!("failed to record metric {name} for {id}: {e}");
            }
        }
        if let Some(ratio) = summary.stability_ratio {
            if let Err(e) = self.store.record_metric(id, "stability_ratio", ratio, None) {
                log::warn!("failed to record metric stability_ratio for {id}: {e}");
            }
        }
    }

    /// Stop a running test: terminate the group, wait for the reap, then
    /// sweep for detached children. Success implies the record is
    /// `stopped`.
    pub async fn stop_test(&self, id: &TestId) -> Result<StopReport> {
        let record = self
            .store
            .get(id)?
            .ok_or_else(|| BenchError::NotFound(id.to_string()))?;
        if !matches!(record.state, TestState::Starting | TestState::Running) {
            return Err(BenchError::NotStoppable {
                id: id.to_string(),
                state: record.state.to_string(),
            });
        }

        let current = self.current.read().await.clone();
        match current.filter(|c| c.id == *id) {
            Some(current) => {
                current.stop_requested.store(true, Ordering::SeqCst);
                let pgid = current.pgid.load(Ordering::SeqCst);
                if pgid > 0 {
                    supervisor::terminate_group(pgid).await;
                }
                let mut done = current.done;
                if !*done.borrow() {
                    let _ = done.changed().await;
                }
            }
            None => {
                // Running row without an in-memory supervisor: the record
                // predates this instance. Force the transition directly.
                self.store.update_state(
                    id,
                    TestState::Stopped,
                    None,
                    Some("test stopped by operator"),
                )?;
            }
        }

        let marker = format!("diskbench-{id}");
        let killed_pids = supervisor::sweep_matching(move |cmd| cmd.contains(&marker)).await;

        let final_record = self
            .store
            .get(id)?
            .ok_or_else(|| BenchError::NotFound(id.to_string()))?;
        if final_record.state == TestState::Stopped {
            Ok(StopReport {
                id: id.clone(),
                killed_pids,
            })
        } else {
            // The test reached another terminal state first; that
            // transition wins.
            Err(BenchError::NotStoppable {
                id: id.to_string(),
                state: final_record.state.to_string(),
            })
        }
    }

    /// Stop every running test, then sweep for any worker leftovers.
    pub async fn stop_all(&self) -> Result<Vec<TestId>> {
        let running: Vec<TestRecord> = self
            .store
            .list_running()?
            .into_iter()
            .filter(|r| matches!(r.state, TestState::Starting | TestState::Running))
            .collect();

        let mut stopped = Vec::new();
        for record in running {
            match self.stop_test(&record.id).await {
                Ok(report) => stopped.push(report.id),
                Err(e) => log::warn!("failed to stop test {}: {e}", record.id),
            }
        }

        let killed =
            supervisor::sweep_matching(|cmd| cmd.contains("fio") && cmd.contains("diskbench-"))
                .await;
        if !killed.is_empty() {
            log::info!("stop-all sweep killed {} leftover workers", killed.len());
        }
        Ok(stopped)
    }

    /// Current record for one test, with a fresh progress estimate.
    pub fn status(&self, id: &TestId) -> Result<TestRecord> {
        let mut record = self
            .store
            .get(id)?
            .ok_or_else(|| BenchError::NotFound(id.to_string()))?;
        record.refresh_progress();
        Ok(record)
    }

    /// The non-terminal test, if any.
    pub fn current(&self) -> Result<Option<TestRecord>> {
        let mut running = self.store.list_running()?;
        Ok(running.pop().map(|mut record| {
            record.refresh_progress();
            record
        }))
    }

    /// Records parked in `disconnected`/`unknown` after a restart.
    pub fn background(&self) -> Result<Vec<TestRecord>> {
        Ok(self.store.list_background()?)
    }

    /// Remove one background record (or all of them), killing any worker
    /// processes still attributable to it.
    pub async fn cleanup_background(&self, id: Option<&TestId>) -> Result<CleanupReport> {
        let targets = match id {
            Some(id) => {
                let record = self
                    .store
                    .get(id)?
                    .ok_or_else(|| BenchError::NotFound(id.to_string()))?;
                if !matches!(record.state, TestState::Disconnected | TestState::Unknown) {
                    return Err(BenchError::InvalidRequest(format!(
                        "test is not in background state (status: {})",
                        record.state
                    )));
                }
                vec![record]
            }
            None => self.store.list_background()?,
        };

        let mut report = CleanupReport::default();
        for record in targets {
            if let (TestState::Disconnected, Some(pid), Some(pgid)) =
                (record.state, record.pid, record.pgid)
            {
                if supervisor::process_alive(pid) {
                    supervisor::terminate_group(pgid).await;
                    report.killed_pids.push(pid);
                }
            }
            let marker = format!("diskbench-{}", record.id);
            let mut killed = supervisor::sweep_matching(move |cmd| cmd.contains(&marker)).await;
            report.killed_pids.append(&mut killed);

            let _ = tokio::fs::remove_file(&record.output_path).await;
            self.store.delete(&record.id)?;
            log::info!("background test {} cleaned up", record.id);
            report.removed.push(record.id);
        }
        Ok(report)
    }

    /// Most recent terminal records, newest first.
    pub fn history(&self, limit: usize) -> Result<Vec<TestRecord>> {
        Ok(self.store.history(limit)?)
    }

    /// Store size and per-state counts.
    pub fn stats(&self) -> Result<StoreStats> {
        Ok(self.store.stats()?)
    }

    /// Drop terminal records past the retention window.
    pub fn prune_history(&self) -> Result<usize> {
        Ok(self.store.prune(self.config.history_retention_days)?)
    }
}
