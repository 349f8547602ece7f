//! Worker process supervision: deterministic start, observe, signal, and
//! reap semantics for the external benchmark worker.
//!
//! The worker is launched as the leader of a fresh process group so that
//! signals reach every sub-process it spawns, not just the leader. Only
//! this module sends signals or calls `wait` on worker processes.

use crate::error::SupervisorError;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Grace period between SIGTERM and SIGKILL when shutting a group down.
const TERM_GRACE: Duration = Duration::from_secs(2);

/// Everything needed to launch one worker invocation.
#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: PathBuf,
}

/// Handle to a launched worker process group.
pub struct WorkerHandle {
    pub pid: libc::pid_t,
    pub pgid: libc::pid_t,
    child: Child,
    stdout: Option<tokio::process::ChildStdout>,
    stderr: Option<tokio::process::ChildStderr>,
}

/// Result of waiting for a worker under a wall-clock deadline.
#[derive(Debug)]
pub enum WaitOutcome {
    /// Worker exited on its own; captured stdout included.
    Exited { code: i32, stdout: String },
    /// Worker was terminated by a signal not sent by the deadline path.
    KilledBySignal { stdout: String },
    /// The deadline expired; the group was terminated and reaped.
    KilledByTimeout,
}

/// Launch a worker in a new process group.
///
/// Returns only after the child exists; spawn failures are synchronous.
pub fn launch(spec: &WorkerSpec) -> Result<WorkerHandle, SupervisorError> {
    let mut cmd = std::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    {
        // New process group with the child as leader, so group signals
        // reach any sub-processes the worker forks.
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    let mut child = Command::from(cmd)
        .spawn()
        .map_err(|e| SupervisorError::SpawnFailed(format!("{}: {e}", spec.program.display())))?;

    let pid = child
        .id()
        .ok_or_else(|| SupervisorError::SpawnFailed("child exited before pid read".into()))?
        as i32;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    log::info!(
        "worker launched: pid={pid} pgid={pid} program={}",
        spec.program.display()
    );

    Ok(WorkerHandle {
        pid,
        // The child is its group's leader, so pgid == pid.
        pgid: pid,
        child,
        stdout,
        stderr,
    })
}

impl WorkerHandle {
    /// Stream the worker's stderr line by line.
    ///
    /// Lines arrive in emission order. The reader task ends when the worker
    /// closes the pipe or the receiver is dropped; dropping the consumer
    /// does not leak the reader.
    pub fn stream_stderr(&mut self) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(256);
        if let Some(stderr) = self.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
            });
        }
        rx
    }

    /// Wait for worker exit, enforcing a wall-clock deadline.
    ///
    /// If the deadline expires the group gets SIGTERM, up to 2 s to die,
    /// then SIGKILL, and the child is reaped before this returns.
    pub async fn wait(mut self, deadline: Duration) -> Result<WaitOutcome, SupervisorError> {
        let stdout_task = self.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buffer = String::new();
                let _ = out.read_to_string(&mut buffer).await;
                buffer
            })
        });

        let collect_stdout = |task: Option<tokio::task::JoinHandle<String>>| async {
            match task {
                Some(task) => task.await.unwrap_or_default(),
                None => String::new(),
            }
        };

        match tokio::time::timeout(deadline, self.child.wait()).await {
            Ok(Ok(status)) => {
                let stdout = collect_stdout(stdout_task).await;
                match status.code() {
                    Some(code) => Ok(WaitOutcome::Exited { code, stdout }),
                    None => Ok(WaitOutcome::KilledBySignal { stdout }),
                }
            }
            Ok(Err(e)) => Err(SupervisorError::Io(e)),
            Err(_) => {
                log::warn!(
                    "worker pgid={} exceeded deadline of {}s, terminating group",
                    self.pgid,
                    deadline.as_secs()
                );
                terminate_group(self.pgid).await;
                // Reap so no zombie survives the timeout path.
                let _ = self.child.wait().await;
                let _ = collect_stdout(stdout_task).await;
                Ok(WaitOutcome::KilledByTimeout)
            }
        }
    }

    /// Gracefully stop the worker's process group and reap the leader.
    pub async fn terminate(mut self) -> Result<(), SupervisorError> {
        terminate_group(self.pgid).await;
        let _ = self.child.wait().await;
        Ok(())
    }

    /// Force-kill the worker's process group and reap the leader.
    pub async fn kill(mut self) -> Result<(), SupervisorError> {
        signal_group(self.pgid, Signal::SIGKILL);
        let _ = self.child.wait().await;
        Ok(())
    }
}

/// SIGTERM the group, give it up to 2 s, then SIGKILL whatever remains.
///
/// A group that is already gone counts as success.
pub async fn terminate_group(pgid: libc::pid_t) {
    if !signal_group(pgid, Signal::SIGTERM) {
        return;
    }
    tokio::time::sleep(TERM_GRACE).await;
    if group_alive(pgid) {
        log::info!("process group {pgid} survived SIGTERM, sending SIGKILL");
        signal_group(pgid, Signal::SIGKILL);
    }
}

/// Send a signal to a process group. Returns whether the group existed.
fn signal_group(pgid: libc::pid_t, signal: Signal) -> bool {
    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(Errno::EPERM) => {
            log::warn!("permission denied signalling process group {pgid}");
            true
        }
        Err(e) => {
            log::error!("failed to signal process group {pgid}: {e}");
            false
        }
    }
}

fn group_alive(pgid: libc::pid_t) -> bool {
    match killpg(Pid::from_raw(pgid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Liveness probe for a single pid. EPERM means the process exists.
pub fn process_alive(pid: libc::pid_t) -> bool {
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Scan running processes system-wide and return pids whose command line
/// matches the predicate.
///
/// Advisory only: processes started after the scan are not observed.
pub fn find_orphans<F>(predicate: F) -> Vec<i32>
where
    F: Fn(&str) -> bool,
{
    let sys = sysinfo::System::new_all();
    let own_pid = std::process::id();
    let mut matches = Vec::new();
    for (pid, process) in sys.processes() {
        if pid.as_u32() == own_pid {
            continue;
        }
        let cmdline = process
            .cmd()
            .iter()
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        if !cmdline.is_empty() && predicate(&cmdline) {
            matches.push(pid.as_u32() as i32);
        }
    }
    matches
}

/// Kill every process whose command line matches the predicate.
///
/// Each pid gets SIGTERM, a 2 s grace, then SIGKILL if still alive.
/// Returns the pids that were signalled. Already-gone processes are
/// success; permission failures are logged and skipped.
pub async fn sweep_matching<F>(predicate: F) -> Vec<i32>
where
    F: Fn(&str) -> bool,
{
    let pids = find_orphans(predicate);
    let mut killed = Vec::new();
    for pid in pids {
        match kill(Pid::from_raw(pid), Signal::SIGTERM) {
            Ok(()) => {
                tokio::time::sleep(TERM_GRACE).await;
                if process_alive(pid) {
                    let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
                    log::info!("force killed orphaned worker pid {pid}");
                } else {
                    log::info!("orphaned worker pid {pid} terminated gracefully");
                }
                killed.push(pid);
            }
            Err(Errno::ESRCH) => {
                log::info!("orphaned worker pid {pid} already gone");
            }
            Err(Errno::EPERM) => {
                log::warn!("permission denied killing orphaned worker pid {pid}");
            }
            Err(e) => {
                log::error!("failed to kill orphaned worker pid {pid}: {e}");
            }
        }
    }
    killed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_spec(script: &str) -> WorkerSpec {
        WorkerSpec {
            program: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), script.to_string()],
            env: vec![],
            cwd: std::env::temp_dir(),
        }
    }

    #[tokio::test]
    async fn test_launch_and_clean_exit() {
        let handle = launch(&shell_spec("echo hello-from-worker")).unwrap();
        assert!(handle.pid > 0);
        match handle.wait(Duration::from_secs(10)).await.unwrap() {
            WaitOutcome::Exited { code, stdout } => {
                assert_eq!(code, 0);
                assert!(stdout.contains("hello-from-worker"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_code_reported() {
        let handle = launch(&shell_spec("exit 3")).unwrap();
        match handle.wait(Duration::from_secs(10)).await.unwrap() {
            WaitOutcome::Exited { code, .. } => assert_eq!(code, 3),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_spawn_failure_is_synchronous() {
        let spec = WorkerSpec {
            program: PathBuf::from("/nonexistent/worker-binary"),
            args: vec![],
            env: vec![],
            cwd: std::env::temp_dir(),
        };
        assert!(matches!(
            launch(&spec),
            Err(SupervisorError::SpawnFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_child_leads_its_own_process_group() {
        let handle = launch(&shell_spec("sleep 5")).unwrap();
        let pid = handle.pid;
        let pgid = nix::unistd::getpgid(Some(Pid::from_raw(pid))).unwrap();
        assert_eq!(pgid.as_raw(), handle.pgid);
        assert_ne!(pgid.as_raw(), std::process::id() as i32);
        handle.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_deadline_kills_group_and_reaps() {
        let handle = launch(&shell_spec("sleep 60")).unwrap();
        let pid = handle.pid;
        let outcome = handle.wait(Duration::from_millis(200)).await.unwrap();
        assert!(matches!(outcome, WaitOutcome::KilledByTimeout));
        // Reaped by the timeout path: the pid must be gone.
        assert!(!process_alive(pid));
    }

    #[tokio::test]
    async fn test_stderr_lines_arrive_in_order() {
        let mut handle =
            launch(&shell_spec("echo one >&2; echo two >&2; echo three >&2")).unwrap();
        let mut rx = handle.stream_stderr();
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        assert_eq!(lines, vec!["one", "two", "three"]);
        handle.wait(Duration::from_secs(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_stderr_consumer_is_safe() {
        // The worker must not wedge on a full stderr pipe once the
        // consumer walks away. The writer may die of SIGPIPE; the shell
        // absorbs that and exits cleanly.
        let mut handle = launch(&shell_spec("seq 1 100000 >&2; exit 0")).unwrap();
        let rx = handle.stream_stderr();
        drop(rx);
        let outcome = handle.wait(Duration::from_secs(10)).await.unwrap();
        assert!(matches!(outcome, WaitOutcome::Exited { .. }));
    }

    #[tokio::test]
    async fn test_terminate_already_gone_group_is_success() {
        let handle = launch(&shell_spec("true")).unwrap();
        let pgid = handle.pgid;
        // Let the child exit on its own, then terminate the stale group.
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.terminate().await.unwrap();
        terminate_group(pgid).await;
    }

    #[test]
    fn test_process_alive_for_self_and_bogus_pid() {
        assert!(process_alive(std::process::id() as i32));
        assert!(!process_alive(999_999_999));
    }

    #[tokio::test]
    async fn test_find_orphans_matches_own_marker() {
        let handle = launch(&shell_spec("sleep diskbench-orphan-probe 2>/dev/null; sleep 3")).unwrap();
        // The marker appears in the shell's command line.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let found = find_orphans(|cmd| cmd.contains("diskbench-orphan-probe"));
        assert!(found.contains(&handle.pid));
        handle.kill().await.unwrap();
    }
}
