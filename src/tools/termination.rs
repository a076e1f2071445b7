//! Graceful-then-forceful termination of owned processes.
//!
//! Every process the engine spawns is started as the leader of its own
//! process group (POSIX) so that a termination request reaches the whole
//! tree, including grandchildren such as a dev server's bundler. Both
//! signals are sent from a background task: the graceful one right away,
//! the forceful one once the grace window has passed with any part of the
//! tree still alive.

use crate::tools::platform::{PlatformProfile, TreeKill};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, timeout_at, Instant};
use tracing::{debug, info, instrument, warn};

/// Upper bound on how long the forceful signal may take to land after the grace window.
pub const ESCALATION_SLOP: Duration = Duration::from_millis(500);

const TREE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Shared view of one spawned OS process.
///
/// Clones observe the same exit flag; the task that owns the `Child` holds
/// the matching [`ExitSignal`] and fires it after `wait()` returns.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exited: watch::Receiver<bool>,
    terminating: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct ExitSignal {
    tx: watch::Sender<bool>,
}

impl ExitSignal {
    pub fn mark_exited(&self) {
        self.tx.send_replace(true);
    }
}

pub fn track(pid: Option<u32>) -> (ProcessHandle, ExitSignal) {
    let (tx, rx) = watch::channel(false);
    (
        ProcessHandle {
            pid,
            exited: rx,
            terminating: Arc::new(AtomicBool::new(false)),
        },
        ExitSignal { tx },
    )
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        // A dropped ExitSignal means the owning task is gone, so nothing is left to kill.
        *self.exited.borrow() || self.exited.has_changed().is_err()
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    pub async fn wait_exit(&self) {
        let mut rx = self.exited.clone();
        let _ = rx.wait_for(|exited| *exited).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    Graceful,
    Forced,
}

#[derive(Debug)]
pub enum Termination {
    AlreadyExited,
    AlreadyTerminating,
    Signalled(JoinHandle<Escalation>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Graceful,
    Forceful,
}

#[derive(Debug, Clone)]
pub struct TerminationSupervisor {
    grace: Duration,
    tree_kill: TreeKill,
}

impl TerminationSupervisor {
    pub fn new(grace: Duration, profile: &PlatformProfile) -> Self {
        Self {
            grace,
            tree_kill: profile.tree_kill,
        }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Starts termination and returns without waiting on the OS.
    ///
    /// The escalation task snapshots the process tree, sends the graceful
    /// signal, and once the grace window is over sends the forceful one to
    /// whatever part of the tree is still alive, even if the leader is gone.
    /// Never fails for processes that are already gone.
    #[instrument(skip(self, handle), fields(pid = ?handle.pid()))]
    pub fn terminate(&self, handle: &ProcessHandle) -> Termination {
        let Some(pid) = handle.pid() else {
            return Termination::AlreadyExited;
        };
        if handle.has_exited() {
            debug!("Process already exited, nothing to terminate");
            return Termination::AlreadyExited;
        }
        if handle.terminating.swap(true, Ordering::SeqCst) {
            debug!("Termination already in progress");
            return Termination::AlreadyTerminating;
        }

        let handle = handle.clone();
        let grace = self.grace;
        let tree_kill = self.tree_kill;
        Termination::Signalled(tokio::spawn(async move {
            let strays = collect_descendants(tree_kill, pid).await;
            if let Err(e) = signal_tree(tree_kill, pid, &strays, Phase::Graceful) {
                warn!(pid, error = %e, "Failed to deliver graceful termination signal");
            }

            let deadline = Instant::now() + grace;
            if timeout_at(deadline, handle.wait_exit()).await.is_ok() {
                if wait_tree_gone(tree_kill, pid, &strays, deadline).await {
                    debug!(pid, "Process tree exited within grace window");
                    return Escalation::Graceful;
                }
                warn!(pid, "Leader exited but descendants ignored graceful termination, forcing");
            } else {
                warn!(pid, grace_ms = grace.as_millis() as u64, "Process ignored graceful termination, forcing");
            }
            if let Err(e) = signal_tree(tree_kill, pid, &strays, Phase::Forceful) {
                warn!(pid, error = %e, "Failed to deliver forceful termination signal");
            }
            Escalation::Forced
        }))
    }

    /// Terminates and waits until the process is reaped or the escalation
    /// window has fully elapsed. Returns whether an exit was observed.
    pub async fn terminate_and_wait(&self, handle: &ProcessHandle) -> bool {
        if let Termination::Signalled(escalation) = self.terminate(handle) {
            match escalation.await {
                Ok(outcome) => info!(pid = ?handle.pid(), ?outcome, "Termination finished"),
                Err(e) => warn!(pid = ?handle.pid(), error = %e, "Escalation task failed"),
            }
        }
        timeout(self.grace + ESCALATION_SLOP, handle.wait_exit()).await.is_ok()
    }
}

/// Makes `cmd` spawn as the leader of a fresh process group so the whole tree can be signalled.
pub fn isolate(cmd: &mut TokioCommand) {
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

fn signal_tree(tree_kill: TreeKill, pid: u32, strays: &[u32], phase: Phase) -> io::Result<()> {
    match tree_kill {
        TreeKill::ProcessGroup => signal_process_group(pid, strays, phase),
        TreeKill::Taskkill => taskkill_tree(pid, phase),
    }
}

/// Descendants are only needed where a group signal can miss them.
async fn collect_descendants(tree_kill: TreeKill, pid: u32) -> Vec<u32> {
    match tree_kill {
        // A full process-table scan; kept off the async workers.
        TreeKill::ProcessGroup => tokio::task::spawn_blocking(move || descendants(pid))
            .await
            .unwrap_or_default(),
        TreeKill::Taskkill => Vec::new(),
    }
}

/// Polls until nothing of the tree is left or `deadline` passes. Returns
/// whether the tree is gone.
async fn wait_tree_gone(tree_kill: TreeKill, pid: u32, strays: &[u32], deadline: Instant) -> bool {
    loop {
        if !tree_alive(tree_kill, pid, strays) {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        sleep_until((now + TREE_POLL_INTERVAL).min(deadline)).await;
    }
}

#[cfg(unix)]
fn tree_alive(tree_kill: TreeKill, pid: u32, strays: &[u32]) -> bool {
    if tree_kill != TreeKill::ProcessGroup {
        return false;
    }
    // Signal 0 only probes; the group id cannot be reused while any member lives.
    let group_alive = unsafe { libc::killpg(pid as libc::pid_t, 0) } == 0;
    group_alive || strays.iter().any(|&s| unsafe { libc::kill(s as libc::pid_t, 0) } == 0)
}

#[cfg(not(unix))]
fn tree_alive(_tree_kill: TreeKill, _pid: u32, _strays: &[u32]) -> bool {
    false
}

#[cfg(unix)]
fn signal_process_group(pid: u32, strays: &[u32], phase: Phase) -> io::Result<()> {
    let signal = match phase {
        Phase::Graceful => libc::SIGTERM,
        Phase::Forceful => libc::SIGKILL,
    };

    let result = unsafe { libc::killpg(pid as libc::pid_t, signal) };
    if result == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
        // Not a group leader, or the group is already empty.
        if phase == Phase::Graceful && unsafe { libc::kill(pid as libc::pid_t, signal) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
    }

    // Grandchildren that moved to their own group (setsid, nohup) are not reached by killpg.
    for &stray in strays {
        unsafe {
            libc::kill(stray as libc::pid_t, signal);
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _strays: &[u32], _phase: Phase) -> io::Result<()> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "process groups are POSIX-only"))
}

fn taskkill_tree(pid: u32, phase: Phase) -> io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if phase == Phase::Forceful {
        cmd.arg("/F");
    }
    cmd.stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    // Fire and forget; the exit watch tells us whether it worked.
    cmd.spawn().map(|_| ())
}

/// All transitive children of `root`, parents before children.
fn descendants(root: u32) -> Vec<u32> {
    use std::collections::HashMap;
    use sysinfo::{Pid, System};

    let mut sys = System::new();
    sys.refresh_processes();

    let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if let Some(parent) = process.parent() {
            children.entry(parent).or_default().push(*pid);
        }
    }

    let mut found = Vec::new();
    let mut queue = vec![Pid::from_u32(root)];
    while let Some(next) = queue.pop() {
        if let Some(kids) = children.get(&next) {
            for kid in kids {
                found.push(kid.as_u32());
                queue.push(*kid);
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::platform;
    use std::time::Instant;

    fn supervisor(grace_ms: u64) -> TerminationSupervisor {
        TerminationSupervisor::new(Duration::from_millis(grace_ms), platform::current())
    }

    #[cfg(unix)]
    fn spawn_watched(script: &str) -> ProcessHandle {
        let mut cmd = TokioCommand::new("sh");
        cmd.arg("-c").arg(script);
        isolate(&mut cmd);
        let mut child = cmd.spawn().expect("spawn sh");
        let (handle, exit) = track(child.id());
        tokio::spawn(async move {
            let _ = child.wait().await;
            exit.mark_exited();
        });
        handle
    }

    /// Orphaned zombies may linger until init reaps them; they count as dead.
    #[cfg(unix)]
    fn is_running(pid: u32) -> bool {
        use sysinfo::{Pid, ProcessStatus, System};
        let mut sys = System::new();
        sys.refresh_processes();
        sys.process(Pid::from_u32(pid))
            .map(|p| p.status() != ProcessStatus::Zombie)
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn unknown_process_is_a_noop() {
        let (handle, _exit) = track(None);
        assert!(matches!(supervisor(100).terminate(&handle), Termination::AlreadyExited));
    }

    #[tokio::test]
    async fn exited_process_is_a_noop() {
        let (handle, exit) = track(Some(4_000_000));
        exit.mark_exited();
        assert!(handle.has_exited());
        assert!(matches!(supervisor(100).terminate(&handle), Termination::AlreadyExited));
    }

    #[tokio::test]
    async fn dropped_exit_signal_counts_as_exited() {
        let (handle, exit) = track(Some(4_000_000));
        drop(exit);
        assert!(handle.has_exited());
        handle.wait_exit().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cooperative_process_exits_gracefully() {
        let handle = spawn_watched("exec sleep 30");
        let Termination::Signalled(task) = supervisor(2_000).terminate(&handle) else {
            panic!("expected a signal to be sent");
        };
        assert_eq!(task.await.unwrap(), Escalation::Graceful);
        assert!(handle.has_exited());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn second_request_while_terminating_is_idempotent() {
        let handle = spawn_watched("exec sleep 30");
        let sup = supervisor(2_000);
        let first = sup.terminate(&handle);
        assert!(matches!(sup.terminate(&handle), Termination::AlreadyTerminating));
        if let Termination::Signalled(task) = first {
            task.await.unwrap();
        }
        assert!(matches!(sup.terminate(&handle), Termination::AlreadyExited));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stubborn_process_is_forced_after_grace_window() {
        let handle = spawn_watched("trap '' TERM; sleep 30");
        // Let the shell install its trap before we signal it.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let grace = Duration::from_millis(400);
        let sup = TerminationSupervisor::new(grace, platform::current());
        let started = Instant::now();
        let Termination::Signalled(task) = sup.terminate(&handle) else {
            panic!("expected a signal to be sent");
        };
        assert_eq!(task.await.unwrap(), Escalation::Forced);
        let elapsed = started.elapsed();
        assert!(elapsed >= grace, "forced too early: {:?}", elapsed);
        assert!(elapsed <= grace + ESCALATION_SLOP, "forced too late: {:?}", elapsed);

        tokio::time::timeout(Duration::from_secs(2), handle.wait_exit())
            .await
            .expect("process should be gone after SIGKILL");
    }

    #[cfg(unix)]
    async fn read_pid_file(path: &std::path::Path) -> u32 {
        for _ in 0..50 {
            if let Ok(raw) = std::fs::read_to_string(path) {
                if let Ok(pid) = raw.trim().parse::<u32>() {
                    return pid;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no pid written to {}", path.display());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_does_not_block_on_the_process_table() {
        let handle = spawn_watched("exec sleep 30");
        let sup = supervisor(2_000);
        // Nothing has been awaited yet, so the scan and signal cannot have run.
        let Termination::Signalled(task) = sup.terminate(&handle) else {
            panic!("expected a signal to be sent");
        };
        assert!(!handle.has_exited());
        assert_eq!(task.await.unwrap(), Escalation::Graceful);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn grandchildren_are_terminated_with_the_group() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let handle = spawn_watched(&script);
        let grandchild = read_pid_file(&pid_file).await;

        assert!(supervisor(2_000).terminate_and_wait(&handle).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!is_running(grandchild), "grandchild {} survived", grandchild);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stubborn_grandchild_is_killed_after_leader_exits() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("grandchild.pid");
        let script = format!("(trap '' TERM; exec sleep 60) & echo $! > {}; wait", pid_file.display());
        let handle = spawn_watched(&script);
        let grandchild = read_pid_file(&pid_file).await;
        // Let the subshell install its trap before exec.
        tokio::time::sleep(Duration::from_millis(200)).await;

        let grace = Duration::from_millis(500);
        let sup = TerminationSupervisor::new(grace, platform::current());
        let started = Instant::now();
        let Termination::Signalled(task) = sup.terminate(&handle) else {
            panic!("expected a signal to be sent");
        };
        assert_eq!(task.await.unwrap(), Escalation::Forced);
        assert!(started.elapsed() >= grace);
        assert!(handle.has_exited(), "the leader dies on the graceful signal");

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!is_running(grandchild), "grandchild {} survived", grandchild);
    }
}
