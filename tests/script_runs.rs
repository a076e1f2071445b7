#![cfg(unix)]

use procdeck::config::Config;
use procdeck::error::AppError;
use procdeck::events::{EngineEvent, RunStatus, StreamKind};
use procdeck::tools::script_tool::{ExecuteScriptParams, ScriptKeyParams};
use std::time::Duration;
use sysinfo::{Pid, ProcessStatus, System};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

fn config() -> Config {
    Config::default().with_kill_grace(Duration::from_millis(500))
}

fn execute_params(command: &str) -> ExecuteScriptParams {
    ExecuteScriptParams {
        project_id: "web".into(),
        script_id: "dev".into(),
        command: command.into(),
        cwd: std::env::temp_dir().display().to_string(),
    }
}

fn key() -> ScriptKeyParams {
    ScriptKeyParams {
        project_id: "web".into(),
        script_id: "dev".into(),
    }
}

async fn next_status(rx: &mut UnboundedReceiver<EngineEvent>) -> (RunStatus, Option<i32>) {
    loop {
        let event = timeout(WAIT, rx.recv()).await.expect("timed out waiting for status").expect("bus closed");
        if let EngineEvent::ScriptStatus { status, exit_code, .. } = event {
            return (status, exit_code);
        }
    }
}

#[tokio::test]
async fn output_then_single_stopped_event() {
    let (engine, mut rx) = procdeck::engine(config());
    let result = engine.scripts().execute(&execute_params("echo hello")).await.unwrap();
    assert!(result.pid.is_some());

    let mut stdout = String::new();
    let mut statuses = Vec::new();
    while statuses.last().map(|(s, _)| *s) != Some(RunStatus::Stopped) {
        match timeout(WAIT, rx.recv()).await.unwrap().unwrap() {
            EngineEvent::ScriptOutput { stream, data, .. } => {
                assert_eq!(stream, StreamKind::Stdout);
                stdout.push_str(&data);
            }
            EngineEvent::ScriptStatus { status, exit_code, .. } => statuses.push((status, exit_code)),
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(stdout, "hello\n");
    assert_eq!(statuses, vec![(RunStatus::Running, None), (RunStatus::Stopped, Some(0))]);
    assert!(!engine.scripts().is_running(&key()).await);
}

#[tokio::test]
async fn second_execute_replaces_first_run() {
    let (engine, mut rx) = procdeck::engine(config());
    let first = engine.scripts().execute(&execute_params("sleep 30")).await.unwrap();
    let second = engine.scripts().execute(&execute_params("sleep 30")).await.unwrap();
    assert_ne!(first.pid, second.pid);

    assert_eq!(next_status(&mut rx).await.0, RunStatus::Running);
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Running);
    // The replaced run reports its own exit, killed by signal so no code.
    assert_eq!(next_status(&mut rx).await, (RunStatus::Stopped, None));

    let runs = engine.scripts().list().await;
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].pid, second.pid);
    assert!(engine.scripts().is_running(&key()).await);

    engine.scripts().stop(&key()).await.unwrap();
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Stopped);
    assert!(!engine.scripts().is_running(&key()).await);
}

#[tokio::test]
async fn repeated_stop_never_errors_unexpectedly() {
    let (engine, mut rx) = procdeck::engine(config());
    engine.scripts().execute(&execute_params("sleep 30")).await.unwrap();
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Running);

    engine.scripts().stop(&key()).await.unwrap();
    match engine.scripts().stop(&key()).await {
        Ok(()) | Err(AppError::ScriptNotFound(_)) => {}
        Err(other) => panic!("unexpected error {:?}", other),
    }
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Stopped);
    assert!(matches!(engine.scripts().stop(&key()).await, Err(AppError::ScriptNotFound(_))));
}

#[tokio::test]
async fn stubborn_script_is_force_killed_within_grace() {
    let (engine, mut rx) = procdeck::engine(config());
    engine
        .scripts()
        .execute(&execute_params("trap '' TERM; sleep 30"))
        .await
        .unwrap();
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Running);
    // Give the trap a moment to be installed.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    engine.scripts().stop(&key()).await.unwrap();
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Stopped);
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500), "stopped too early: {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(3_000), "stopped too late: {:?}", elapsed);
}

#[tokio::test]
async fn stop_reaches_grandchild_that_ignores_term() {
    let (engine, mut rx) = procdeck::engine(config());
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("gc.pid");
    let command = format!("(trap '' TERM; exec sleep 60) & echo $! > {}; wait", pid_file.display());
    engine.scripts().execute(&execute_params(&command)).await.unwrap();
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Running);

    let mut grandchild = None;
    for _ in 0..50 {
        if let Some(pid) = std::fs::read_to_string(&pid_file).ok().and_then(|raw| raw.trim().parse::<i32>().ok()) {
            grandchild = Some(pid);
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let grandchild = grandchild.expect("grandchild pid written");
    tokio::time::sleep(Duration::from_millis(200)).await;

    engine.scripts().stop(&key()).await.unwrap();
    assert_eq!(next_status(&mut rx).await.0, RunStatus::Stopped);
    // Grace window plus slack for the forceful signal to land.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(!is_alive(grandchild), "grandchild {} survived stop", grandchild);
}

/// Zombies awaiting a reaper count as gone.
fn is_alive(pid: i32) -> bool {
    let mut sys = System::new();
    sys.refresh_processes();
    sys.process(Pid::from_u32(pid as u32))
        .map(|p| p.status() != ProcessStatus::Zombie)
        .unwrap_or(false)
}

#[tokio::test]
async fn shutdown_stops_everything() {
    let (engine, mut rx) = procdeck::engine(config());
    for script in ["a", "b"] {
        let params = ExecuteScriptParams {
            script_id: script.into(),
            ..execute_params("sleep 30")
        };
        engine.scripts().execute(&params).await.unwrap();
    }
    engine.shutdown().await;

    let mut stopped = 0;
    while stopped < 2 {
        if next_status(&mut rx).await.0 == RunStatus::Stopped {
            stopped += 1;
        }
    }
    assert!(engine.scripts().list().await.is_empty());
}
