use crate::error::AppError;
use crate::events::{EngineEvent, EventBus, RunStatus, StreamKind};
use crate::tools::output_pump;
use crate::tools::platform::PlatformProfile;
use crate::tools::termination::{self, ExitSignal, ProcessHandle, Termination, TerminationSupervisor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio as StdProcessStdio};
use std::sync::Arc;
use std::time::Instant;
use tokio::process::Child;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteScriptParams {
    pub project_id: String,
    pub script_id: String,
    pub command: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptKeyParams {
    pub project_id: String,
    pub script_id: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteScriptResult {
    pub pid: Option<u32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRunInfo {
    pub project_id: String,
    pub script_id: String,
    pub pid: Option<u32>,
    pub command: String,
    pub started_at: String,
    pub runtime_ms: u128,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptKey {
    pub project_id: String,
    pub script_id: String,
}

impl ScriptKey {
    pub fn new(project_id: impl Into<String>, script_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            script_id: script_id.into(),
        }
    }
}

impl From<&ScriptKeyParams> for ScriptKey {
    fn from(params: &ScriptKeyParams) -> Self {
        ScriptKey::new(&params.project_id, &params.script_id)
    }
}

impl fmt::Display for ScriptKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.project_id, self.script_id)
    }
}

#[derive(Debug)]
struct ScriptRun {
    // Distinguishes a replaced run from its successor under the same key.
    run_id: Uuid,
    handle: ProcessHandle,
    command: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

type RunMap = Arc<TokioMutex<HashMap<ScriptKey, ScriptRun>>>;

/// Splits on whitespace and rejoins with single spaces. No quoting support:
/// `echo "a  b"` loses the double space.
pub fn normalize_command(command: &str) -> Result<String, AppError> {
    let mut parts = command.split_whitespace();
    let program = parts
        .next()
        .ok_or_else(|| AppError::InvalidInputArgument("Empty command".to_string()))?;
    Ok(std::iter::once(program).chain(parts).collect::<Vec<_>>().join(" "))
}

#[derive(Debug)]
pub struct ScriptManager {
    events: EventBus,
    supervisor: TerminationSupervisor,
    profile: &'static PlatformProfile,
    runs: RunMap,
}

impl ScriptManager {
    pub fn new(events: EventBus, supervisor: TerminationSupervisor, profile: &'static PlatformProfile) -> Self {
        Self {
            events,
            supervisor,
            profile,
            runs: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    #[instrument(skip(self, params), fields(project_id = %params.project_id, script_id = %params.script_id))]
    pub async fn execute(&self, params: &ExecuteScriptParams) -> Result<ExecuteScriptResult, AppError> {
        let line = normalize_command(&params.command)?;
        let key = ScriptKey::new(&params.project_id, &params.script_id);

        let mut runs = self.runs.lock().await;

        if let Some(previous) = runs.remove(&key) {
            info!(key = %key, pid = ?previous.handle.pid(), "Replacing running script");
            self.supervisor.terminate(&previous.handle);
        }

        let mut command = self.profile.interpreter_command(&line);
        command
            .current_dir(PathBuf::from(&params.cwd))
            .stdin(StdProcessStdio::null())
            .stdout(StdProcessStdio::piped())
            .stderr(StdProcessStdio::piped());
        termination::isolate(&mut command);

        debug!(command = %line, cwd = %params.cwd, "Spawning script");
        let child = command.spawn().map_err(|e| {
            error!(error = %e, command = %line, "Failed to spawn script");
            AppError::SpawnFailed(format!("'{}': {}", line, e))
        })?;

        let pid = child.id();
        let (handle, exit_signal) = termination::track(pid);
        let run_id = Uuid::new_v4();
        runs.insert(
            key.clone(),
            ScriptRun {
                run_id,
                handle,
                command: line.clone(),
                started_at: Utc::now(),
                started: Instant::now(),
            },
        );
        self.events.emit(EngineEvent::ScriptStatus {
            project_id: key.project_id.clone(),
            script_id: key.script_id.clone(),
            status: RunStatus::Running,
            exit_code: None,
            error: None,
        });
        info!(key = %key, pid = ?pid, command = %line, "Script started");

        tokio::spawn(monitor_run(
            self.runs.clone(),
            self.events.clone(),
            key,
            run_id,
            child,
            exit_signal,
        ));

        Ok(ExecuteScriptResult { pid })
    }

    /// Requests termination. The entry stays registered until the process
    /// actually exits so late output is still delivered.
    #[instrument(skip(self, params), fields(project_id = %params.project_id, script_id = %params.script_id))]
    pub async fn stop(&self, params: &ScriptKeyParams) -> Result<(), AppError> {
        let key = ScriptKey::from(params);
        let runs = self.runs.lock().await;
        let run = runs
            .get(&key)
            .ok_or_else(|| AppError::ScriptNotFound(key.to_string()))?;

        match self.supervisor.terminate(&run.handle) {
            Termination::Signalled(_) => info!(key = %key, pid = ?run.handle.pid(), "Stop requested"),
            Termination::AlreadyTerminating => debug!(key = %key, "Stop already in progress"),
            Termination::AlreadyExited => debug!(key = %key, "Script already exited, awaiting cleanup"),
        }
        Ok(())
    }

    pub async fn is_running(&self, params: &ScriptKeyParams) -> bool {
        self.runs.lock().await.contains_key(&ScriptKey::from(params))
    }

    pub async fn list(&self) -> Vec<ScriptRunInfo> {
        let runs = self.runs.lock().await;
        let mut infos: Vec<ScriptRunInfo> = runs
            .iter()
            .map(|(key, run)| ScriptRunInfo {
                project_id: key.project_id.clone(),
                script_id: key.script_id.clone(),
                pid: run.handle.pid(),
                command: run.command.clone(),
                started_at: run.started_at.to_rfc3339(),
                runtime_ms: run.started.elapsed().as_millis(),
            })
            .collect();
        infos.sort_by(|a, b| (&a.project_id, &a.script_id).cmp(&(&b.project_id, &b.script_id)));
        infos
    }

    /// Terminates every run and waits for all of them to exit.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let handles: Vec<(ScriptKey, ProcessHandle)> = {
            let runs = self.runs.lock().await;
            runs.iter().map(|(k, r)| (k.clone(), r.handle.clone())).collect()
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Stopping all scripts");

        let mut set = JoinSet::new();
        for (key, handle) in handles {
            let supervisor = self.supervisor.clone();
            set.spawn(async move {
                if !supervisor.terminate_and_wait(&handle).await {
                    warn!(key = %key, pid = ?handle.pid(), "Script did not exit during shutdown");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }
}

async fn monitor_run(
    runs: RunMap,
    events: EventBus,
    key: ScriptKey,
    run_id: Uuid,
    mut child: Child,
    exit_signal: ExitSignal,
) {
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_stream(stdout, events.clone(), key.clone(), StreamKind::Stdout)));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_stream(stderr, events.clone(), key.clone(), StreamKind::Stderr)));
    }

    let status = child.wait().await;
    exit_signal.mark_exited();
    output_pump::drain(readers).await;

    let mut runs = runs.lock().await;
    if runs.get(&key).is_some_and(|run| run.run_id == run_id) {
        runs.remove(&key);
    }
    events.emit(final_status(&key, status));
}

fn final_status(key: &ScriptKey, status: std::io::Result<ExitStatus>) -> EngineEvent {
    let (status, exit_code, error) = match status {
        Ok(exit) => {
            info!(key = %key, exit_code = ?exit.code(), "Script stopped");
            (RunStatus::Stopped, exit.code(), None)
        }
        Err(e) => {
            error!(key = %key, error = %e, "Failed to wait for script");
            (RunStatus::Error, None, Some(e.to_string()))
        }
    };
    EngineEvent::ScriptStatus {
        project_id: key.project_id.clone(),
        script_id: key.script_id.clone(),
        status,
        exit_code,
        error,
    }
}

async fn forward_stream<R>(reader: R, events: EventBus, key: ScriptKey, stream: StreamKind)
where
    R: tokio::io::AsyncRead + Unpin,
{
    output_pump::pump(reader, |data| {
        events.emit(EngineEvent::ScriptOutput {
            project_id: key.project_id.clone(),
            script_id: key.script_id.clone(),
            stream,
            data,
        });
    })
    .await;
}
