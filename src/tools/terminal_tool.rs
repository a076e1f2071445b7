use crate::config::Config;
use crate::error::AppError;
use crate::events::{EngineEvent, EventBus};
use crate::tools::command_executor::{self, PreparedLine};
use crate::tools::input_interpreter::{push_coalesced, InputAction, InputInterpreter, InputMode};
use crate::tools::output_pump;
use crate::tools::platform::{PlatformProfile, ResolvedShell};
use crate::tools::termination::{self, ExitSignal, ProcessHandle, TerminationSupervisor};
use crate::utils::line_ending_handler::to_crlf;
use crate::utils::path_utils::{resolve_directory, resolve_optional_directory};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio as StdProcessStdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::{Child, ChildStdin, Command as TokioCommand};
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CreateTerminalParams {
    pub id: String,
    pub shell: Option<String>,
    pub cwd: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub cols: Option<u16>,
    pub rows: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WriteTerminalParams {
    pub id: String,
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResizeTerminalParams {
    pub id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecuteInTerminalParams {
    pub id: String,
    pub command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChangeDirectoryParams {
    pub id: String,
    pub directory: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TerminalIdParams {
    pub id: String,
}

#[derive(Debug, Serialize)]
pub struct CreateTerminalResult {
    pub id: String,
    pub pid: Option<u32>,
    pub shell: String,
    pub cwd: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalInfo {
    pub id: String,
    pub cwd: String,
    pub shell: String,
    pub is_active: bool,
    pub pid: Option<u32>,
    pub busy: bool,
    pub cols: u16,
    pub rows: u16,
}

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

pub fn prompt(cwd: &Path) -> String {
    format!("{}> ", cwd.display())
}

#[derive(Debug)]
struct ForegroundCommand {
    command_id: Uuid,
    handle: ProcessHandle,
    // Drained by a writer task; sending never waits on the child.
    input: Option<mpsc::UnboundedSender<String>>,
}

#[derive(Debug)]
struct TerminalSession {
    // Session ids may be reused after a kill; the generation tells stale tasks apart.
    generation: Uuid,
    shell: ResolvedShell,
    shell_handle: ProcessHandle,
    // Held open so the idle shell never sees EOF.
    shell_stdin: Option<ChildStdin>,
    cwd: PathBuf,
    env: HashMap<String, String>,
    is_active: bool,
    input: InputInterpreter,
    foreground: Option<ForegroundCommand>,
    cols: u16,
    rows: u16,
}

impl TerminalSession {
    fn info(&self, id: &str) -> TerminalInfo {
        TerminalInfo {
            id: id.to_string(),
            cwd: self.cwd.display().to_string(),
            shell: self.shell.program.clone(),
            is_active: self.is_active,
            pid: self.shell_handle.pid(),
            busy: self.foreground.is_some(),
            cols: self.cols,
            rows: self.rows,
        }
    }
}

type SessionMap = Arc<TokioMutex<HashMap<String, TerminalSession>>>;

#[derive(Debug)]
pub struct TerminalManager {
    config: Arc<Config>,
    events: EventBus,
    supervisor: TerminationSupervisor,
    profile: &'static PlatformProfile,
    sessions: SessionMap,
}

impl TerminalManager {
    pub fn new(
        config: Arc<Config>,
        events: EventBus,
        supervisor: TerminationSupervisor,
        profile: &'static PlatformProfile,
    ) -> Self {
        Self {
            config,
            events,
            supervisor,
            profile,
            sessions: Arc::new(TokioMutex::new(HashMap::new())),
        }
    }

    #[instrument(skip(self, params), fields(sid = %params.id))]
    pub async fn create(&self, params: &CreateTerminalParams) -> Result<CreateTerminalResult, AppError> {
        let id = params.id.trim();
        if id.is_empty() {
            return Err(AppError::InvalidInputArgument("terminal id must be non-empty".to_string()));
        }

        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(id) {
            return Err(AppError::SessionExists(id.to_string()));
        }

        let cwd = resolve_optional_directory(params.cwd.as_deref(), &self.config.default_cwd)?;
        let requested_shell = params.shell.as_deref().or(self.config.default_shell.as_deref());
        let shell = self.profile.resolve_shell(requested_shell);
        let env = self.profile.build_environment(&params.env.clone().unwrap_or_default());

        let mut command = TokioCommand::new(&shell.program);
        command
            .args(&shell.args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdin(StdProcessStdio::piped())
            .stdout(StdProcessStdio::piped())
            .stderr(StdProcessStdio::piped());
        termination::isolate(&mut command);

        debug!(shell = %shell.program, cwd = %cwd.display(), "Spawning terminal shell");
        let mut child = command.spawn().map_err(|e| {
            error!(error = %e, shell = %shell.program, "Failed to spawn terminal shell");
            AppError::SpawnFailed(format!("{}: {}", shell.program, e))
        })?;
        let pid = require_pid(child.id())?;

        let (shell_handle, exit_signal) = termination::track(Some(pid));
        let generation = Uuid::new_v4();
        let shell_stdin = child.stdin.take();
        sessions.insert(
            id.to_string(),
            TerminalSession {
                generation,
                shell: shell.clone(),
                shell_handle,
                shell_stdin,
                cwd: cwd.clone(),
                env,
                is_active: true,
                input: InputInterpreter::new(),
                foreground: None,
                cols: params.cols.unwrap_or(DEFAULT_COLS),
                rows: params.rows.unwrap_or(DEFAULT_ROWS),
            },
        );
        drop(sessions);
        info!(sid = %id, pid, shell = %shell.program, cwd = %cwd.display(), "Terminal session created");

        tokio::spawn(monitor_shell(
            self.sessions.clone(),
            self.events.clone(),
            self.supervisor.clone(),
            id.to_string(),
            generation,
            child,
            exit_signal,
        ));
        self.schedule_initial_prompt(id.to_string(), generation);

        Ok(CreateTerminalResult {
            id: id.to_string(),
            pid: Some(pid),
            shell: shell.program,
            cwd: cwd.display().to_string(),
        })
    }

    fn schedule_initial_prompt(&self, id: String, generation: Uuid) {
        let sessions = self.sessions.clone();
        let events = self.events.clone();
        let delay = self.config.prompt_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let sessions = sessions.lock().await;
            if let Some(session) = sessions.get(&id) {
                if session.generation == generation && session.is_active {
                    events.terminal_data(&id, prompt(&session.cwd));
                }
            }
        });
    }

    /// Feeds raw keystrokes through the session's input state machine.
    #[instrument(skip(self, params), fields(sid = %params.id, len = params.data.len()))]
    pub async fn write(&self, params: &WriteTerminalParams) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().await;
        let session = active_session(&mut sessions, &params.id)?;

        let mut pending: Vec<InputAction> = Vec::new();
        for c in params.data.chars() {
            let mode = if session.foreground.is_some() {
                InputMode::Passthrough
            } else {
                InputMode::Line
            };
            for action in session.input.step(c, mode) {
                match action {
                    InputAction::Submit(line) => {
                        self.flush(&params.id, session, &mut pending);
                        self.submit_line(&params.id, session, &line);
                    }
                    InputAction::Interrupt => {
                        self.flush(&params.id, session, &mut pending);
                        self.interrupt_session(&params.id, session);
                    }
                    text => push_coalesced(&mut pending, text),
                }
            }
        }
        self.flush(&params.id, session, &mut pending);
        Ok(())
    }

    /// Emits pending echo as one event and queues pending input for the
    /// foreground command. Never awaits, since the session map is locked.
    fn flush(&self, id: &str, session: &mut TerminalSession, pending: &mut Vec<InputAction>) {
        let mut echo = String::new();
        let mut forward = String::new();
        for action in pending.drain(..) {
            match action {
                InputAction::Echo(text) => echo.push_str(&text),
                InputAction::Forward(text) => forward.push_str(&text),
                InputAction::Submit(_) | InputAction::Interrupt => {}
            }
        }
        if !echo.is_empty() {
            self.events.terminal_data(id, echo);
        }
        if forward.is_empty() {
            return;
        }
        let Some(input) = session.foreground.as_ref().and_then(|fg| fg.input.as_ref()) else {
            return;
        };
        if input.send(forward).is_err() {
            // The command closed its stdin; keystrokes are only echoed from here on.
            debug!(sid = %id, "Foreground command no longer reads input");
        }
    }

    fn submit_line(&self, id: &str, session: &mut TerminalSession, line: &str) {
        match command_executor::prepare_line(self.profile, line) {
            PreparedLine::Empty => self.events.terminal_data(id, prompt(&session.cwd)),
            PreparedLine::ChangeDirectory(target) => match resolve_directory(&target, &session.cwd) {
                Ok(dir) => {
                    debug!(sid = %id, cwd = %dir.display(), "Directory changed from input");
                    session.cwd = dir;
                    self.events.terminal_data(id, prompt(&session.cwd));
                }
                Err(e) => {
                    self.events
                        .terminal_data(id, format!("cd: {}\r\n{}", e, prompt(&session.cwd)));
                }
            },
            PreparedLine::Run(command) => {
                match command_executor::spawn_command(self.profile, &command, &session.cwd, &session.env) {
                    Ok(spawned) => {
                        let command_id = Uuid::new_v4();
                        session.foreground = Some(ForegroundCommand {
                            command_id,
                            handle: spawned.handle,
                            input: spawned
                                .stdin
                                .map(|stdin| command_executor::spawn_stdin_writer(id.to_string(), stdin)),
                        });
                        tokio::spawn(monitor_foreground(
                            self.sessions.clone(),
                            self.events.clone(),
                            id.to_string(),
                            session.generation,
                            command_id,
                            spawned.child,
                            spawned.exit_signal,
                        ));
                    }
                    Err(e) => {
                        self.events
                            .terminal_data(id, format!("{}\r\n{}", e, prompt(&session.cwd)));
                    }
                }
            }
        }
    }

    fn interrupt_session(&self, id: &str, session: &mut TerminalSession) {
        session.input.clear();
        if let Some(foreground) = session.foreground.take() {
            info!(sid = %id, pid = ?foreground.handle.pid(), "Interrupting foreground command");
            self.supervisor.terminate(&foreground.handle);
        }
        self.events.terminal_data(id, format!("^C\r\n{}", prompt(&session.cwd)));
    }

    /// Same as typing Ctrl+C.
    #[instrument(skip(self, params), fields(sid = %params.id))]
    pub async fn interrupt(&self, params: &TerminalIdParams) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().await;
        let session = active_session(&mut sessions, &params.id)?;
        self.interrupt_session(&params.id, session);
        Ok(())
    }

    /// Runs `command` as if it had been typed followed by Enter.
    #[instrument(skip(self, params), fields(sid = %params.id))]
    pub async fn execute(&self, params: &ExecuteInTerminalParams) -> Result<(), AppError> {
        self.write(&WriteTerminalParams {
            id: params.id.clone(),
            data: format!("{}\r", params.command),
        })
        .await
    }

    /// Pipes cannot carry a window size, so this only records the geometry.
    #[instrument(skip(self, params), fields(sid = %params.id, cols = params.cols, rows = params.rows))]
    pub async fn resize(&self, params: &ResizeTerminalParams) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&params.id)
            .ok_or_else(|| AppError::SessionNotFound(params.id.clone()))?;
        session.cols = params.cols;
        session.rows = params.rows;
        Ok(())
    }

    /// Updates the recorded directory used for subsequent commands. The idle
    /// shell process itself is not moved.
    #[instrument(skip(self, params), fields(sid = %params.id))]
    pub async fn change_directory(&self, params: &ChangeDirectoryParams) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().await;
        let session = active_session(&mut sessions, &params.id)?;
        let dir = resolve_directory(&params.directory, &session.cwd)?;
        info!(sid = %params.id, cwd = %dir.display(), "Terminal directory changed");
        session.cwd = dir;
        self.events.terminal_data(
            &params.id,
            format!(
                "\r\nChanged directory to {}\r\n{}",
                session.cwd.display(),
                prompt(&session.cwd)
            ),
        );
        Ok(())
    }

    /// Starts tearing the session down. The entry is removed and
    /// `terminal.exit` emitted once the shell has actually exited.
    #[instrument(skip(self, params), fields(sid = %params.id))]
    pub async fn kill(&self, params: &TerminalIdParams) -> Result<(), AppError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(&params.id)
            .ok_or_else(|| AppError::SessionNotFound(params.id.clone()))?;

        session.is_active = false;
        session.input.clear();
        if let Some(foreground) = session.foreground.take() {
            self.supervisor.terminate(&foreground.handle);
        }
        self.supervisor.terminate(&session.shell_handle);
        session.shell_stdin = None;
        info!(sid = %params.id, pid = ?session.shell_handle.pid(), "Terminal kill requested");
        Ok(())
    }

    pub async fn info(&self, params: &TerminalIdParams) -> Option<TerminalInfo> {
        let sessions = self.sessions.lock().await;
        sessions.get(&params.id).map(|s| s.info(&params.id))
    }

    pub async fn list(&self) -> Vec<TerminalInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<TerminalInfo> = sessions.iter().map(|(id, s)| s.info(id)).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    /// Terminates every foreground command and shell, waiting for all of them.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let handles: Vec<(String, ProcessHandle)> = {
            let mut sessions = self.sessions.lock().await;
            let mut handles = Vec::new();
            for (id, session) in sessions.iter_mut() {
                session.is_active = false;
                if let Some(foreground) = session.foreground.take() {
                    handles.push((id.clone(), foreground.handle));
                }
                handles.push((id.clone(), session.shell_handle.clone()));
                session.shell_stdin = None;
            }
            handles
        };
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Stopping all terminal processes");

        let mut set = JoinSet::new();
        for (id, handle) in handles {
            let supervisor = self.supervisor.clone();
            set.spawn(async move {
                if !supervisor.terminate_and_wait(&handle).await {
                    warn!(sid = %id, pid = ?handle.pid(), "Terminal process did not exit during shutdown");
                }
            });
        }
        while set.join_next().await.is_some() {}
    }
}

/// A child that was reaped before reporting a pid counts as a failed spawn.
fn require_pid(pid: Option<u32>) -> Result<u32, AppError> {
    pid.ok_or_else(|| AppError::SpawnFailed("spawn failed: no process id".to_string()))
}

fn active_session<'a>(
    sessions: &'a mut HashMap<String, TerminalSession>,
    id: &str,
) -> Result<&'a mut TerminalSession, AppError> {
    let session = sessions
        .get_mut(id)
        .ok_or_else(|| AppError::SessionNotFound(id.to_string()))?;
    if !session.is_active {
        return Err(AppError::SessionInactive(id.to_string()));
    }
    Ok(session)
}

#[cfg(unix)]
fn exit_signal_number(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal_number(_status: &ExitStatus) -> Option<i32> {
    None
}

async fn monitor_shell(
    sessions: SessionMap,
    events: EventBus,
    supervisor: TerminationSupervisor,
    id: String,
    generation: Uuid,
    mut child: Child,
    exit_signal: ExitSignal,
) {
    let line_start = Arc::new(AtomicBool::new(true));
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(command_executor::forward_to_terminal(
            stdout,
            events.clone(),
            id.clone(),
            line_start.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(command_executor::forward_to_terminal(
            stderr,
            events.clone(),
            id.clone(),
            line_start.clone(),
        )));
    }

    let status = child.wait().await;
    exit_signal.mark_exited();
    output_pump::drain(readers).await;

    let mut sessions = sessions.lock().await;
    let Some(session) = sessions.get(&id) else {
        return;
    };
    if session.generation != generation {
        return;
    }
    let foreground = sessions.remove(&id).and_then(|s| s.foreground);
    drop(sessions);
    // The shell is gone; its session's command must not outlive it.
    if let Some(foreground) = foreground {
        supervisor.terminate(&foreground.handle);
    }

    match status {
        Ok(status) => {
            let code = status.code();
            let signal = exit_signal_number(&status);
            info!(sid = %id, ?code, ?signal, "Terminal shell exited");
            events.emit(EngineEvent::TerminalExit { id, code, signal });
        }
        Err(e) => {
            error!(sid = %id, error = %e, "Terminal shell failed");
            events.emit(EngineEvent::TerminalError {
                id: id.clone(),
                error: e.to_string(),
            });
            events.emit(EngineEvent::TerminalExit {
                id,
                code: None,
                signal: None,
            });
        }
    }
}

async fn monitor_foreground(
    sessions: SessionMap,
    events: EventBus,
    id: String,
    generation: Uuid,
    command_id: Uuid,
    child: Child,
    exit_signal: ExitSignal,
) {
    let line_start = Arc::new(AtomicBool::new(true));
    let result =
        command_executor::stream_until_closed(child, exit_signal, events.clone(), id.clone(), line_start.clone())
            .await;

    let mut sessions = sessions.lock().await;
    let Some(session) = sessions.get_mut(&id) else {
        return;
    };
    let is_current = session.generation == generation
        && session
            .foreground
            .as_ref()
            .is_some_and(|fg| fg.command_id == command_id);
    if !is_current {
        // Interrupted or killed: whoever cleared it already printed the prompt.
        return;
    }
    session.foreground = None;

    let mut text = String::new();
    if !line_start.load(Ordering::SeqCst) {
        text.push_str("\r\n");
    }
    match result {
        Ok(status) => debug!(sid = %id, code = ?status.code(), "Terminal command closed"),
        Err(e) => {
            warn!(sid = %id, error = %e, "Terminal command failed");
            text.push_str(&to_crlf(&format!("{}\n", AppError::ProcessError(e.to_string()))));
        }
    }
    text.push_str(&prompt(&session.cwd));
    if session.is_active {
        events.terminal_data(&id, text);
    }
}
