//! One-shot execution of a submitted terminal line.
//!
//! Each line gets its own short-lived child running through the platform
//! command interpreter, scoped to the session's recorded directory and the
//! same minimal environment as the session shell.

use crate::error::AppError;
use crate::events::EventBus;
use crate::tools::output_pump;
use crate::tools::platform::PlatformProfile;
use crate::tools::termination::{self, ExitSignal, ProcessHandle};
use crate::utils::line_ending_handler::CrlfNormalizer;
use std::collections::HashMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio as StdProcessStdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tracing::{debug, error};

#[derive(Debug)]
pub struct SpawnedCommand {
    pub child: Child,
    pub handle: ProcessHandle,
    pub exit_signal: ExitSignal,
    pub stdin: Option<ChildStdin>,
}

/// What a submitted line turns into before anything is spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedLine {
    /// Whitespace only: just re-prompt.
    Empty,
    /// `cd <dir>`: handled in-process because a child's directory change would be lost.
    ChangeDirectory(String),
    Run(String),
}

pub fn prepare_line(profile: &PlatformProfile, line: &str) -> PreparedLine {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return PreparedLine::Empty;
    }
    let mut tokens = trimmed.splitn(2, char::is_whitespace);
    if tokens.next() == Some("cd") {
        if let Some(target) = tokens.next().map(str::trim).filter(|t| !t.is_empty()) {
            return PreparedLine::ChangeDirectory(target.trim_matches('"').to_string());
        }
    }
    PreparedLine::Run(profile.apply_alias(trimmed))
}

pub fn spawn_command(
    profile: &PlatformProfile,
    line: &str,
    cwd: &Path,
    env: &HashMap<String, String>,
) -> Result<SpawnedCommand, AppError> {
    let mut command = profile.interpreter_command(line);
    command
        .current_dir(cwd)
        .env_clear()
        .envs(env)
        .stdin(StdProcessStdio::piped())
        .stdout(StdProcessStdio::piped())
        .stderr(StdProcessStdio::piped());
    termination::isolate(&mut command);

    let mut child = command.spawn().map_err(|e| {
        error!(error = %e, command = %line, "Failed to spawn terminal command");
        AppError::SpawnFailed(e.to_string())
    })?;
    let (handle, exit_signal) = termination::track(child.id());
    debug!(pid = ?handle.pid(), command = %line, cwd = %cwd.display(), "Terminal command started");
    let stdin = child.stdin.take();
    Ok(SpawnedCommand {
        child,
        handle,
        exit_signal,
        stdin,
    })
}

/// Hands `stdin` to its own writer task and returns the queue feeding it.
///
/// Callers only ever enqueue, so a command that never reads its input can
/// fill the pipe without stalling anyone. The task ends when the sender is
/// dropped or the pipe breaks.
pub fn spawn_stdin_writer(session_id: String, mut stdin: ChildStdin) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = stdin.write_all(text.as_bytes()).await {
                debug!(sid = %session_id, error = %e, "Foreground command stopped accepting input");
                break;
            }
        }
    });
    tx
}

/// Streams both pipes as terminal data until the child exits and the pipes
/// are drained. `at_line_start` tracks whether the last byte shown was a newline.
pub async fn stream_until_closed(
    mut child: Child,
    exit_signal: ExitSignal,
    events: EventBus,
    session_id: String,
    at_line_start: Arc<AtomicBool>,
) -> std::io::Result<ExitStatus> {
    let mut readers = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        readers.push(tokio::spawn(forward_to_terminal(
            stdout,
            events.clone(),
            session_id.clone(),
            at_line_start.clone(),
        )));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(tokio::spawn(forward_to_terminal(
            stderr,
            events.clone(),
            session_id.clone(),
            at_line_start.clone(),
        )));
    }

    let status = child.wait().await;
    exit_signal.mark_exited();
    output_pump::drain(readers).await;
    status
}

pub async fn forward_to_terminal<R>(reader: R, events: EventBus, session_id: String, at_line_start: Arc<AtomicBool>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut normalizer = CrlfNormalizer::new();
    output_pump::pump(reader, |chunk| {
        let data = normalizer.normalize(&chunk);
        at_line_start.store(normalizer.at_line_start(), Ordering::SeqCst);
        events.terminal_data(&session_id, data);
    })
    .await;
}
