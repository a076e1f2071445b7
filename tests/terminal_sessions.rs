#![cfg(unix)]

use procdeck::config::Config;
use procdeck::error::AppError;
use procdeck::events::EngineEvent;
use procdeck::ipc::handler::Engine;
use procdeck::tools::terminal_tool::{
    prompt, ChangeDirectoryParams, CreateTerminalParams, ExecuteInTerminalParams, ResizeTerminalParams,
    TerminalIdParams, WriteTerminalParams,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(300);

struct Harness {
    engine: Engine,
    rx: UnboundedReceiver<EngineEvent>,
    dir: tempfile::TempDir,
    cwd: PathBuf,
}

async fn start() -> Harness {
    let config = Config::default()
        .with_kill_grace(Duration::from_millis(500))
        .with_prompt_delay(Duration::ZERO);
    let (engine, rx) = procdeck::engine(config);
    let dir = tempfile::tempdir().unwrap();
    let cwd = dunce::canonicalize(dir.path()).unwrap();
    let params = CreateTerminalParams {
        id: "t1".into(),
        cwd: Some(cwd.display().to_string()),
        ..Default::default()
    };
    let created = engine.terminals().create(&params).await.unwrap();
    assert_eq!(created.cwd, cwd.display().to_string());

    let mut harness = Harness { engine, rx, dir, cwd };
    let expected = prompt(&harness.cwd);
    harness.read_until(&expected).await;
    harness
}

impl Harness {
    async fn write(&self, data: &str) {
        let params = WriteTerminalParams {
            id: "t1".into(),
            data: data.into(),
        };
        self.engine.terminals().write(&params).await.unwrap();
    }

    /// Concatenates terminal data until `needle` shows up.
    async fn read_until(&mut self, needle: &str) -> String {
        let mut seen = String::new();
        while !seen.contains(needle) {
            let event = timeout(WAIT, self.rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}, got {:?}", needle, seen))
                .expect("bus closed");
            match event {
                EngineEvent::TerminalData { id, data } => {
                    assert_eq!(id, "t1");
                    seen.push_str(&data);
                }
                other => panic!("unexpected event {:?} while waiting for {:?}", other, needle),
            }
        }
        seen
    }

    /// Everything emitted within a short quiet window.
    async fn drain_quiet(&mut self) -> Vec<EngineEvent> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = timeout(QUIET, self.rx.recv()).await {
            events.push(event);
        }
        events
    }

    fn prompt(&self) -> String {
        prompt(&self.cwd)
    }
}

fn id() -> TerminalIdParams {
    TerminalIdParams { id: "t1".into() }
}

#[tokio::test]
async fn typed_command_runs_and_reprompts() {
    let mut h = start().await;
    h.write("echo ok\r").await;
    let expected = format!("ok\r\n{}", h.prompt());
    let seen = h.read_until(&expected).await;
    assert!(seen.starts_with("echo ok\r\n"), "got {:?}", seen);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn output_without_newline_gets_one_before_prompt() {
    let mut h = start().await;
    h.write("printf partial\r").await;
    let expected = format!("partial\r\n{}", h.prompt());
    h.read_until(&expected).await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn interrupt_at_idle_prompt_only_reprompts() {
    let mut h = start().await;
    h.write("abc\u{3}").await;
    let expected = format!("abc^C\r\n{}", h.prompt());
    h.read_until(&expected).await;

    h.engine.terminals().interrupt(&id()).await.unwrap();
    let expected = format!("^C\r\n{}", h.prompt());
    h.read_until(&expected).await;

    let rest = h.drain_quiet().await;
    assert!(rest.is_empty(), "unexpected events {:?}", rest);
    let info = h.engine.terminals().info(&id()).await.unwrap();
    assert!(info.is_active);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn erase_on_empty_buffer_echoes_nothing() {
    let mut h = start().await;
    h.write("\u{7f}\u{8}").await;
    assert!(h.drain_quiet().await.is_empty());

    h.write("ab\u{7f}").await;
    h.read_until("ab\u{8} \u{8}").await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn foreground_command_receives_typed_input() {
    let mut h = start().await;
    h.write("read line; echo got $line\r").await;
    h.read_until("read line; echo got $line\r\n").await;
    h.write("hi\r").await;
    let expected = format!("got hi\r\n{}", h.prompt());
    h.read_until(&expected).await;
    h.engine.shutdown().await;
}

#[tokio::test]
async fn interrupt_stops_foreground_command() {
    let mut h = start().await;
    h.write("sleep 30\r").await;
    h.read_until("sleep 30\r\n").await;
    assert!(h.engine.terminals().info(&id()).await.unwrap().busy);

    h.write("\u{3}").await;
    let expected = format!("^C\r\n{}", h.prompt());
    h.read_until(&expected).await;
    assert!(!h.engine.terminals().info(&id()).await.unwrap().busy);

    // The interrupted command's exit must not print a second prompt.
    assert!(h.drain_quiet().await.is_empty());
    h.engine.shutdown().await;
}

#[tokio::test]
async fn large_paste_into_busy_command_does_not_stall_session() {
    let mut h = start().await;
    h.write("sleep 30\r").await;
    h.read_until("sleep 30\r\n").await;

    // Far more than a pipe buffer, sent to a command that never reads stdin.
    let paste = WriteTerminalParams {
        id: "t1".into(),
        data: "x".repeat(200_000),
    };
    timeout(Duration::from_secs(3), h.engine.terminals().write(&paste))
        .await
        .expect("write stalled")
        .unwrap();
    timeout(Duration::from_secs(3), h.engine.terminals().interrupt(&id()))
        .await
        .expect("interrupt stalled")
        .unwrap();

    let expected = format!("^C\r\n{}", h.prompt());
    h.read_until(&expected).await;
    assert!(!h.engine.terminals().info(&id()).await.unwrap().busy);
    h.engine.shutdown().await;
}

#[tokio::test]
async fn cd_changes_where_commands_run() {
    let mut h = start().await;
    std::fs::create_dir(h.dir.path().join("sub")).unwrap();
    let sub = h.cwd.join("sub");

    let params = ChangeDirectoryParams {
        id: "t1".into(),
        directory: "sub".into(),
    };
    h.engine.terminals().change_directory(&params).await.unwrap();
    let expected = format!("\r\nChanged directory to {}\r\n{}", sub.display(), prompt(&sub));
    h.read_until(&expected).await;

    let run = ExecuteInTerminalParams {
        id: "t1".into(),
        command: "pwd".into(),
    };
    h.engine.terminals().execute(&run).await.unwrap();
    let expected = format!("{}\r\n{}", sub.display(), prompt(&sub));
    h.read_until(&expected).await;

    h.write("cd ..\r").await;
    let expected = format!("cd ..\r\n{}", h.prompt());
    h.read_until(&expected).await;

    let missing = ChangeDirectoryParams {
        id: "t1".into(),
        directory: "nowhere".into(),
    };
    assert!(matches!(
        h.engine.terminals().change_directory(&missing).await,
        Err(AppError::InvalidPath(_))
    ));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn resize_records_geometry() {
    let h = start().await;
    let params = ResizeTerminalParams {
        id: "t1".into(),
        cols: 132,
        rows: 43,
    };
    h.engine.terminals().resize(&params).await.unwrap();
    let info = h.engine.terminals().info(&id()).await.unwrap();
    assert_eq!((info.cols, info.rows), (132, 43));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn duplicate_id_is_rejected() {
    let h = start().await;
    let params = CreateTerminalParams {
        id: "t1".into(),
        ..Default::default()
    };
    assert!(matches!(
        h.engine.terminals().create(&params).await,
        Err(AppError::SessionExists(_))
    ));
    h.engine.shutdown().await;
}

#[tokio::test]
async fn kill_emits_exit_exactly_once() {
    let mut h = start().await;
    h.engine.terminals().kill(&id()).await.unwrap();

    // Input after kill is refused while the shell is going down.
    let write = WriteTerminalParams {
        id: "t1".into(),
        data: "ls\r".into(),
    };
    match h.engine.terminals().write(&write).await {
        Err(AppError::SessionInactive(_)) | Err(AppError::SessionNotFound(_)) => {}
        other => panic!("unexpected write result {:?}", other),
    }

    let event = timeout(WAIT, h.rx.recv()).await.unwrap().unwrap();
    assert!(matches!(event, EngineEvent::TerminalExit { ref id, .. } if id == "t1"), "got {:?}", event);
    assert!(h.drain_quiet().await.is_empty());

    assert!(h.engine.terminals().list().await.is_empty());
    assert!(matches!(h.engine.terminals().kill(&id()).await, Err(AppError::SessionNotFound(_))));
}

#[tokio::test]
async fn shutdown_closes_sessions() {
    let mut h = start().await;
    h.write("sleep 30\r").await;
    h.read_until("sleep 30\r\n").await;

    h.engine.shutdown().await;
    let mut exits = 0;
    for event in h.drain_quiet().await {
        if let EngineEvent::TerminalExit { .. } = event {
            exits += 1;
        }
    }
    assert_eq!(exits, 1);
    assert!(h.engine.terminals().list().await.is_empty());
}
