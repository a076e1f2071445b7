//! Outbound event channel from the engine to whoever drives the UI.
//!
//! Every manager holds a clone of [`EventBus`]. Sending never blocks and a
//! missing receiver is not an error: the UI may have gone away during
//! shutdown while processes are still being reaped.

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Stopped,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum EngineEvent {
    #[serde(rename = "script.output", rename_all = "camelCase")]
    ScriptOutput {
        project_id: String,
        script_id: String,
        stream: StreamKind,
        data: String,
    },
    #[serde(rename = "script.status", rename_all = "camelCase")]
    ScriptStatus {
        project_id: String,
        script_id: String,
        status: RunStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "terminal.data")]
    TerminalData { id: String, data: String },
    #[serde(rename = "terminal.exit")]
    TerminalExit {
        id: String,
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[serde(rename = "terminal.error")]
    TerminalError { id: String, error: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EventBus {
    pub fn new(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }

    /// Creates a bus together with the receiving half.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EngineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Err(e) = self.tx.send(event) {
            trace!(event = ?e.0, "Event dropped, no receiver attached");
        }
    }

    pub fn terminal_data(&self, id: &str, data: impl Into<String>) {
        self.emit(EngineEvent::TerminalData {
            id: id.to_string(),
            data: data.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn script_status_serializes_with_camel_case_fields() {
        let event = EngineEvent::ScriptStatus {
            project_id: "p1".into(),
            script_id: "dev".into(),
            status: RunStatus::Stopped,
            exit_code: Some(0),
            error: None,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "script.status",
                "projectId": "p1",
                "scriptId": "dev",
                "status": "stopped",
                "exitCode": 0
            })
        );
    }

    #[test]
    fn terminal_exit_keeps_null_code_and_signal() {
        let event = EngineEvent::TerminalExit {
            id: "t1".into(),
            code: None,
            signal: Some(9),
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({"event": "terminal.exit", "id": "t1", "code": null, "signal": 9})
        );
    }

    #[tokio::test]
    async fn emit_without_receiver_is_silent() {
        let (bus, rx) = EventBus::channel();
        drop(rx);
        bus.terminal_data("t1", "ignored");
    }
}
