use crate::config::Config;
use crate::error::AppError;
use crate::events::EventBus;
use crate::ipc::protocol::{failure, parse_request, success, OutboundMessage};
use crate::tools::platform::{self, PlatformProfile};
use crate::tools::script_tool::{ExecuteScriptParams, ScriptKeyParams, ScriptManager};
use crate::tools::terminal_tool::{
    ChangeDirectoryParams, CreateTerminalParams, ExecuteInTerminalParams, ResizeTerminalParams, TerminalIdParams,
    TerminalManager, WriteTerminalParams,
};
use crate::tools::termination::TerminationSupervisor;
use crate::utils::audit_logger::AuditLogger;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// The process session engine: both registries plus the shared supervisor
/// configuration, driven either through [`Engine::handle_line`] or directly.
#[derive(Debug)]
pub struct Engine {
    config: Arc<Config>,
    script_manager: ScriptManager,
    terminal_manager: TerminalManager,
    audit_logger: Option<AuditLogger>,
}

impl Engine {
    pub fn new(config: Arc<Config>, events: EventBus) -> Self {
        Self::with_profile(config, events, platform::current())
    }

    pub fn with_profile(config: Arc<Config>, events: EventBus, profile: &'static PlatformProfile) -> Self {
        let supervisor = TerminationSupervisor::new(config.kill_grace, profile);
        let script_manager = ScriptManager::new(events.clone(), supervisor.clone(), profile);
        let terminal_manager = TerminalManager::new(config.clone(), events, supervisor, profile);
        let audit_logger = AuditLogger::from_config(&config);
        Self {
            config,
            script_manager,
            terminal_manager,
            audit_logger,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn scripts(&self) -> &ScriptManager {
        &self.script_manager
    }

    pub fn terminals(&self) -> &TerminalManager {
        &self.terminal_manager
    }

    /// Parses one request line and always produces a response, even for garbage input.
    pub async fn handle_line(&self, line: &str) -> OutboundMessage {
        match parse_request(line) {
            Ok(request) => {
                if let Some(audit) = &self.audit_logger {
                    audit.log_request(&request.method, &request.params).await;
                }
                let result = self.dispatch(&request.method, request.params).await;
                OutboundMessage::Response {
                    id: Some(request.id),
                    result,
                }
            }
            Err((id, err)) => {
                warn!(?id, error = %err, "Rejected malformed request");
                OutboundMessage::Response {
                    id,
                    result: failure(&err),
                }
            }
        }
    }

    #[instrument(skip(self, params))]
    pub async fn dispatch(&self, method: &str, params: Value) -> Value {
        debug!("Dispatching request");

        macro_rules! parse_params {
            ($param_type:ty) => {
                match serde_json::from_value::<$param_type>(params) {
                    Ok(parsed) => parsed,
                    Err(e) => return failure(&AppError::InvalidInputArgument(e.to_string())),
                }
            };
        }

        macro_rules! respond {
            ($result:expr) => {
                match $result {
                    Ok(payload) => success(payload),
                    Err(e) => failure(&e),
                }
            };
        }

        match method {
            "script.execute" => {
                let p = parse_params!(ExecuteScriptParams);
                respond!(self.script_manager.execute(&p).await)
            }
            "script.stop" => {
                let p = parse_params!(ScriptKeyParams);
                respond!(self.script_manager.stop(&p).await)
            }
            "script.isRunning" => {
                let p = parse_params!(ScriptKeyParams);
                success(json!({ "running": self.script_manager.is_running(&p).await }))
            }
            "script.list" => success(json!({ "scripts": self.script_manager.list().await })),
            "terminal.create" => {
                let p = parse_params!(CreateTerminalParams);
                respond!(self.terminal_manager.create(&p).await)
            }
            "terminal.write" => {
                let p = parse_params!(WriteTerminalParams);
                respond!(self.terminal_manager.write(&p).await)
            }
            "terminal.resize" => {
                let p = parse_params!(ResizeTerminalParams);
                respond!(self.terminal_manager.resize(&p).await)
            }
            "terminal.kill" => {
                let p = parse_params!(TerminalIdParams);
                respond!(self.terminal_manager.kill(&p).await)
            }
            "terminal.execute" => {
                let p = parse_params!(ExecuteInTerminalParams);
                respond!(self.terminal_manager.execute(&p).await)
            }
            "terminal.cd" => {
                let p = parse_params!(ChangeDirectoryParams);
                respond!(self.terminal_manager.change_directory(&p).await)
            }
            "terminal.interrupt" => {
                let p = parse_params!(TerminalIdParams);
                respond!(self.terminal_manager.interrupt(&p).await)
            }
            "terminal.info" => {
                let p = parse_params!(TerminalIdParams);
                success(json!({ "info": self.terminal_manager.info(&p).await }))
            }
            "terminal.list" => success(json!({ "terminals": self.terminal_manager.list().await })),
            _ => {
                warn!("Unknown method requested");
                failure(&AppError::InvalidInputArgument(format!("Unknown method: {}", method)))
            }
        }
    }

    /// Terminates every script run and terminal session, waiting for each to exit.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Shutting down process session engine");
        tokio::join!(self.script_manager.shutdown(), self.terminal_manager.shutdown());
        info!("All owned processes terminated");
    }
}
