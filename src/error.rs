use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Script not running: {0}")]
    ScriptNotFound(String),

    #[error("Session not found for ID: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Session is not active: {0}")]
    SessionInactive(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}

impl AppError {
    /// Short machine-readable tag the UI can branch on.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ScriptNotFound(_) | AppError::SessionNotFound(_) => "not_found",
            AppError::SessionExists(_) => "already_exists",
            AppError::SessionInactive(_) => "inactive",
            AppError::SpawnFailed(_) => "spawn_failed",
            AppError::InvalidInputArgument(_) | AppError::InvalidPath(_) => "invalid_argument",
            AppError::ProcessError(_) => "process_error",
            AppError::StdIoError(_) | AppError::SerdeJsonError(_) | AppError::ConfigError(_) => "internal",
        }
    }
}
