use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_KILL_GRACE_MS: u64 = 5_000;
pub const DEFAULT_PROMPT_DELAY_MS: u64 = 100;

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub default_shell: Option<String>,
    pub kill_grace: Duration,
    pub prompt_delay: Duration,
    pub default_cwd: PathBuf,
    pub audit_log_file: Option<PathBuf>,
    pub audit_log_max_size_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            default_shell: None,
            kill_grace: Duration::from_millis(DEFAULT_KILL_GRACE_MS),
            prompt_delay: Duration::from_millis(DEFAULT_PROMPT_DELAY_MS),
            default_cwd: home_or_current_dir(),
            audit_log_file: None,
            audit_log_max_size_bytes: 10 * 1024 * 1024,
        }
    }
}

fn home_or_current_dir() -> PathBuf {
    let home = shellexpand::tilde("~");
    let home = PathBuf::from(home.as_ref());
    if home.is_dir() {
        home
    } else {
        std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
    }
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

fn megabytes(mb: u64) -> u64 {
    mb.saturating_mul(1024 * 1024)
}

fn parse_millis(var: &str, default: u64) -> Result<Duration> {
    let raw = std::env::var(var).unwrap_or_else(|_| default.to_string());
    let millis = raw
        .trim()
        .parse::<u64>()
        .with_context(|| format!("Invalid {}: '{}'", var, raw))?;
    Ok(Duration::from_millis(millis))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let defaults = Config::default();

        let log_level = std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level);
        let default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.trim().is_empty());

        let kill_grace = parse_millis("KILL_GRACE_MS", DEFAULT_KILL_GRACE_MS)?;
        let prompt_delay = parse_millis("PROMPT_DELAY_MS", DEFAULT_PROMPT_DELAY_MS)?;

        let default_cwd = match std::env::var("DEFAULT_CWD") {
            Ok(dir) if !dir.trim().is_empty() => {
                let expanded = expand_tilde(dir.trim());
                if !expanded.is_dir() {
                    anyhow::bail!("DEFAULT_CWD is not a directory: {}", expanded.display());
                }
                dunce::canonicalize(&expanded)
                    .with_context(|| format!("Failed to canonicalize DEFAULT_CWD: {}", expanded.display()))?
            }
            _ => defaults.default_cwd,
        };

        let audit_log_file = std::env::var("AUDIT_LOG_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(|s| expand_tilde(s.trim()));

        let audit_log_max_size_bytes = std::env::var("AUDIT_LOG_MAX_SIZE_MB")
            .unwrap_or_else(|_| "10".to_string()) // Default 10 MB
            .parse::<u64>()
            .map(megabytes)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Invalid AUDIT_LOG_MAX_SIZE_MB, using 10 MB");
                defaults.audit_log_max_size_bytes
            });

        Ok(Config {
            log_level,
            default_shell,
            kill_grace,
            prompt_delay,
            default_cwd,
            audit_log_file,
            audit_log_max_size_bytes,
        })
    }

    /// Shortens the timers for tests that exercise escalation.
    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }
}
