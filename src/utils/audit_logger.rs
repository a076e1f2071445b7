use crate::config::Config;
use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::error;

const MAX_LOGGED_FIELD_LEN: usize = 1024;

// Fields that carry keystrokes or whole command lines and can get large.
const TRUNCATED_FIELDS: [&str; 2] = ["data", "command"];

#[derive(Debug)]
pub struct AuditLogger {
    log_file_path: PathBuf,
    max_size_bytes: u64,
}

impl AuditLogger {
    /// `None` when no audit file is configured.
    pub fn from_config(config: &Config) -> Option<Self> {
        let path = config.audit_log_file.clone()?;
        if let Some(parent_dir) = path.parent() {
            if !parent_dir.as_os_str().is_empty() && !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create audit log directory");
                }
            }
        }
        Some(Self {
            log_file_path: path,
            max_size_bytes: config.audit_log_max_size_bytes,
        })
    }

    async fn rotate_log_if_needed(&self) -> Result<()> {
        if !self.log_file_path.exists() {
            return Ok(());
        }

        let metadata = fs::metadata(&self.log_file_path).await?;
        if metadata.len() >= self.max_size_bytes {
            let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
            let file_stem = self
                .log_file_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy();
            let backup_file_name = match self.log_file_path.extension() {
                Some(ext) => format!("{}_{}.{}", file_stem, timestamp, ext.to_string_lossy()),
                None => format!("{}_{}", file_stem, timestamp),
            };
            let backup_path = self.log_file_path.with_file_name(backup_file_name);
            fs::rename(&self.log_file_path, backup_path).await?;
        }
        Ok(())
    }

    pub async fn log_request(&self, method: &str, params: &Value) {
        if let Err(e) = self.try_log_request(method, params).await {
            error!(method = %method, error = %e, "Failed to write audit log");
        }
    }

    async fn try_log_request(&self, method: &str, params: &Value) -> Result<()> {
        self.rotate_log_if_needed().await?;

        let log_entry = format_entry(&Utc::now().to_rfc3339(), method, params)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(log_entry.as_bytes()).await?;
        Ok(())
    }
}

fn format_entry(timestamp: &str, method: &str, params: &Value) -> Result<String> {
    let sanitized = sanitize(params);
    Ok(format!("{} | {} | {}\n", timestamp, method, serde_json::to_string(&sanitized)?))
}

fn sanitize(params: &Value) -> Value {
    let mut sanitized = params.clone();
    if let Some(obj) = sanitized.as_object_mut() {
        for field in TRUNCATED_FIELDS {
            if let Some(Value::String(text)) = obj.get_mut(field) {
                if text.len() > MAX_LOGGED_FIELD_LEN {
                    *text = format!("<{} truncated for log, {} bytes>", field, text.len());
                }
            }
        }
    }
    sanitized
}
