//! Process session engine: owns every spawned script run and terminal
//! session, streams their output as events and tears them all down on exit.

pub mod config;
pub mod error;
pub mod events;
pub mod ipc;
pub mod tools;
pub mod utils;

use crate::config::Config;
use crate::events::{EngineEvent, EventBus};
use crate::ipc::handler::Engine;
use crate::ipc::protocol::OutboundMessage;
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{error, info, Level};
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

/// How long trailing events may take to reach stdout once everything is stopped.
const FLUSH_TIMEOUT: Duration = Duration::from_millis(500);

pub fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("procdeck={}", level)));

    // stdout carries the protocol, so logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| anyhow!("Failed to set tracing subscriber: {}", e))
}

/// Serves requests from stdin until EOF or Ctrl+C, then shuts the engine down.
pub async fn run(config: Config) -> Result<()> {
    let config = Arc::new(config);
    let (events, mut event_rx) = EventBus::channel();
    let (out_tx, out_rx) = mpsc::unbounded_channel::<OutboundMessage>();
    let engine = Engine::new(config, events);

    let writer = tokio::spawn(write_outbound(out_rx));
    let event_tx = out_tx.clone();
    let mut forwarder = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if event_tx.send(OutboundMessage::Event(event)).is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    info!("Listening for requests on stdin");
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    // Handled in order: keystrokes for one session must not be reordered.
                    let response = engine.handle_line(&line).await;
                    if out_tx.send(response).is_err() {
                        error!("Output writer stopped, exiting");
                        break;
                    }
                }
                Ok(None) => {
                    info!("stdin closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read request");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("Interrupt received");
                break;
            }
        }
    }

    engine.shutdown().await;
    drop(engine);
    // Exit monitors still hold the bus for a moment; let their last events out.
    if timeout(FLUSH_TIMEOUT, &mut forwarder).await.is_err() {
        forwarder.abort();
    }
    drop(out_tx);
    if timeout(FLUSH_TIMEOUT, writer).await.is_err() {
        error!("Timed out flushing output");
    }
    info!("Shutdown complete");
    Ok(())
}

async fn write_outbound(mut rx: mpsc::UnboundedReceiver<OutboundMessage>) {
    let mut stdout = tokio::io::stdout();
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_string(&message) {
            Ok(line) => line,
            Err(e) => {
                error!(error = %e, "Failed to serialise outbound message");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = stdout.write_all(line.as_bytes()).await {
            error!(error = %e, "Failed to write to stdout");
            break;
        }
        if let Err(e) = stdout.flush().await {
            error!(error = %e, "Failed to flush stdout");
            break;
        }
    }
}

/// Convenience for embedding: an engine plus the receiving end of its event channel.
pub fn engine(config: Config) -> (Engine, mpsc::UnboundedReceiver<EngineEvent>) {
    let (events, rx) = EventBus::channel();
    (Engine::new(Arc::new(config), events), rx)
}
