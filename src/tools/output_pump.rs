//! Reading child stdout/stderr in arbitrary-sized chunks and handing them
//! on as text, in the order they were read.

use std::io::ErrorKind;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const READ_BUF_SIZE: usize = 8 * 1024;

/// How long to keep draining pipes after the child itself has exited.
/// Grandchildren that inherited the pipe can keep it open indefinitely.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(1_000);

/// Incremental UTF-8 decoding that holds back a multi-byte sequence cut
/// at a read boundary until the rest arrives.
#[derive(Debug, Default)]
pub struct Utf8ChunkDecoder {
    pending: Vec<u8>,
}

impl Utf8ChunkDecoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    out.push_str(text);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&rest[..valid]));
                    match e.error_len() {
                        // Invalid sequence: replace it and keep going.
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &rest[valid + len..];
                        }
                        // Cut off at the end: wait for the next read.
                        None => {
                            rest = &rest[valid..];
                            break;
                        }
                    }
                }
            }
        }
        let consumed = self.pending.len() - rest.len();
        self.pending.drain(..consumed);
        out
    }

    /// Whatever is still held back, replaced lossily.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(out)
    }
}

/// Reads `reader` to EOF, calling `on_chunk` for every non-empty decoded chunk.
pub async fn pump<R, F>(mut reader: R, mut on_chunk: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(String),
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut decoder = Utf8ChunkDecoder::default();
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!(bytes = n, "Read output chunk");
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    on_chunk(text);
                }
            }
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "Output stream closed with error");
                break;
            }
        }
    }
    if let Some(rest) = decoder.finish() {
        on_chunk(rest);
    }
}

/// Waits for reader tasks after the child exited, aborting any that outlive [`DRAIN_TIMEOUT`].
pub async fn drain(tasks: Vec<JoinHandle<()>>) {
    for mut task in tasks {
        if timeout(DRAIN_TIMEOUT, &mut task).await.is_err() {
            warn!("Output pipe still held open after exit, abandoning reader");
            task.abort();
        }
    }
}
