//! Line-ending fixes for output read from pipes.
//!
//! Children writing to a pipe emit bare `\n`; a terminal widget needs
//! `\r\n` or lines staircase to the right. Normalisation is stateful
//! because a `\r\n` pair can be split across two reads.

#[derive(Debug, Clone)]
pub struct CrlfNormalizer {
    last_was_cr: bool,
    at_line_start: bool,
}

impl CrlfNormalizer {
    pub fn new() -> Self {
        Self {
            last_was_cr: false,
            at_line_start: true,
        }
    }

    /// Rewrites every bare LF in `chunk` to CRLF.
    pub fn normalize(&mut self, chunk: &str) -> String {
        let mut out = String::with_capacity(chunk.len() + chunk.len() / 8);
        for c in chunk.chars() {
            if c == '\n' && !self.last_was_cr {
                out.push('\r');
            }
            out.push(c);
            self.last_was_cr = c == '\r';
        }
        if let Some(last) = out.chars().last() {
            self.at_line_start = last == '\n';
        }
        out
    }

    /// Whether everything written so far ended with a completed line.
    pub fn at_line_start(&self) -> bool {
        self.at_line_start
    }
}

impl Default for CrlfNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Stateless variant for one-off messages.
pub fn to_crlf(text: &str) -> String {
    CrlfNormalizer::new().normalize(text)
}
