//! Keystroke interpretation for terminal sessions.
//!
//! There is no pseudo-terminal doing line discipline for us, so raw input
//! from the UI is run through a small state machine here:
//!
//! ```text
//!            printable            CR
//!   Idle ─────────────► Accumulating ─────► (Submit line) ─► Idle
//!    ▲  ◄────────────────────┘ erase last char / ETX
//!    └── ETX, CR on empty line
//! ```
//!
//! Chunks are processed one character at a time, so a multi-character paste
//! behaves exactly like the same keys typed in sequence: printable runs are
//! echoed, an embedded CR submits, an embedded ETX interrupts.

pub const ETX: char = '\u{3}';
pub const BACKSPACE: char = '\u{8}';
pub const CR: char = '\r';
pub const DEL: char = '\u{7f}';

/// Sequence that visually erases one cell to the left of the cursor.
pub const ERASE_ECHO: &str = "\u{8} \u{8}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputClass {
    Interrupt,
    Submit,
    Erase,
    Printable(char),
    Ignored,
}

pub fn classify(c: char) -> InputClass {
    match c {
        ETX => InputClass::Interrupt,
        CR => InputClass::Submit,
        BACKSPACE | DEL => InputClass::Erase,
        ' '..='~' => InputClass::Printable(c),
        _ => InputClass::Ignored,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputState {
    Idle,
    Accumulating,
}

/// Where keystrokes go: into the line buffer, or straight to a running command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    Line,
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    /// Text to show in the terminal.
    Echo(String),
    /// Text to write to the foreground command's stdin.
    Forward(String),
    /// A complete line ready for the command executor.
    Submit(String),
    Interrupt,
}

#[derive(Debug, Default)]
pub struct InputInterpreter {
    buffer: String,
}

impl InputInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> InputState {
        if self.buffer.is_empty() {
            InputState::Idle
        } else {
            InputState::Accumulating
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Advances the machine by one character.
    pub fn step(&mut self, c: char, mode: InputMode) -> Vec<InputAction> {
        match (classify(c), mode) {
            (InputClass::Interrupt, _) => {
                self.buffer.clear();
                vec![InputAction::Interrupt]
            }
            (InputClass::Submit, InputMode::Line) => {
                let line = std::mem::take(&mut self.buffer);
                vec![InputAction::Echo("\r\n".to_string()), InputAction::Submit(line)]
            }
            (InputClass::Submit, InputMode::Passthrough) => vec![
                InputAction::Echo("\r\n".to_string()),
                InputAction::Forward("\n".to_string()),
            ],
            (InputClass::Erase, InputMode::Line) => match self.buffer.pop() {
                Some(_) => vec![InputAction::Echo(ERASE_ECHO.to_string())],
                None => Vec::new(),
            },
            (InputClass::Printable(ch), InputMode::Line) => {
                self.buffer.push(ch);
                vec![InputAction::Echo(ch.to_string())]
            }
            (InputClass::Printable(ch), InputMode::Passthrough) => vec![
                InputAction::Echo(ch.to_string()),
                InputAction::Forward(ch.to_string()),
            ],
            (InputClass::Erase, InputMode::Passthrough) | (InputClass::Ignored, _) => Vec::new(),
        }
    }

    /// Runs a whole chunk in one mode, merging adjacent echo/forward runs.
    pub fn feed(&mut self, chunk: &str, mode: InputMode) -> Vec<InputAction> {
        let mut actions = Vec::new();
        for c in chunk.chars() {
            for action in self.step(c, mode) {
                push_coalesced(&mut actions, action);
            }
        }
        actions
    }
}

/// Appends `action`, merging it into the previous one when both are the same text kind.
pub fn push_coalesced(actions: &mut Vec<InputAction>, action: InputAction) {
    match (actions.last_mut(), action) {
        (Some(InputAction::Echo(prev)), InputAction::Echo(next)) => prev.push_str(&next),
        (Some(InputAction::Forward(prev)), InputAction::Forward(next)) => prev.push_str(&next),
        (_, action) => actions.push(action),
    }
}
