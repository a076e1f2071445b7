//! Platform capability table.
//!
//! Everything that differs between Windows and POSIX hosts (default shell,
//! how a one-off command line is interpreted, command aliases, which
//! environment variables a terminal may see, how a process tree is killed)
//! lives in one [`PlatformProfile`] value selected once at start-up.

use std::collections::HashMap;
use std::path::PathBuf;
use tokio::process::Command as TokioCommand;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformFamily {
    Windows,
    Posix,
}

/// How the whole tree under a spawned process is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeKill {
    /// Children are spawned as process-group leaders and signalled with `killpg`.
    ProcessGroup,
    /// `taskkill /T` walks the tree, `/F` forces.
    Taskkill,
}

#[derive(Debug)]
pub struct PlatformProfile {
    pub family: PlatformFamily,
    /// Environment variable naming the user's preferred shell, if the platform has one.
    pub shell_env_var: Option<&'static str>,
    /// Tried in order through `which` when no shell is configured.
    pub fallback_shells: &'static [&'static str],
    /// Arguments for the idle session shell when the default shell is used.
    pub shell_args: &'static [&'static str],
    pub interpreter: &'static str,
    pub interpreter_flags: &'static [&'static str],
    pub aliases: &'static [(&'static str, &'static str)],
    /// Variables copied from the parent environment into terminal sessions, besides `PATH`.
    pub env_passthrough: &'static [&'static str],
    pub default_path: &'static str,
    pub tree_kill: TreeKill,
}

pub static WINDOWS: PlatformProfile = PlatformProfile {
    family: PlatformFamily::Windows,
    shell_env_var: None,
    fallback_shells: &["powershell.exe", "cmd.exe"],
    shell_args: &["-NoLogo"],
    interpreter: "cmd",
    interpreter_flags: &["/d", "/s", "/c"],
    aliases: &[
        ("ls", "dir"),
        ("pwd", "cd"),
        ("clear", "cls"),
        ("cat", "type"),
        ("which", "where"),
        ("rm", "del"),
        ("cp", "copy"),
        ("mv", "move"),
    ],
    env_passthrough: &["USERPROFILE", "TEMP", "TMP", "SystemRoot"],
    default_path: r"C:\Windows\System32;C:\Windows",
    tree_kill: TreeKill::Taskkill,
};

pub static POSIX: PlatformProfile = PlatformProfile {
    family: PlatformFamily::Posix,
    shell_env_var: Some("SHELL"),
    fallback_shells: &["bash", "sh"],
    shell_args: &[],
    interpreter: "sh",
    interpreter_flags: &["-c"],
    aliases: &[],
    env_passthrough: &["HOME", "USER", "SHELL"],
    default_path: "/usr/local/bin:/usr/bin:/bin",
    tree_kill: TreeKill::ProcessGroup,
};

pub fn current() -> &'static PlatformProfile {
    if cfg!(windows) {
        &WINDOWS
    } else {
        &POSIX
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedShell {
    pub program: String,
    pub args: Vec<String>,
}

impl PlatformProfile {
    /// Picks the shell binary for a terminal session.
    ///
    /// An explicit override wins and is used without extra arguments. Otherwise
    /// the platform's shell variable, then the first fallback found on `PATH`.
    pub fn resolve_shell(&self, requested: Option<&str>) -> ResolvedShell {
        if let Some(shell) = requested.map(str::trim).filter(|s| !s.is_empty()) {
            return ResolvedShell {
                program: shell.to_string(),
                args: Vec::new(),
            };
        }

        let from_env = self
            .shell_env_var
            .and_then(|var| std::env::var(var).ok())
            .filter(|s| !s.trim().is_empty());

        let program = from_env.unwrap_or_else(|| {
            self.fallback_shells
                .iter()
                .find_map(|candidate| which::which(candidate).ok())
                .map(|p: PathBuf| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.fallback_shells.first().copied().unwrap_or("sh").to_string())
        });
        debug!(shell = %program, "Resolved default shell");

        ResolvedShell {
            program,
            args: self.shell_args.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Builds the minimal environment for a terminal session or command.
    pub fn build_environment(&self, overrides: &HashMap<String, String>) -> HashMap<String, String> {
        self.build_environment_from(|key| std::env::var(key).ok(), overrides)
    }

    pub fn build_environment_from<F>(&self, lookup: F, overrides: &HashMap<String, String>) -> HashMap<String, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut env = HashMap::new();
        env.insert(
            "PATH".to_string(),
            lookup("PATH").unwrap_or_else(|| self.default_path.to_string()),
        );
        for key in self.env_passthrough {
            if let Some(value) = lookup(key) {
                env.insert(key.to_string(), value);
            }
        }
        for (key, value) in overrides {
            env.insert(key.clone(), value.clone());
        }
        env
    }

    /// Rewrites the first token of `line` through the alias table.
    pub fn apply_alias(&self, line: &str) -> String {
        let trimmed = line.trim_start();
        let split_at = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
        let (head, rest) = trimmed.split_at(split_at);
        match self.aliases.iter().find(|(from, _)| *from == head) {
            Some((_, to)) => format!("{}{}", to, rest),
            None => trimmed.to_string(),
        }
    }

    /// A command that runs `line` through the platform's command interpreter.
    pub fn interpreter_command(&self, line: &str) -> TokioCommand {
        let mut cmd = TokioCommand::new(self.interpreter);
        cmd.args(self.interpreter_flags);
        match self.family {
            PlatformFamily::Posix => {
                cmd.arg(line);
            }
            PlatformFamily::Windows => {
                // cmd.exe does its own quote parsing; hand it the line untouched.
                #[cfg(windows)]
                cmd.raw_arg(format!("\"{}\"", line));
                #[cfg(not(windows))]
                cmd.arg(line);
            }
        }
        cmd
    }
}
