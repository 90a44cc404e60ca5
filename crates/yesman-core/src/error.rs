//! Error types for yesman-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for yesman-core
#[derive(Error, Debug)]
pub enum Error {
    /// Terminal multiplexer errors (capture, send, process queries)
    #[error("Multiplexer error: {0}")]
    Mux(#[from] MuxError),

    /// Session lifecycle errors
    #[error("Monitor error: {0}")]
    Monitor(#[from] MonitorError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Mux(err) => Some(err.remediation()),
            Self::Monitor(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the config directory exists and is readable."),
            ),
            Self::Json(_) => None,
        }
    }
}

/// Terminal multiplexer errors.
///
/// `Capture*` and `Send*` variants are transient: the monitor loop retries on
/// the next tick and only escalates after repeated consecutive failures.
#[derive(Error, Debug)]
pub enum MuxError {
    /// tmux binary not found in PATH
    #[error("tmux not found in PATH")]
    CliNotFound,

    /// Session does not exist
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Pane capture failed (pane gone, server unreachable)
    #[error("Capture failed for {target}: {reason}")]
    CaptureFailed { target: String, reason: String },

    /// Keystroke injection failed
    #[error("Send failed for {target}: {reason}")]
    SendFailed { target: String, reason: String },

    /// Operation exceeded its deadline
    #[error("{operation} timed out after {timeout_ms} ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },
}

impl MuxError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::CliNotFound => Remediation::new("Install tmux and make sure it is on PATH.")
                .command("Verify install", "tmux -V"),
            Self::SessionNotFound(session) => {
                Remediation::new(format!("Create the tmux session '{session}' first."))
                    .command("List sessions", "tmux ls")
                    .command("Create session", format!("tmux new -d -s {session}"))
            }
            Self::CaptureFailed { target, .. } => {
                Remediation::new(format!("Verify that pane {target} still exists."))
                    .command("List panes", "tmux list-panes -a")
            }
            Self::SendFailed { target, .. } => {
                Remediation::new(format!("Verify that pane {target} accepts input."))
                    .command("List panes", "tmux list-panes -a")
                    .alternative("Check whether the pane is in copy mode.")
            }
            Self::Timeout { .. } => Remediation::new(
                "The tmux server is slow to respond. Retry when the system is idle.",
            )
            .alternative("Raise monitor.capture_timeout_ms or monitor.send_timeout_ms."),
        }
    }

    /// Returns true if the error is expected to clear on its own and should
    /// be retried on the next tick.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::CaptureFailed { .. } | Self::SendFailed { .. } | Self::Timeout { .. }
        )
    }

    /// Returns true if the error came from keystroke injection.
    #[must_use]
    pub fn is_send_failure(&self) -> bool {
        matches!(
            self,
            Self::SendFailed { .. }
                | Self::Timeout {
                    operation: "send",
                    ..
                }
        )
    }
}

/// Session lifecycle errors
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Session '{0}' is already being monitored")]
    AlreadyRunning(String),

    #[error("Session '{0}' is not monitored")]
    NotMonitored(String),

    #[error("Safe restart of session '{session}' failed: {reason}")]
    RestartFailed { session: String, reason: String },

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}

impl MonitorError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::AlreadyRunning(session) => Remediation::new(format!(
                "Stop the existing monitor for '{session}' before starting a new one."
            )),
            Self::NotMonitored(session) => {
                Remediation::new(format!("Start monitoring '{session}' first."))
                    .command("Start", format!("yesman monitor {session}"))
            }
            Self::RestartFailed { session, .. } => Remediation::new(format!(
                "Inspect the pane in '{session}' and relaunch the assistant manually."
            ))
            .command("Attach", format!("tmux attach -t {session}")),
            Self::ShuttingDown => Remediation::new("Wait for shutdown to finish and retry."),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\""))
            .alternative("Pass --config with the correct path."),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .alternative("Delete the file to fall back to built-in defaults."),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .alternative("Review yesman.toml against the documented defaults.")
            }
        }
    }
}
