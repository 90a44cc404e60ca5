//! Pane content capture.
//!
//! The [`Multiplexer`] trait is the seam to the terminal multiplexer: capture,
//! keystroke injection and the handful of process queries the monitor needs.
//! [`TmuxMultiplexer`] is the production implementation, shelling out to the
//! `tmux` CLI. [`ContentCollector`] wraps a multiplexer handle with a bounded
//! capture timeout and turns raw text into immutable [`PaneSnapshot`]s.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::error::MuxError;

/// Boxed future returned by [`Multiplexer`] operations.
pub type MuxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, MuxError>> + Send + 'a>>;

/// Shared handle to a multiplexer implementation.
pub type MultiplexerHandle = Arc<dyn Multiplexer>;

static ANSI_ESCAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1B(?:[@-Z\\-_]|\[[0-?]*[ -/]*[@-~])").expect("ANSI regex must compile")
});

/// Remove ANSI escape sequences from terminal text.
#[must_use]
pub fn strip_ansi(text: &str) -> std::borrow::Cow<'_, str> {
    ANSI_ESCAPE.replace_all(text, "")
}

// =============================================================================
// Targets
// =============================================================================

/// A pane inside a multiplexer session.
///
/// `pane` is the tmux target suffix after the colon, e.g. `0` (window 0) or
/// `0.1` (window 0, pane 1).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PaneTarget {
    pub session: String,
    pub pane: String,
}

impl PaneTarget {
    #[must_use]
    pub fn new(session: impl Into<String>, pane: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            pane: pane.into(),
        }
    }
}

impl fmt::Display for PaneTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.session, self.pane)
    }
}

/// Control keys used when terminating a stale assistant process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKey {
    CtrlC,
    CtrlD,
}

impl ControlKey {
    /// tmux key name.
    #[must_use]
    pub const fn as_tmux(self) -> &'static str {
        match self {
            Self::CtrlC => "C-c",
            Self::CtrlD => "C-d",
        }
    }
}

// =============================================================================
// Multiplexer trait
// =============================================================================

/// Operations the monitor needs from a terminal multiplexer.
pub trait Multiplexer: Send + Sync {
    /// Returns true if the session exists.
    fn session_exists(&self, session: &str) -> MuxFuture<'_, bool>;

    /// Capture the last `lines` lines of a pane as plain text.
    fn capture(&self, target: &PaneTarget, lines: usize) -> MuxFuture<'_, String>;

    /// Type `text` literally into the pane, optionally followed by Enter.
    fn send_keys(&self, target: &PaneTarget, text: &str, enter: bool) -> MuxFuture<'_, ()>;

    /// Send a single control key.
    fn send_control(&self, target: &PaneTarget, key: ControlKey) -> MuxFuture<'_, ()>;

    /// Name of the foreground command running in the pane.
    fn current_command(&self, target: &PaneTarget) -> MuxFuture<'_, String>;
}

/// `tmux` CLI implementation of [`Multiplexer`].
#[derive(Debug, Clone)]
pub struct TmuxMultiplexer {
    binary: String,
}

impl Default for TmuxMultiplexer {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxMultiplexer {
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, MuxError> {
        trace!(binary = %self.binary, ?args, "tmux invocation");
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    MuxError::CliNotFound
                } else {
                    MuxError::CaptureFailed {
                        target: args.join(" "),
                        reason: e.to_string(),
                    }
                }
            })
    }
}

fn stderr_reason(output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exit status {}", output.status)
    } else {
        stderr
    }
}

impl Multiplexer for TmuxMultiplexer {
    fn session_exists(&self, session: &str) -> MuxFuture<'_, bool> {
        let session = session.to_string();
        Box::pin(async move {
            let output = self.run(&["has-session", "-t", &session]).await?;
            Ok(output.status.success())
        })
    }

    fn capture(&self, target: &PaneTarget, lines: usize) -> MuxFuture<'_, String> {
        let target = target.to_string();
        Box::pin(async move {
            let start = format!("-{lines}");
            let output = self
                .run(&["capture-pane", "-p", "-J", "-t", &target, "-S", &start])
                .await?;
            if !output.status.success() {
                return Err(MuxError::CaptureFailed {
                    reason: stderr_reason(&output),
                    target,
                });
            }
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        })
    }

    fn send_keys(&self, target: &PaneTarget, text: &str, enter: bool) -> MuxFuture<'_, ()> {
        let target = target.to_string();
        let text = text.to_string();
        Box::pin(async move {
            let output = self
                .run(&["send-keys", "-t", &target, "-l", &text])
                .await?;
            if !output.status.success() {
                return Err(MuxError::SendFailed {
                    reason: stderr_reason(&output),
                    target,
                });
            }
            if enter {
                let output = self.run(&["send-keys", "-t", &target, "Enter"]).await?;
                if !output.status.success() {
                    return Err(MuxError::SendFailed {
                        reason: stderr_reason(&output),
                        target,
                    });
                }
            }
            Ok(())
        })
    }

    fn send_control(&self, target: &PaneTarget, key: ControlKey) -> MuxFuture<'_, ()> {
        let target = target.to_string();
        Box::pin(async move {
            let output = self
                .run(&["send-keys", "-t", &target, key.as_tmux()])
                .await?;
            if !output.status.success() {
                return Err(MuxError::SendFailed {
                    reason: stderr_reason(&output),
                    target,
                });
            }
            Ok(())
        })
    }

    fn current_command(&self, target: &PaneTarget) -> MuxFuture<'_, String> {
        let target = target.to_string();
        Box::pin(async move {
            let output = self
                .run(&[
                    "display-message",
                    "-p",
                    "-t",
                    &target,
                    "#{pane_current_command}",
                ])
                .await?;
            if !output.status.success() {
                return Err(MuxError::CaptureFailed {
                    reason: stderr_reason(&output),
                    target,
                });
            }
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        })
    }
}

// =============================================================================
// Snapshots
// =============================================================================

/// Immutable capture of a pane's visible text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaneSnapshot {
    pub target: PaneTarget,
    /// Cleaned lines, oldest first (ANSI stripped, trailing whitespace removed).
    pub lines: Vec<String>,
    pub captured_at: DateTime<Utc>,
    /// Hash of `lines`, used to skip reprocessing an unchanged screen.
    pub fingerprint: u64,
}

impl PaneSnapshot {
    /// Build a snapshot from raw captured text, keeping at most `max_lines`
    /// trailing lines.
    #[must_use]
    pub fn from_text(target: PaneTarget, raw: &str, max_lines: usize) -> Self {
        let cleaned = strip_ansi(raw);
        let mut lines: Vec<String> = cleaned
            .lines()
            .map(|line| line.trim_end().to_string())
            .collect();
        while lines.last().is_some_and(|l| l.is_empty()) {
            lines.pop();
        }
        if lines.len() > max_lines {
            lines.drain(..lines.len() - max_lines);
        }
        let fingerprint = fingerprint_lines(&lines);
        Self {
            target,
            lines,
            captured_at: Utc::now(),
            fingerprint,
        }
    }

    /// Lines joined with newlines.
    #[must_use]
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Count of non-whitespace characters.
    #[must_use]
    pub fn content_chars(&self) -> usize {
        self.lines
            .iter()
            .flat_map(|l| l.chars())
            .filter(|c| !c.is_whitespace())
            .count()
    }
}

/// First eight bytes of the SHA-256 digest over the lines.
#[must_use]
pub fn fingerprint_lines(lines: &[String]) -> u64 {
    let mut hasher = Sha256::new();
    for line in lines {
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

// =============================================================================
// Collector
// =============================================================================

/// Captures pane snapshots with a bounded timeout.
#[derive(Clone)]
pub struct ContentCollector {
    mux: MultiplexerHandle,
    max_lines: usize,
    capture_timeout: Duration,
}

impl fmt::Debug for ContentCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentCollector")
            .field("max_lines", &self.max_lines)
            .field("capture_timeout", &self.capture_timeout)
            .finish()
    }
}

impl ContentCollector {
    #[must_use]
    pub fn new(mux: MultiplexerHandle, max_lines: usize, capture_timeout: Duration) -> Self {
        Self {
            mux,
            max_lines: max_lines.max(1),
            capture_timeout,
        }
    }

    /// Capture a snapshot of `target`.
    ///
    /// Timeouts surface as [`MuxError::Timeout`]; both that and capture
    /// failures are transient and should be retried on the next tick.
    pub async fn capture(&self, target: &PaneTarget) -> Result<PaneSnapshot, MuxError> {
        let raw = timeout(
            self.capture_timeout,
            self.mux.capture(target, self.max_lines),
        )
        .await
        .map_err(|_| MuxError::Timeout {
            operation: "capture",
            timeout_ms: self.capture_timeout.as_millis() as u64,
        })??;

        let snapshot = PaneSnapshot::from_text(target.clone(), &raw, self.max_lines);
        debug!(
            target = %target,
            lines = snapshot.lines.len(),
            fingerprint = %hex::encode(snapshot.fingerprint.to_be_bytes()),
            "Captured pane"
        );
        Ok(snapshot)
    }

    /// Returns true when `current` differs from `previous` (or there is no
    /// previous snapshot).
    #[must_use]
    pub fn changed(previous: Option<&PaneSnapshot>, current: &PaneSnapshot) -> bool {
        previous.is_none_or(|prev| prev.fingerprint != current.fingerprint)
    }
}
