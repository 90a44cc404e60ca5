//! Assistant process detection and safe restart.
//!
//! A pane counts as "running the assistant" when its foreground command
//! contains one of the configured process names. When the assistant has
//! exited, [`ProcessController::safe_restart`] clears whatever is left in the
//! pane before relaunching, so two instances never share one pane:
//!
//! ```text
//! C-c, C-c, C-d, clear ─► poll (C-c between polls) ─► clear ─► <command> [--model M]
//!                              │
//!                              └─ still running after N polls ─► RestartFailed (no launch)
//! ```

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::collector::{ControlKey, MultiplexerHandle, PaneTarget};
use crate::config::MonitorConfig;
use crate::error::{MonitorError, MuxError};

/// Outcome of a successful safe restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartReport {
    pub target: PaneTarget,
    /// Polls needed before the pane was free
    pub polls: u32,
    pub launched: String,
    pub duration_ms: u64,
}

/// Detects and restarts the assistant process in a pane.
#[derive(Clone)]
pub struct ProcessController {
    mux: MultiplexerHandle,
    process_names: Vec<String>,
    command: String,
    model: Option<String>,
    poll_attempts: u32,
    step_delay: Duration,
    send_timeout: Duration,
}

impl std::fmt::Debug for ProcessController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessController")
            .field("process_names", &self.process_names)
            .field("command", &self.command)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl ProcessController {
    #[must_use]
    pub fn new(mux: MultiplexerHandle, config: &MonitorConfig) -> Self {
        Self {
            mux,
            process_names: config
                .process_names
                .iter()
                .map(|n| n.to_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
            command: config.assistant_command.clone(),
            model: config.model.clone(),
            poll_attempts: config.restart_poll_attempts.max(1),
            step_delay: config.restart_step_delay(),
            send_timeout: config.send_timeout(),
        }
    }

    /// Full launch command line.
    #[must_use]
    pub fn launch_command(&self) -> String {
        match &self.model {
            Some(model) => format!("{} --model {model}", self.command),
            None => self.command.clone(),
        }
    }

    /// Returns true if the pane's foreground command looks like the assistant.
    pub async fn is_running(&self, target: &PaneTarget) -> Result<bool, MuxError> {
        let command = self.mux.current_command(target).await?.to_lowercase();
        let running = self
            .process_names
            .iter()
            .any(|name| command.contains(name.as_str()));
        debug!(target = %target, command = %command, running, "Process check");
        Ok(running)
    }

    async fn control(&self, target: &PaneTarget, key: ControlKey) -> Result<(), MuxError> {
        timeout(self.send_timeout, self.mux.send_control(target, key))
            .await
            .map_err(|_| self.send_timed_out())?
    }

    async fn line(&self, target: &PaneTarget, text: &str) -> Result<(), MuxError> {
        timeout(self.send_timeout, self.mux.send_keys(target, text, true))
            .await
            .map_err(|_| self.send_timed_out())?
    }

    fn send_timed_out(&self) -> MuxError {
        MuxError::Timeout {
            operation: "send",
            timeout_ms: self.send_timeout.as_millis() as u64,
        }
    }

    /// Interrupt and exit whatever runs in the pane, then wait for it to go.
    ///
    /// Returns the number of polls used.
    pub async fn terminate(&self, target: &PaneTarget) -> crate::Result<u32> {
        for key in [ControlKey::CtrlC, ControlKey::CtrlC, ControlKey::CtrlD] {
            self.control(target, key).await?;
            sleep(self.step_delay).await;
        }
        self.line(target, "clear").await?;
        sleep(self.step_delay).await;

        let mut polls = 0;
        let mut stopped = false;
        while polls < self.poll_attempts {
            polls += 1;
            if !self.is_running(target).await? {
                stopped = true;
                break;
            }
            self.control(target, ControlKey::CtrlC).await?;
            sleep(self.step_delay).await;
        }

        if !stopped {
            warn!(target = %target, polls, "Assistant still running after termination");
            return Err(MonitorError::RestartFailed {
                session: target.session.clone(),
                reason: format!("process still running after {polls} polls"),
            }
            .into());
        }

        self.line(target, "clear").await?;
        Ok(polls)
    }

    /// Start the assistant in the pane.
    pub async fn launch(&self, target: &PaneTarget) -> Result<String, MuxError> {
        let command = self.launch_command();
        self.line(target, &command).await?;
        info!(target = %target, command = %command, "Assistant launched");
        Ok(command)
    }

    /// Terminate residual state, then relaunch. Never launches if the old
    /// process could not be stopped.
    pub async fn safe_restart(&self, target: &PaneTarget) -> crate::Result<RestartReport> {
        let started = Instant::now();
        info!(target = %target, "Safe restart starting");
        let polls = self.terminate(target).await?;
        sleep(self.step_delay).await;
        let launched = self.launch(target).await?;
        Ok(RestartReport {
            target: target.clone(),
            polls,
            launched,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
