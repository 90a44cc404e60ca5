//! In-memory multiplexer for unit tests.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::collector::{ControlKey, Multiplexer, MuxFuture, PaneTarget};
use crate::error::MuxError;

/// Something the code under test sent to the pane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sent {
    Keys { text: String, enter: bool },
    Control(ControlKey),
}

#[derive(Debug, Default)]
struct State {
    sessions: HashSet<String>,
    screen: String,
    /// Screen shown after the next `send_keys`
    after_send: Option<String>,
    /// Per-call `current_command` results; `command` once drained
    commands: VecDeque<String>,
    command: String,
    sent: Vec<Sent>,
    capture_failures: u32,
    fail_sends: bool,
    captures: u32,
    exists_delay: Duration,
}

/// Scripted [`Multiplexer`]: a single screen per mux, shared by all panes.
#[derive(Debug, Default)]
pub struct ScriptedMux {
    state: Mutex<State>,
}

impl ScriptedMux {
    pub fn new(session: &str) -> Arc<Self> {
        let mux = Self::default();
        {
            let mut state = mux.state.lock().unwrap();
            state.sessions.insert(session.to_string());
            state.command = "claude".to_string();
        }
        Arc::new(mux)
    }

    pub fn set_screen(&self, text: &str) {
        self.state.lock().unwrap().screen = text.to_string();
    }

    pub fn set_after_send(&self, text: Option<&str>) {
        self.state.lock().unwrap().after_send = text.map(str::to_string);
    }

    pub fn set_command(&self, command: &str) {
        self.state.lock().unwrap().command = command.to_string();
    }

    pub fn push_commands(&self, commands: &[&str]) {
        self.state
            .lock()
            .unwrap()
            .commands
            .extend(commands.iter().map(|c| (*c).to_string()));
    }

    pub fn fail_captures(&self, n: u32) {
        self.state.lock().unwrap().capture_failures = n;
    }

    /// Make `session_exists` take `delay` before answering.
    pub fn set_exists_delay(&self, delay: Duration) {
        self.state.lock().unwrap().exists_delay = delay;
    }

    pub fn fail_sends(&self, fail: bool) {
        self.state.lock().unwrap().fail_sends = fail;
    }

    pub fn sent(&self) -> Vec<Sent> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Text of every `send_keys` call, in order.
    pub fn keys_sent(&self) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter_map(|s| match s {
                Sent::Keys { text, .. } => Some(text),
                Sent::Control(_) => None,
            })
            .collect()
    }

    pub fn captures(&self) -> u32 {
        self.state.lock().unwrap().captures
    }
}

impl Multiplexer for ScriptedMux {
    fn session_exists(&self, session: &str) -> MuxFuture<'_, bool> {
        let (exists, delay) = {
            let state = self.state.lock().unwrap();
            (state.sessions.contains(session), state.exists_delay)
        };
        Box::pin(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Ok(exists)
        })
    }

    fn capture(&self, target: &PaneTarget, _lines: usize) -> MuxFuture<'_, String> {
        let result = {
            let mut state = self.state.lock().unwrap();
            state.captures += 1;
            if state.capture_failures > 0 {
                state.capture_failures -= 1;
                Err(MuxError::CaptureFailed {
                    target: target.to_string(),
                    reason: "scripted failure".into(),
                })
            } else {
                Ok(state.screen.clone())
            }
        };
        Box::pin(async move { result })
    }

    fn send_keys(&self, target: &PaneTarget, text: &str, enter: bool) -> MuxFuture<'_, ()> {
        let result = {
            let mut state = self.state.lock().unwrap();
            if state.fail_sends {
                Err(MuxError::SendFailed {
                    target: target.to_string(),
                    reason: "scripted failure".into(),
                })
            } else {
                state.sent.push(Sent::Keys {
                    text: text.to_string(),
                    enter,
                });
                if let Some(next) = state.after_send.take() {
                    state.screen = next;
                }
                Ok(())
            }
        };
        Box::pin(async move { result })
    }

    fn send_control(&self, _target: &PaneTarget, key: ControlKey) -> MuxFuture<'_, ()> {
        self.state.lock().unwrap().sent.push(Sent::Control(key));
        Box::pin(async { Ok(()) })
    }

    fn current_command(&self, _target: &PaneTarget) -> MuxFuture<'_, String> {
        let command = {
            let mut state = self.state.lock().unwrap();
            let next = state.commands.pop_front();
            next.unwrap_or_else(|| state.command.clone())
        };
        Box::pin(async move { Ok(command) })
    }
}
