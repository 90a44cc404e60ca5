//! Shared test infrastructure for yesman-core integration tests.
//!
//! Import from integration test files with:
//! ```ignore
//! mod common;
//! use common::PaneFarm;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use yesman_core::collector::{ControlKey, Multiplexer, MuxFuture, PaneTarget};
use yesman_core::error::MuxError;

#[derive(Debug, Default)]
struct Pane {
    screen: String,
    /// Screens shown after successive `send_keys` calls
    replies: Vec<String>,
    command: String,
    keys: Vec<String>,
    controls: Vec<ControlKey>,
}

/// In-memory multiplexer with one independent pane per session.
#[derive(Debug, Default)]
pub struct PaneFarm {
    panes: Mutex<HashMap<String, Pane>>,
}

impl PaneFarm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a session running the assistant with `screen` visible.
    pub fn add_session(&self, session: &str, screen: &str) {
        self.panes.lock().unwrap().insert(
            session.to_string(),
            Pane {
                screen: screen.to_string(),
                command: "claude".to_string(),
                ..Pane::default()
            },
        );
    }

    /// Queue the screen shown after the next answer.
    pub fn reply_with(&self, session: &str, screen: &str) {
        if let Some(pane) = self.panes.lock().unwrap().get_mut(session) {
            pane.replies.push(screen.to_string());
        }
    }

    pub fn set_screen(&self, session: &str, screen: &str) {
        if let Some(pane) = self.panes.lock().unwrap().get_mut(session) {
            pane.screen = screen.to_string();
        }
    }

    pub fn set_command(&self, session: &str, command: &str) {
        if let Some(pane) = self.panes.lock().unwrap().get_mut(session) {
            pane.command = command.to_string();
        }
    }

    pub fn keys(&self, session: &str) -> Vec<String> {
        self.panes
            .lock()
            .unwrap()
            .get(session)
            .map(|p| p.keys.clone())
            .unwrap_or_default()
    }

    pub fn controls(&self, session: &str) -> Vec<ControlKey> {
        self.panes
            .lock()
            .unwrap()
            .get(session)
            .map(|p| p.controls.clone())
            .unwrap_or_default()
    }

    fn with_pane<T>(
        &self,
        target: &PaneTarget,
        f: impl FnOnce(&mut Pane) -> T,
    ) -> Result<T, MuxError> {
        let mut panes = self.panes.lock().unwrap();
        panes
            .get_mut(&target.session)
            .map(f)
            .ok_or_else(|| MuxError::SessionNotFound(target.session.clone()))
    }
}

impl Multiplexer for PaneFarm {
    fn session_exists(&self, session: &str) -> MuxFuture<'_, bool> {
        let exists = self.panes.lock().unwrap().contains_key(session);
        Box::pin(async move { Ok(exists) })
    }

    fn capture(&self, target: &PaneTarget, _lines: usize) -> MuxFuture<'_, String> {
        let result = self.with_pane(target, |p| p.screen.clone());
        Box::pin(async move { result })
    }

    fn send_keys(&self, target: &PaneTarget, text: &str, _enter: bool) -> MuxFuture<'_, ()> {
        let result = self.with_pane(target, |p| {
            p.keys.push(text.to_string());
            if !p.replies.is_empty() {
                p.screen = p.replies.remove(0);
            }
        });
        Box::pin(async move { result })
    }

    fn send_control(&self, target: &PaneTarget, key: ControlKey) -> MuxFuture<'_, ()> {
        let result = self.with_pane(target, |p| p.controls.push(key));
        Box::pin(async move { result })
    }

    fn current_command(&self, target: &PaneTarget) -> MuxFuture<'_, String> {
        let result = self.with_pane(target, |p| p.command.clone());
        Box::pin(async move { result })
    }
}

/// Poll `cond` on the (possibly paused) tokio clock.
pub async fn wait_until(cond: impl Fn() -> bool) {
    for _ in 0..400 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}
