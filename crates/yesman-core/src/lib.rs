//! yesman-core: Core library for yesman
//!
//! This crate watches AI coding assistants running in tmux panes, classifies
//! the interactive prompts they show and answers the ones it is confident
//! about, learning from the outcome of every answer.
//!
//! # Architecture
//!
//! ```text
//! tmux ─► ContentCollector ─► PromptDetector ─► AdaptiveResponseEngine ─► send_keys
//!                 ▲                                      ▲
//!                 └──────── MonitorOrchestrator ─────────┘
//!                                   │
//!                                   ▼
//!                               EventBus ─► subscribers
//! ```
//!
//! # Modules
//!
//! - `collector`: Multiplexer trait, tmux client and pane snapshots
//! - `detector`: Tier-ranked prompt classification
//! - `adaptive`: Per-context response learning
//! - `events`: Bounded publish/subscribe bus
//! - `orchestrator`: Per-session monitor loops and lifecycle
//! - `process`: Assistant process detection and safe restart
//! - `telemetry`: Rolling windows, component metrics, resource probes
//! - `config`: TOML configuration
//! - `logging`: `tracing` subscriber setup
//! - `error`: Error types with remediation hints
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod adaptive;
pub mod collector;
pub mod config;
pub mod detector;
pub mod error;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod process;
pub mod telemetry;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
