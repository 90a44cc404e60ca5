//! Configuration for yesman.
//!
//! Loaded from `~/.config/yesman/yesman.toml` (or an explicit path). Every
//! section is optional and falls back to its defaults.
//!
//! ```toml
//! [logging]
//! level = "debug"
//! format = "json"
//!
//! [monitor]
//! tick_interval_ms = 500
//! model = "sonnet"
//!
//! [thresholds]
//! yes_no = 0.7
//!
//! [event_bus]
//! capacity = 2000
//! overflow_policy = "drop_oldest"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adaptive::EngineConfig;
use crate::detector::{DetectorConfig, PromptCategory};
use crate::error::ConfigError;
use crate::events::EventBusConfig;
use crate::logging::LogConfig;
use crate::telemetry::{BottleneckThresholds, WindowConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// JSON lines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

// =============================================================================
// Monitor
// =============================================================================

/// Per-session monitor loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub tick_interval_ms: u64,
    /// Lines of scrollback captured per tick
    pub capture_lines: usize,
    pub capture_timeout_ms: u64,
    pub send_timeout_ms: u64,
    /// Re-classify an unchanged screen after this long
    pub forced_recheck_ms: u64,
    pub max_consecutive_failures: u32,
    pub metrics_interval_ms: u64,
    /// Pause after a failed tick
    pub error_backoff_ms: u64,
    /// Pause between deciding on a response and sending it
    pub response_delay_ms: u64,
    pub auto_response_enabled: bool,
    pub restart_on_exit: bool,
    /// Command used to relaunch the assistant
    pub assistant_command: String,
    pub model: Option<String>,
    /// Pane commands that count as "assistant running"
    pub process_names: Vec<String>,
    pub restart_poll_attempts: u32,
    pub restart_step_delay_ms: u64,
    pub tmux_binary: String,
    pub windows: WindowConfig,
    pub bottleneck: BottleneckThresholds,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            capture_lines: 50,
            capture_timeout_ms: 2_000,
            send_timeout_ms: 2_000,
            forced_recheck_ms: 10_000,
            max_consecutive_failures: 5,
            metrics_interval_ms: 60_000,
            error_backoff_ms: 5_000,
            response_delay_ms: 1_000,
            auto_response_enabled: true,
            restart_on_exit: true,
            assistant_command: "claude".to_string(),
            model: None,
            process_names: vec!["claude".to_string()],
            restart_poll_attempts: 5,
            restart_step_delay_ms: 500,
            tmux_binary: "tmux".to_string(),
            windows: WindowConfig::default(),
            bottleneck: BottleneckThresholds::default(),
        }
    }
}

impl MonitorConfig {
    #[must_use]
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    #[must_use]
    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    #[must_use]
    pub fn forced_recheck(&self) -> Duration {
        Duration::from_millis(self.forced_recheck_ms)
    }

    #[must_use]
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }

    #[must_use]
    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    #[must_use]
    pub fn response_delay(&self) -> Duration {
        Duration::from_millis(self.response_delay_ms)
    }

    #[must_use]
    pub fn restart_step_delay(&self) -> Duration {
        Duration::from_millis(self.restart_step_delay_ms)
    }
}

// =============================================================================
// Thresholds
// =============================================================================

/// Minimum confidence required before auto-responding, per category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub trust: f64,
    /// Applies to every `Selection(n)`
    pub selection: f64,
    pub yes_no: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            trust: 0.5,
            selection: 0.5,
            yes_no: 0.5,
        }
    }
}

impl Thresholds {
    /// Threshold for an actionable category; `None` for the rest.
    #[must_use]
    pub fn for_category(&self, category: PromptCategory) -> Option<f64> {
        match category {
            PromptCategory::Trust => Some(self.trust),
            PromptCategory::Selection(_) => Some(self.selection),
            PromptCategory::YesNo => Some(self.yes_no),
            PromptCategory::TypingInProgress | PromptCategory::Idle | PromptCategory::Unknown => {
                None
            }
        }
    }

    /// Set a category's threshold, clamped to `[0, 1]`. Returns false for
    /// categories that never auto-respond.
    pub fn set(&mut self, category: PromptCategory, value: f64) -> bool {
        let value = if value.is_nan() { 1.0 } else { value.clamp(0.0, 1.0) };
        match category {
            PromptCategory::Trust => self.trust = value,
            PromptCategory::Selection(_) => self.selection = value,
            PromptCategory::YesNo => self.yes_no = value,
            PromptCategory::TypingInProgress | PromptCategory::Idle | PromptCategory::Unknown => {
                return false;
            }
        }
        true
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("trust", self.trust),
            ("selection", self.selection),
            ("yes_no", self.yes_no),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::ValidationError(format!(
                    "thresholds.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

// =============================================================================
// Root
// =============================================================================

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct YesmanConfig {
    pub logging: LogConfig,
    pub monitor: MonitorConfig,
    pub engine: EngineConfig,
    pub detector: DetectorConfig,
    pub thresholds: Thresholds,
    pub event_bus: EventBusConfig,
}

impl YesmanConfig {
    /// Default config file location (`~/.config/yesman/yesman.toml`).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("yesman").join("yesman.toml"))
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let shown = path.display().to_string();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ConfigError::FileNotFound(shown));
            }
            Err(e) => return Err(ConfigError::ReadFailed(shown, e.to_string())),
        };
        let config = Self::from_toml(&text)?;
        tracing::debug!(path = %shown, "Loaded config");
        Ok(config)
    }

    /// Load `path` if given, else the default path if it exists, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse and validate TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_bus.capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_bus.capacity must be greater than 0".into(),
            ));
        }
        if self.event_bus.workers == 0 {
            return Err(ConfigError::ValidationError(
                "event_bus.workers must be greater than 0".into(),
            ));
        }
        if self.monitor.tick_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.tick_interval_ms must be greater than 0".into(),
            ));
        }
        if self.monitor.capture_lines == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.capture_lines must be greater than 0".into(),
            ));
        }
        if self.monitor.max_consecutive_failures == 0 {
            return Err(ConfigError::ValidationError(
                "monitor.max_consecutive_failures must be greater than 0".into(),
            ));
        }
        self.thresholds.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::OverflowPolicy;
    use std::io::Write;

    #[test]
    fn log_format_parse_and_display() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = YesmanConfig::from_toml("").unwrap();
        assert_eq!(config.monitor.tick_interval_ms, 1_000);
        assert_eq!(config.event_bus.capacity, 10_000);
        assert_eq!(config.event_bus.overflow_policy, OverflowPolicy::RejectNew);
        assert_eq!(config.thresholds, Thresholds::default());
        assert_eq!(config.detector.min_content_chars, 10);
    }

    #[test]
    fn partial_sections_override_fields() {
        let config = YesmanConfig::from_toml(
            r#"
            [logging]
            format = "json"

            [monitor]
            tick_interval_ms = 250
            model = "opus"

            [thresholds]
            yes_no = 0.8

            [event_bus]
            capacity = 2
            overflow_policy = "drop_oldest"
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.monitor.tick_interval_ms, 250);
        assert_eq!(config.monitor.capture_lines, 50);
        assert_eq!(config.monitor.model.as_deref(), Some("opus"));
        assert!((config.thresholds.yes_no - 0.8).abs() < f64::EPSILON);
        assert!((config.thresholds.trust - 0.5).abs() < f64::EPSILON);
        assert_eq!(config.event_bus.overflow_policy, OverflowPolicy::DropOldest);
    }

    #[test]
    fn validation_rejects_bad_values() {
        for text in [
            "[event_bus]\ncapacity = 0",
            "[event_bus]\nworkers = 0",
            "[monitor]\ntick_interval_ms = 0",
            "[thresholds]\ntrust = 1.5",
            "[thresholds]\nselection = -0.1",
        ] {
            let err = YesmanConfig::from_toml(text).unwrap_err();
            assert!(
                matches!(err, ConfigError::ValidationError(_)),
                "{text}: {err:?}"
            );
        }
    }

    #[test]
    fn parse_errors_are_distinguished() {
        let err = YesmanConfig::from_toml("[monitor\n").unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(_)));
    }

    #[test]
    fn load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = YesmanConfig::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nprior_weight = 5.0").unwrap();
        let config = YesmanConfig::load(file.path()).unwrap();
        assert!((config.engine.prior_weight - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn explicit_path_is_not_silently_defaulted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        assert!(YesmanConfig::load_or_default(Some(&path)).is_err());
    }

    #[test]
    fn thresholds_per_category() {
        let mut t = Thresholds::default();
        assert!(t.set(PromptCategory::Selection(3), 2.0));
        assert!((t.for_category(PromptCategory::Selection(2)).unwrap() - 1.0).abs() < f64::EPSILON);
        assert!(t.set(PromptCategory::YesNo, -1.0));
        assert_eq!(t.for_category(PromptCategory::YesNo), Some(0.0));
        assert!(!t.set(PromptCategory::Idle, 0.3));
        assert_eq!(t.for_category(PromptCategory::TypingInProgress), None);
        assert_eq!(t.for_category(PromptCategory::Unknown), None);
    }

    #[test]
    fn config_serializes_back_to_toml() {
        let config = YesmanConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed = YesmanConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.monitor.assistant_command, "claude");
    }
}
