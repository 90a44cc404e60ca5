//! Session orchestration.
//!
//! # Architecture
//!
//! ```text
//!                      ┌───────────────── per session task ─────────────────┐
//! start(spec) ───────► │ process check ─► capture ─► classify ─► predict ─►  │ ──► send_keys
//!                      │      │            (timeout)                threshold │
//!                      │      └─► safe restart                               │
//!                      │ outcome of last response ─► engine.record          │
//!                      │ component samples ─► metrics / alerts ─► EventBus  │
//!                      └─────────────────────────────────────────────────────┘
//! ```
//!
//! Each monitored session runs one loop task. Lifecycle per session:
//! `Stopped → Starting → Running → {Error, Stopping} → Stopped`.
//!
//! Cancellation is cooperative: `stop` flips a `watch` flag and joins the
//! task, so the in-flight tick always completes and no keys are sent once the
//! flag is set. The detector, the response engine and the bus are shared by
//! every session; the rest of a loop's state is private to its task.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, timeout};
use tracing::{Instrument, debug, info, warn};

use crate::adaptive::{AdaptiveResponseEngine, LearnedSnapshot, Prediction, PredictionSource};
use crate::collector::{ContentCollector, MultiplexerHandle, PaneSnapshot, PaneTarget};
use crate::config::{MonitorConfig, Thresholds};
use crate::detector::{PromptCategory, PromptClassification, PromptDetector};
use crate::error::{MonitorError, MuxError};
use crate::events::{Event, EventBus, EventPriority, EventType};
use crate::logging::session_span;
use crate::process::ProcessController;
use crate::telemetry::{ComponentMetricSample, ComponentMetrics, ResourceProbe};

/// Event source tag for everything the orchestrator publishes.
const EVENT_SOURCE: &str = "monitor";

/// Lower bound on the pause between ticks.
const MIN_TICK_SLEEP: Duration = Duration::from_millis(100);

/// Publish without blocking; a rejected event is only logged.
fn publish(bus: &EventBus, event: Event) {
    let event_type = event.event_type.clone();
    if !bus.publish(event).is_accepted() {
        debug!(event_type = %event_type, "Event not accepted by bus");
    }
}

// =============================================================================
// Session model
// =============================================================================

/// Lifecycle state of a monitored session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
    Error,
    Stopping,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
            Self::Stopping => "stopping",
        })
    }
}

/// Responses fixed by hand, bypassing learning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualOverrides {
    pub yes_no: Option<String>,
    /// Selections with exactly two options
    pub two_options: Option<String>,
    /// Selections with three or more options
    pub many_options: Option<String>,
}

impl ManualOverrides {
    #[must_use]
    pub fn for_category(&self, category: PromptCategory) -> Option<&str> {
        match category {
            PromptCategory::YesNo => self.yes_no.as_deref(),
            PromptCategory::Selection(n) if n <= 2 => self.two_options.as_deref(),
            PromptCategory::Selection(_) => self.many_options.as_deref(),
            _ => None,
        }
    }

    /// Set or clear the override for a category. Returns false for
    /// categories that cannot be overridden.
    pub fn set(&mut self, category: PromptCategory, response: Option<String>) -> bool {
        match category {
            PromptCategory::YesNo => self.yes_no = response,
            PromptCategory::Selection(n) if n <= 2 => self.two_options = response,
            PromptCategory::Selection(_) => self.many_options = response,
            _ => return false,
        }
        true
    }
}

/// What to monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSpec {
    pub session: String,
    pub pane: String,
    /// Scope for learned statistics; defaults to the session name
    pub context_key: Option<String>,
    pub overrides: ManualOverrides,
}

impl SessionSpec {
    #[must_use]
    pub fn new(session: impl Into<String>) -> Self {
        Self {
            session: session.into(),
            pane: "0".to_string(),
            context_key: None,
            overrides: ManualOverrides::default(),
        }
    }

    #[must_use]
    pub fn with_pane(mut self, pane: impl Into<String>) -> Self {
        self.pane = pane.into();
        self
    }

    #[must_use]
    pub fn with_context_key(mut self, context_key: impl Into<String>) -> Self {
        self.context_key = Some(context_key.into());
        self
    }

    #[must_use]
    pub fn with_overrides(mut self, overrides: ManualOverrides) -> Self {
        self.overrides = overrides;
        self
    }

    fn target(&self) -> PaneTarget {
        PaneTarget::new(self.session.clone(), self.pane.clone())
    }

    fn context(&self) -> String {
        self.context_key
            .clone()
            .unwrap_or_else(|| self.session.clone())
    }
}

/// Observable status of one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session: String,
    pub pane: String,
    pub state: SessionState,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ticks: u64,
    pub responses_sent: u64,
    pub consecutive_failures: u32,
    pub restarts: u32,
    pub last_prompt: Option<PromptCategory>,
    pub last_response: Option<String>,
}

impl SessionStatus {
    fn new(target: &PaneTarget) -> Self {
        Self {
            session: target.session.clone(),
            pane: target.pane.clone(),
            state: SessionState::Stopped,
            last_error: None,
            started_at: None,
            ticks: 0,
            responses_sent: 0,
            consecutive_failures: 0,
            restarts: 0,
            last_prompt: None,
            last_response: None,
        }
    }
}

/// State shared between the orchestrator and a session's loop.
#[derive(Debug)]
struct SessionShared {
    status: StdMutex<SessionStatus>,
    overrides: StdRwLock<ManualOverrides>,
}

impl SessionShared {
    fn update<R>(&self, f: impl FnOnce(&mut SessionStatus) -> R) -> R {
        f(&mut self.status.lock().expect("session status lock poisoned"))
    }

    fn snapshot(&self) -> SessionStatus {
        self.status
            .lock()
            .expect("session status lock poisoned")
            .clone()
    }

    fn state(&self) -> SessionState {
        self.status.lock().expect("session status lock poisoned").state
    }
}

struct SessionTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct SessionEntry {
    shared: Arc<SessionShared>,
    context_key: String,
    task: Option<SessionTask>,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Owns one monitoring loop per session.
pub struct MonitorOrchestrator {
    mux: MultiplexerHandle,
    detector: Arc<PromptDetector>,
    engine: Arc<AdaptiveResponseEngine>,
    bus: Arc<EventBus>,
    config: MonitorConfig,
    thresholds: Arc<StdRwLock<Thresholds>>,
    sessions: Mutex<HashMap<String, SessionEntry>>,
    shutting_down: AtomicBool,
}

impl fmt::Debug for MonitorOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorOrchestrator")
            .field("config", &self.config)
            .field("shutting_down", &self.shutting_down)
            .finish_non_exhaustive()
    }
}

impl MonitorOrchestrator {
    #[must_use]
    pub fn new(
        mux: MultiplexerHandle,
        detector: Arc<PromptDetector>,
        engine: Arc<AdaptiveResponseEngine>,
        bus: Arc<EventBus>,
        config: MonitorConfig,
        thresholds: Thresholds,
    ) -> Self {
        Self {
            mux,
            detector,
            engine,
            bus,
            config,
            thresholds: Arc::new(StdRwLock::new(thresholds)),
            sessions: Mutex::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Arc<AdaptiveResponseEngine> {
        &self.engine
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        *self.thresholds.read().expect("thresholds lock poisoned")
    }

    /// Adjust a category's auto-response threshold for every session.
    pub fn set_threshold(&self, category: PromptCategory, value: f64) -> bool {
        let changed = self
            .thresholds
            .write()
            .expect("thresholds lock poisoned")
            .set(category, value);
        if changed {
            info!(category = %category, value, "Threshold updated");
        }
        changed
    }

    /// Learned responses, `context → category → best response`.
    #[must_use]
    pub fn learned_snapshot(&self) -> LearnedSnapshot {
        self.engine.snapshot()
    }

    /// Begin monitoring a session.
    ///
    /// The session slot is claimed (state `Starting`) before the multiplexer
    /// is asked whether the session exists, and the map lock is not held
    /// across that call.
    pub async fn start(&self, spec: SessionSpec) -> crate::Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(MonitorError::ShuttingDown.into());
        }
        let target = spec.target();
        let shared = self.claim(&spec, &target).await?;

        if let Err(err) = self.check_exists(&spec.session).await {
            shared.update(|s| {
                s.state = SessionState::Stopped;
                s.last_error = Some(err.to_string());
            });
            warn!(session = %spec.session, error = %err, "Cannot start monitoring");
            return Err(err.into());
        }

        let mut sessions = self.sessions.lock().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            shared.update(|s| s.state = SessionState::Stopped);
            return Err(MonitorError::ShuttingDown.into());
        }
        let Some(entry) = sessions.get_mut(&spec.session) else {
            return Err(MonitorError::NotMonitored(spec.session.clone()).into());
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let session_loop = SessionLoop {
            target: target.clone(),
            context_key: spec.context(),
            shared: Arc::clone(&shared),
            collector: ContentCollector::new(
                Arc::clone(&self.mux),
                self.config.capture_lines,
                self.config.capture_timeout(),
            ),
            process: ProcessController::new(Arc::clone(&self.mux), &self.config),
            mux: Arc::clone(&self.mux),
            detector: Arc::clone(&self.detector),
            engine: Arc::clone(&self.engine),
            bus: Arc::clone(&self.bus),
            thresholds: Arc::clone(&self.thresholds),
            metrics: ComponentMetrics::new(self.config.windows),
            probe: ResourceProbe,
            config: self.config.clone(),
            last_snapshot: None,
            last_classified: None,
            pending: None,
            last_metrics: Instant::now(),
            shutdown: shutdown_rx,
        };

        shared.update(|s| {
            s.state = SessionState::Running;
            s.started_at = Some(Utc::now());
        });
        let span = session_span(&target.session, &target.pane);
        let handle = tokio::spawn(session_loop.run().instrument(span));
        entry.task = Some(SessionTask {
            shutdown: shutdown_tx,
            handle,
        });
        drop(sessions);

        info!(session = %target.session, pane = %target.pane, "Monitoring started");
        publish(
            &self.bus,
            Event::new(EventType::SessionStarted, EVENT_SOURCE)
                .with_field("session", target.session.clone())
                .with_field("pane", target.pane),
        );
        Ok(())
    }

    /// Reserve the session's slot, resetting its status to `Starting`.
    async fn claim(
        &self,
        spec: &SessionSpec,
        target: &PaneTarget,
    ) -> crate::Result<Arc<SessionShared>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(entry) = sessions.get(&spec.session) {
            match entry.shared.state() {
                SessionState::Stopped | SessionState::Error => {}
                _ => return Err(MonitorError::AlreadyRunning(spec.session.clone()).into()),
            }
        }

        let entry = sessions
            .entry(spec.session.clone())
            .or_insert_with(|| SessionEntry {
                shared: Arc::new(SessionShared {
                    status: StdMutex::new(SessionStatus::new(target)),
                    overrides: StdRwLock::new(ManualOverrides::default()),
                }),
                context_key: spec.context(),
                task: None,
            });
        // a loop that ended in Error has already exited
        entry.task = None;
        entry.context_key = spec.context();
        let shared = Arc::clone(&entry.shared);
        *shared.overrides.write().expect("overrides lock poisoned") = spec.overrides.clone();
        shared.update(|s| {
            *s = SessionStatus::new(target);
            s.state = SessionState::Starting;
        });
        Ok(shared)
    }

    async fn check_exists(&self, session: &str) -> Result<(), MuxError> {
        let exists = timeout(self.config.capture_timeout(), self.mux.session_exists(session))
            .await
            .map_err(|_| MuxError::Timeout {
                operation: "session check",
                timeout_ms: self.config.capture_timeout_ms,
            })??;
        if exists {
            Ok(())
        } else {
            Err(MuxError::SessionNotFound(session.to_string()))
        }
    }

    /// Stop monitoring a session. Stopping an idle or unknown session is a
    /// no-op.
    pub async fn stop(&self, session: &str) -> crate::Result<()> {
        let (shared, task) = {
            let mut sessions = self.sessions.lock().await;
            let Some(entry) = sessions.get_mut(session) else {
                return Ok(());
            };
            let Some(task) = entry.task.take() else {
                return Ok(());
            };
            entry.shared.update(|s| {
                if s.state != SessionState::Error {
                    s.state = SessionState::Stopping;
                }
            });
            (Arc::clone(&entry.shared), task)
        };

        let _ = task.shutdown.send(true);
        if let Err(e) = task.handle.await {
            warn!(session, error = %e, "Monitor loop ended abnormally");
        }

        shared.update(|s| {
            if s.state != SessionState::Error {
                s.state = SessionState::Stopped;
            }
        });
        info!(session, "Monitoring stopped");
        publish(
            &self.bus,
            Event::new(EventType::SessionStopped, EVENT_SOURCE).with_field("session", session),
        );
        Ok(())
    }

    /// Stop then start a session.
    pub async fn restart(&self, spec: SessionSpec) -> crate::Result<()> {
        self.stop(&spec.session).await?;
        self.start(spec).await
    }

    pub async fn status(&self, session: &str) -> Option<SessionStatus> {
        self.sessions
            .lock()
            .await
            .get(session)
            .map(|entry| entry.shared.snapshot())
    }

    /// Status of every known session, sorted by name.
    pub async fn statuses(&self) -> Vec<SessionStatus> {
        let mut all: Vec<SessionStatus> = self
            .sessions
            .lock()
            .await
            .values()
            .map(|entry| entry.shared.snapshot())
            .collect();
        all.sort_by(|a, b| a.session.cmp(&b.session));
        all
    }

    /// Replace a running session's manual override for one category.
    pub async fn set_override(
        &self,
        session: &str,
        category: PromptCategory,
        response: Option<String>,
    ) -> crate::Result<bool> {
        let sessions = self.sessions.lock().await;
        let entry = sessions
            .get(session)
            .ok_or_else(|| MonitorError::NotMonitored(session.to_string()))?;
        let changed = entry
            .shared
            .overrides
            .write()
            .expect("overrides lock poisoned")
            .set(category, response);
        Ok(changed)
    }

    /// Learn from a response a human typed into a known session, under that
    /// session's context key.
    pub async fn record_manual_response(
        &self,
        session: &str,
        category: PromptCategory,
        response: &str,
    ) -> crate::Result<()> {
        let context_key = self
            .sessions
            .lock()
            .await
            .get(session)
            .map(|entry| entry.context_key.clone())
            .ok_or_else(|| MonitorError::NotMonitored(session.to_string()))?;
        self.engine.learn_from_manual(&context_key, category, response);
        debug!(
            session,
            context_key = %context_key,
            category = %category,
            "Learned manual response"
        );
        Ok(())
    }

    /// Stop every session and refuse new ones.
    pub async fn shutdown_all(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let names: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        for name in &names {
            if let Err(e) = self.stop(name).await {
                warn!(session = %name, error = %e, "Failed to stop session");
            }
        }
        info!(sessions = names.len(), "All monitors stopped");
        publish(
            &self.bus,
            Event::new(EventType::SystemShutdown, EVENT_SOURCE)
                .with_priority(EventPriority::Critical)
                .with_field("sessions", names.len()),
        );
    }
}

// =============================================================================
// Session loop
// =============================================================================

/// A response sent on a previous tick, awaiting its outcome.
#[derive(Debug, Clone)]
struct PendingResponse {
    category: PromptCategory,
    matched_text: String,
    response: String,
}

struct SessionLoop {
    target: PaneTarget,
    context_key: String,
    shared: Arc<SessionShared>,
    collector: ContentCollector,
    process: ProcessController,
    mux: MultiplexerHandle,
    detector: Arc<PromptDetector>,
    engine: Arc<AdaptiveResponseEngine>,
    bus: Arc<EventBus>,
    thresholds: Arc<StdRwLock<Thresholds>>,
    metrics: ComponentMetrics,
    probe: ResourceProbe,
    config: MonitorConfig,
    last_snapshot: Option<PaneSnapshot>,
    last_classified: Option<Instant>,
    pending: Option<PendingResponse>,
    last_metrics: Instant,
    shutdown: watch::Receiver<bool>,
}

/// Sleep for `duration` unless shutdown is requested first. Returns true on
/// shutdown.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    if *shutdown.borrow() {
        return true;
    }
    let stopped = tokio::select! {
        () = sleep(duration) => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    };
    stopped || *shutdown.borrow()
}

impl SessionLoop {
    async fn run(mut self) {
        debug!(context_key = %self.context_key, "Monitor loop started");
        loop {
            if *self.shutdown.borrow() {
                break;
            }
            let started = Instant::now();
            let result = self.tick().await;
            self.shared.update(|s| s.ticks += 1);

            match result {
                Ok(()) => self.shared.update(|s| s.consecutive_failures = 0),
                Err(err) => {
                    let failures = self.shared.update(|s| {
                        s.consecutive_failures += 1;
                        s.last_error = Some(err.to_string());
                        s.consecutive_failures
                    });
                    warn!(failures, error = %err, "Monitor tick failed");
                    if failures >= self.config.max_consecutive_failures {
                        self.enter_error(&err);
                        return;
                    }
                    let backoff = self.error_backoff();
                    if pause(&mut self.shutdown, backoff).await {
                        break;
                    }
                    continue;
                }
            }

            self.maybe_publish_metrics();

            let rest = self
                .config
                .tick_interval()
                .saturating_sub(started.elapsed())
                .max(MIN_TICK_SLEEP);
            if pause(&mut self.shutdown, rest).await {
                break;
            }
        }
        debug!("Monitor loop exited");
    }

    /// Configured backoff plus up to 10% jitter.
    fn error_backoff(&self) -> Duration {
        let base = self.config.error_backoff();
        let jitter = rand::rng().random_range(0..=base.as_millis() as u64 / 10);
        base + Duration::from_millis(jitter)
    }

    fn enter_error(&self, err: &crate::Error) {
        let failures = self.shared.update(|s| {
            s.state = SessionState::Error;
            s.consecutive_failures
        });
        warn!(failures, error = %err, "Too many consecutive failures; monitor entering error state");
        publish(
            &self.bus,
            Event::new(EventType::SessionError, EVENT_SOURCE)
                .with_priority(EventPriority::High)
                .with_field("session", self.target.session.clone())
                .with_field("pane", self.target.pane.clone())
                .with_field("error", err.to_string())
                .with_field("consecutive_failures", failures),
        );
    }

    fn record_sample(&mut self, sample: ComponentMetricSample) {
        self.metrics.record(sample);
    }

    /// One pass of the monitor pipeline.
    async fn tick(&mut self) -> crate::Result<()> {
        // Process check
        let meter = self.probe.start("process_check").await;
        let running = self.process.is_running(&self.target).await;
        self.record_sample(meter.finish(running.is_ok()).await);
        if !running? {
            return self.handle_exited().await;
        }

        // Capture
        let meter = self.probe.start("content_capture").await;
        let captured = self.collector.capture(&self.target).await;
        self.record_sample(meter.finish(captured.is_ok()).await);
        let snapshot = captured?;

        let changed = ContentCollector::changed(self.last_snapshot.as_ref(), &snapshot);
        let recheck_due = self
            .last_classified
            .is_none_or(|at| at.elapsed() >= self.config.forced_recheck());
        if !changed && !recheck_due && self.pending.is_none() {
            return Ok(());
        }

        // Classify
        let meter = self.probe.start("prompt_detection").await;
        let classification = self.detector.classify(&snapshot);
        self.record_sample(meter.finish(true).await);
        self.last_snapshot = Some(snapshot);
        self.last_classified = Some(Instant::now());
        self.shared
            .update(|s| s.last_prompt = Some(classification.category));

        self.resolve_pending(&classification);

        if !classification.category.is_actionable() {
            return Ok(());
        }
        debug!(
            category = %classification.category,
            rule_id = classification.rule_id.as_deref().unwrap_or(""),
            matched_len = classification.matched_text.len(),
            "Prompt detected"
        );

        if !self.config.auto_response_enabled {
            self.publish_detected(&classification, &Prediction::none(), None);
            return Ok(());
        }

        // Predict
        let meter = self.probe.start("response_prediction").await;
        let prediction = self.prediction_for(&classification);
        self.record_sample(meter.finish(true).await);

        let threshold = self
            .thresholds
            .read()
            .expect("thresholds lock poisoned")
            .for_category(classification.category)
            .unwrap_or(1.0);

        match prediction.response.clone() {
            Some(response) if prediction.confidence >= threshold => {
                self.respond(&classification, &prediction, response).await
            }
            _ => {
                debug!(
                    category = %classification.category,
                    confidence = prediction.confidence,
                    threshold,
                    "Confidence below threshold; leaving prompt to the user"
                );
                self.publish_detected(&classification, &prediction, Some(threshold));
                Ok(())
            }
        }
    }

    fn prediction_for(&self, classification: &PromptClassification) -> Prediction {
        let overridden = self
            .shared
            .overrides
            .read()
            .expect("overrides lock poisoned")
            .for_category(classification.category)
            .map(str::to_string);
        match overridden {
            Some(response) => Prediction {
                response: Some(response),
                confidence: 1.0,
                source: PredictionSource::Override,
                observations: 0,
            },
            None => self.engine.predict(classification, &self.context_key),
        }
    }

    /// Score the response sent last tick against what is on screen now.
    fn resolve_pending(&mut self, classification: &PromptClassification) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let recurred = classification.category == pending.category
            && classification.matched_text == pending.matched_text;
        self.engine.record(
            &self.context_key,
            pending.category,
            &pending.response,
            !recurred,
        );
        debug!(
            category = %pending.category,
            success = !recurred,
            "Response outcome recorded"
        );
    }

    async fn respond(
        &mut self,
        classification: &PromptClassification,
        prediction: &Prediction,
        response: String,
    ) -> crate::Result<()> {
        if pause(&mut self.shutdown, self.config.response_delay()).await {
            debug!("Shutdown requested; response not sent");
            return Ok(());
        }
        if *self.shutdown.borrow() {
            return Ok(());
        }

        let meter = self.probe.start("response_sending").await;
        let send_timeout = self.config.send_timeout();
        let sent = timeout(
            send_timeout,
            self.mux.send_keys(&self.target, &response, true),
        )
        .await
        .map_err(|_| MuxError::Timeout {
            operation: "send",
            timeout_ms: send_timeout.as_millis() as u64,
        })
        .and_then(|r| r);
        self.record_sample(meter.finish(sent.is_ok()).await);
        if let Err(err) = sent {
            // unanswered prompt is re-evaluated next tick
            self.last_snapshot = None;
            return Err(err.into());
        }

        info!(
            category = %classification.category,
            confidence = prediction.confidence,
            source = ?prediction.source,
            "Auto-responded"
        );
        self.pending = Some(PendingResponse {
            category: classification.category,
            matched_text: classification.matched_text.clone(),
            response: response.clone(),
        });
        self.shared.update(|s| {
            s.responses_sent += 1;
            s.last_response = Some(response.clone());
        });
        publish(
            &self.bus,
            Event::new(EventType::ResponseSent, EVENT_SOURCE)
                .with_field("session", self.target.session.clone())
                .with_field("pane", self.target.pane.clone())
                .with_field("category", classification.category.key())
                .with_field("response", response)
                .with_field("confidence", prediction.confidence)
                .with_field(
                    "source",
                    serde_json::to_value(prediction.source).unwrap_or_default(),
                )
                .with_field(
                    "rule_id",
                    classification.rule_id.clone().unwrap_or_default(),
                ),
        );
        Ok(())
    }

    fn publish_detected(
        &self,
        classification: &PromptClassification,
        prediction: &Prediction,
        threshold: Option<f64>,
    ) {
        let mut event = Event::new(EventType::PromptDetected, EVENT_SOURCE)
            .with_field("session", self.target.session.clone())
            .with_field("pane", self.target.pane.clone())
            .with_field("category", classification.category.key())
            .with_field("confidence", prediction.confidence);
        if let Some(response) = &prediction.response {
            event = event.with_field("suggested_response", response.clone());
        }
        if let Some(threshold) = threshold {
            event = event.with_field("threshold", threshold);
        }
        publish(&self.bus, event);
    }

    /// The assistant is gone: restart it or wait for the user.
    async fn handle_exited(&mut self) -> crate::Result<()> {
        if !self.config.restart_on_exit {
            debug!("Assistant not running; auto-restart disabled");
            return Ok(());
        }
        if *self.shutdown.borrow() {
            return Ok(());
        }

        let meter = self.probe.start("process_restart").await;
        let restarted = self.process.safe_restart(&self.target).await;
        self.record_sample(meter.finish(restarted.is_ok()).await);
        let report = restarted?;

        self.last_snapshot = None;
        self.last_classified = None;
        self.pending = None;
        let restarts = self.shared.update(|s| {
            s.restarts += 1;
            s.restarts
        });
        info!(polls = report.polls, restarts, "Assistant restarted");
        publish(
            &self.bus,
            Event::new(EventType::SessionRestarted, EVENT_SOURCE)
                .with_priority(EventPriority::High)
                .with_field("session", self.target.session.clone())
                .with_field("pane", self.target.pane.clone())
                .with_field("command", report.launched)
                .with_field("restarts", restarts),
        );
        Ok(())
    }

    fn maybe_publish_metrics(&mut self) {
        if self.last_metrics.elapsed() < self.config.metrics_interval() {
            return;
        }
        self.last_metrics = Instant::now();

        let summaries = self.metrics.summaries();
        for summary in &summaries {
            for bottleneck in summary.bottlenecks(&self.config.bottleneck) {
                warn!(
                    component = %bottleneck.component,
                    kind = ?bottleneck.kind,
                    observed = bottleneck.observed,
                    threshold = bottleneck.threshold,
                    "Performance bottleneck"
                );
                publish(
                    &self.bus,
                    Event::new(EventType::PerformanceAlert, EVENT_SOURCE)
                        .with_priority(EventPriority::High)
                        .with_field("session", self.target.session.clone())
                        .with_field(
                            "bottleneck",
                            serde_json::to_value(&bottleneck).unwrap_or_default(),
                        ),
                );
            }
        }

        publish(
            &self.bus,
            Event::new(EventType::PerformanceMetrics, EVENT_SOURCE)
                .with_priority(EventPriority::Low)
                .with_field("session", self.target.session.clone())
                .with_field(
                    "components",
                    serde_json::to_value(&summaries).unwrap_or_default(),
                ),
        );
    }
}
