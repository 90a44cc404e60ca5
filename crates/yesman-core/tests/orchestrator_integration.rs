//! End-to-end tests: several sessions monitored at once over an in-memory
//! multiplexer, with the real detector, engine and event bus.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{PaneFarm, wait_until};
use yesman_core::adaptive::AdaptiveResponseEngine;
use yesman_core::collector::ControlKey;
use yesman_core::config::{MonitorConfig, Thresholds};
use yesman_core::detector::{PromptCategory, PromptDetector};
use yesman_core::error::MonitorError;
use yesman_core::events::{Event, EventBus, EventBusConfig, EventFilter, EventType};
use yesman_core::orchestrator::{MonitorOrchestrator, SessionSpec, SessionState};

const YES_NO: &str = "Compiling api v0.1.0\nRemove the stale lockfile? (y/n)";
const TRUST: &str = "Do you trust the files in this folder?\n\n/home/dev/web\n\n❯ 1. Yes, proceed\n  2. No, exit";
const DONE: &str = "Compiling api v0.1.0\nFinished dev profile in 2.1s";
const IDLE: &str = "Welcome to Claude Code!\n\n? for shortcuts";

fn fast_config() -> MonitorConfig {
    MonitorConfig {
        tick_interval_ms: 200,
        response_delay_ms: 0,
        error_backoff_ms: 50,
        restart_step_delay_ms: 10,
        metrics_interval_ms: 60_000,
        ..MonitorConfig::default()
    }
}

fn orchestrator(farm: &Arc<PaneFarm>, config: MonitorConfig) -> MonitorOrchestrator {
    MonitorOrchestrator::new(
        farm.clone(),
        Arc::new(PromptDetector::builtin()),
        Arc::new(AdaptiveResponseEngine::default()),
        EventBus::start(EventBusConfig::default()),
        config,
        Thresholds::default(),
    )
}

/// Record every event the bus delivers.
fn record_events(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    bus.subscribe_fn(EventFilter::All, move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    seen
}

fn count(events: &Mutex<Vec<Event>>, event_type: &EventType, session: &str) -> usize {
    events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| &e.event_type == event_type)
        .filter(|e| e.field("session").and_then(|v| v.as_str()) == Some(session))
        .count()
}

// =============================================================================
// Independent sessions
// =============================================================================

#[tokio::test(start_paused = true)]
async fn sessions_are_answered_independently() {
    let farm = PaneFarm::new();
    farm.add_session("api", YES_NO);
    farm.reply_with("api", DONE);
    farm.add_session("web", TRUST);
    farm.reply_with("web", IDLE);

    let orch = orchestrator(&farm, fast_config());
    let events = record_events(orch.bus());
    orch.start(SessionSpec::new("api")).await.unwrap();
    orch.start(SessionSpec::new("web")).await.unwrap();

    let engine = Arc::clone(orch.engine());
    wait_until(|| engine.stats().iter().filter(|s| s.successes == 1).count() == 2).await;
    orch.shutdown_all().await;

    assert_eq!(farm.keys("api"), vec!["yes".to_string()]);
    assert_eq!(farm.keys("web"), vec!["1".to_string()]);

    let snapshot = orch.learned_snapshot();
    assert_eq!(snapshot["api"]["yes_no"].response, "yes");
    assert_eq!(snapshot["web"]["trust"].response, "1");
    assert!(!snapshot["api"].contains_key("trust"));

    for status in orch.statuses().await {
        assert_eq!(status.state, SessionState::Stopped);
        assert_eq!(status.responses_sent, 1);
    }

    orch.bus().shutdown().await;
    assert_eq!(count(&events, &EventType::ResponseSent, "api"), 1);
    assert_eq!(count(&events, &EventType::ResponseSent, "web"), 1);
    assert_eq!(count(&events, &EventType::SessionStarted, "api"), 1);
}

#[tokio::test(start_paused = true)]
async fn shared_context_key_pools_learning() {
    let farm = PaneFarm::new();
    for session in ["left", "right"] {
        farm.add_session(session, YES_NO);
        farm.reply_with(session, DONE);
    }

    let orch = orchestrator(&farm, fast_config());
    for session in ["left", "right"] {
        orch.start(SessionSpec::new(session).with_context_key("team"))
            .await
            .unwrap();
    }

    let engine = Arc::clone(orch.engine());
    wait_until(|| engine.stats().iter().any(|s| s.successes == 2)).await;
    orch.shutdown_all().await;

    let stats = engine.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].context_key, "team");
    assert_eq!(stats[0].category, PromptCategory::YesNo);
    assert_eq!(stats[0].observations, 2);
    assert!(!orch.learned_snapshot().contains_key("left"));
}

// =============================================================================
// Restart alongside a healthy session
// =============================================================================

#[tokio::test(start_paused = true)]
async fn exited_assistant_restarts_without_disturbing_neighbours() {
    let farm = PaneFarm::new();
    farm.add_session("api", YES_NO);
    farm.reply_with("api", DONE);
    farm.add_session("shell", DONE);
    farm.set_command("shell", "zsh");

    let orch = orchestrator(&farm, fast_config());
    let events = record_events(orch.bus());
    orch.start(SessionSpec::new("api")).await.unwrap();
    orch.start(SessionSpec::new("shell")).await.unwrap();

    let probe = Arc::clone(&farm);
    wait_until(|| probe.keys("shell").iter().any(|k| k == "claude")).await;
    farm.set_command("shell", "claude");
    let engine = Arc::clone(orch.engine());
    wait_until(|| engine.stats().iter().any(|s| s.successes == 1)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let shell = orch.status("shell").await.unwrap();
    assert_eq!(shell.state, SessionState::Running);
    assert!(shell.restarts >= 1);
    assert!(farm.controls("shell").contains(&ControlKey::CtrlC));
    assert!(farm.controls("api").is_empty());
    assert_eq!(farm.keys("api"), vec!["yes".to_string()]);

    orch.shutdown_all().await;
    orch.bus().shutdown().await;
    assert!(count(&events, &EventType::SessionRestarted, "shell") >= 1);
    assert_eq!(count(&events, &EventType::SessionRestarted, "api"), 0);
}

// =============================================================================
// Metrics
// =============================================================================

#[tokio::test(start_paused = true)]
async fn metrics_published_on_interval() {
    let farm = PaneFarm::new();
    farm.add_session("api", DONE);

    let config = MonitorConfig {
        metrics_interval_ms: 1_000,
        ..fast_config()
    };
    let orch = orchestrator(&farm, config);
    let events = record_events(orch.bus());
    orch.start(SessionSpec::new("api")).await.unwrap();

    let seen = Arc::clone(&events);
    wait_until(|| count(&seen, &EventType::PerformanceMetrics, "api") >= 2).await;
    orch.shutdown_all().await;

    let metrics = events
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.event_type == EventType::PerformanceMetrics)
        .cloned()
        .unwrap();
    let components = metrics.field("components").unwrap().as_array().unwrap();
    assert!(!components.is_empty());
    assert!(
        components
            .iter()
            .any(|c| c.to_string().contains("content_capture"))
    );
}

// =============================================================================
// Shutdown
// =============================================================================

#[tokio::test(start_paused = true)]
async fn shutdown_all_stops_sessions_and_refuses_new_ones() {
    let farm = PaneFarm::new();
    farm.add_session("api", DONE);
    farm.add_session("web", IDLE);

    let orch = orchestrator(&farm, fast_config());
    let events = record_events(orch.bus());
    orch.start(SessionSpec::new("api")).await.unwrap();
    orch.start(SessionSpec::new("web")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    orch.shutdown_all().await;
    let statuses = orch.statuses().await;
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|s| s.state == SessionState::Stopped));
    assert!(statuses.iter().all(|s| s.ticks > 0));

    let err = orch.start(SessionSpec::new("api")).await.unwrap_err();
    assert!(matches!(
        err,
        yesman_core::Error::Monitor(MonitorError::ShuttingDown)
    ));

    let report = orch.bus().shutdown().await;
    assert!(!report.timed_out);
    let events = events.lock().unwrap();
    let shutdown = events
        .iter()
        .find(|e| e.event_type == EventType::SystemShutdown)
        .expect("system.shutdown published");
    assert_eq!(shutdown.field("sessions").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(
        events
            .iter()
            .filter(|e| e.event_type == EventType::SessionStopped)
            .count(),
        2
    );
    assert!(farm.keys("api").is_empty());
    assert!(farm.keys("web").is_empty());
}
