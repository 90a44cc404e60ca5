//! yesman CLI
//!
//! `yesman monitor <session>` watches a tmux pane and answers assistant
//! prompts until Ctrl-C. `yesman classify` runs the detector over a file or
//! stdin and prints the result as JSON.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use yesman_core::adaptive::{AdaptiveResponseEngine, Prediction};
use yesman_core::collector::{PaneSnapshot, PaneTarget, TmuxMultiplexer};
use yesman_core::config::{LogFormat, YesmanConfig};
use yesman_core::detector::{PromptClassification, PromptDetector};
use yesman_core::events::{EventBus, EventFilter};
use yesman_core::logging::init_logging;
use yesman_core::orchestrator::{MonitorOrchestrator, SessionSpec, SessionState};

#[derive(Debug, Parser)]
#[command(name = "yesman", version, about = "Answer AI assistant prompts in tmux panes")]
struct Cli {
    /// Config file (defaults to ~/.config/yesman/yesman.toml when present)
    #[arg(long, global = true, env = "YESMAN_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,

    /// Log filter directive, e.g. `debug` or `yesman_core=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Monitor a tmux session until interrupted
    Monitor {
        /// tmux session name
        session: String,

        /// Pane within the session (tmux target suffix)
        #[arg(long, default_value = "0")]
        pane: String,

        /// Scope for learned responses (defaults to the session name)
        #[arg(long)]
        context: Option<String>,

        /// Model passed to the assistant on restart
        #[arg(long)]
        model: Option<String>,

        /// Detect prompts but never answer them
        #[arg(long)]
        no_auto_response: bool,

        /// Print every bus event as a JSON line on stdout
        #[arg(long)]
        events: bool,
    },

    /// Classify pane text from a file or stdin
    Classify {
        /// Input file; reads stdin when omitted
        file: Option<PathBuf>,

        /// Pretty-print the JSON output
        #[arg(long)]
        pretty: bool,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn parse_log_format(s: &str) -> Result<LogFormat, String> {
    s.parse()
}

#[derive(Debug, Serialize)]
struct ClassifyOutput {
    classification: PromptClassification,
    prediction: Prediction,
}

fn load_config(cli: &Cli) -> Result<YesmanConfig> {
    let mut config = YesmanConfig::load_or_default(cli.config.as_deref())?;
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    if let Some(level) = &cli.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("failed to read stdin")?;
            Ok(text)
        }
    }
}

fn classify(config: &YesmanConfig, file: Option<&Path>, pretty: bool) -> Result<()> {
    let text = read_input(file)?;
    let detector = PromptDetector::from_config(&config.detector)?;
    let engine = AdaptiveResponseEngine::new(config.engine.clone());

    let snapshot = PaneSnapshot::from_text(
        PaneTarget::new("stdin", "0"),
        &text,
        text.lines().count().max(1),
    );
    let classification = detector.classify(&snapshot);
    let prediction = engine.predict(&classification, "cli");
    let output = ClassifyOutput {
        classification,
        prediction,
    };
    let json = if pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{json}");
    Ok(())
}

async fn monitor(
    mut config: YesmanConfig,
    spec: SessionSpec,
    model: Option<String>,
    no_auto_response: bool,
    print_events: bool,
) -> Result<()> {
    if let Some(model) = model {
        config.monitor.model = Some(model);
    }
    if no_auto_response {
        config.monitor.auto_response_enabled = false;
    }

    let detector = Arc::new(PromptDetector::from_config(&config.detector)?);
    let engine = Arc::new(AdaptiveResponseEngine::new(config.engine.clone()));
    let bus = EventBus::start(config.event_bus.clone());
    if print_events {
        bus.subscribe_fn(EventFilter::All, |event| {
            println!("{}", serde_json::to_string(event)?);
            Ok(())
        });
    }

    let mux = Arc::new(TmuxMultiplexer::new(config.monitor.tmux_binary.clone()));
    let orchestrator = MonitorOrchestrator::new(
        mux,
        detector,
        engine,
        Arc::clone(&bus),
        config.monitor.clone(),
        config.thresholds,
    );

    let session = spec.session.clone();
    orchestrator.start(spec).await?;

    let mut poll = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("Interrupted; shutting down");
                break;
            }
            _ = poll.tick() => {
                let state = orchestrator.status(&session).await.map(|s| s.state);
                if state == Some(SessionState::Error) {
                    warn!(session = %session, "Monitor entered error state");
                    break;
                }
            }
        }
    }

    let status = orchestrator.status(&session).await;
    orchestrator.shutdown_all().await;
    let report = bus.shutdown().await;
    info!(
        processed = report.processed,
        abandoned = report.abandoned,
        "Event bus drained"
    );

    match status {
        Some(status) if status.state == SessionState::Error => anyhow::bail!(
            "monitor for '{session}' stopped: {}",
            status.last_error.unwrap_or_default()
        ),
        _ => Ok(()),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(&cli)?;

    match cli.command {
        Command::Classify { file, pretty } => classify(&config, file.as_deref(), pretty),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        Command::Monitor {
            session,
            pane,
            context,
            model,
            no_auto_response,
            events,
        } => {
            init_logging(&config.logging)?;
            let mut spec = SessionSpec::new(session).with_pane(pane);
            if let Some(context) = context {
                spec = spec.with_context_key(context);
            }
            monitor(config, spec, model, no_auto_response, events).await
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(remediation) = err
                .downcast_ref::<yesman_core::Error>()
                .and_then(yesman_core::Error::remediation)
            {
                eprintln!("\n{}", remediation.render_plain());
            } else if let Some(config_err) = err.downcast_ref::<yesman_core::error::ConfigError>() {
                eprintln!("\n{}", config_err.remediation().render_plain());
            }
            ExitCode::FAILURE
        }
    }
}
