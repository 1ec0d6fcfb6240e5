//! pulse CLI: operator interface to the telemetry agent core.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use pulse_agent::agent::{Agent, Environment};
use pulse_agent::config::AgentConfig;
use pulse_agent::coordinator::TabBus;
use pulse_agent::events::TrackOutcome;
use pulse_agent::model::Event;
use pulse_agent::storage::{FileBackend, MemoryBackend, OriginStore, StorageBackend, Tier};
use pulse_agent::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "pulse", about = "Client-side telemetry agent core")]
struct Cli {
    /// TOML config file; falls back to PULSE_* environment variables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print the effective values
    Check,
    /// Run several tabs of one origin and report who leads which session
    Simulate {
        /// Number of tabs to open
        #[arg(long, default_value_t = 3)]
        tabs: usize,
        /// Seconds to let the tabs run before reporting
        #[arg(long, default_value_t = 3)]
        seconds: u64,
        /// Coordinate through shared storage instead of the broadcast bus
        #[arg(long)]
        storage_link: bool,
    },
    /// Track events from a JSON-lines file, flush, and print diagnostics
    Replay {
        /// One event object per line
        file: PathBuf,
        /// Durable storage directory (events that fail delivery survive here)
        #[arg(long)]
        state_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let telemetry = init_telemetry(TelemetryConfig {
        endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
        service_name: "pulse".to_string(),
        ..TelemetryConfig::default()
    })?;

    let outcome = match cli.command {
        Command::Check => cmd_check(cli.config.as_deref()),
        Command::Simulate {
            tabs,
            seconds,
            storage_link,
        } => cmd_simulate(cli.config.as_deref(), tabs, seconds, storage_link).await,
        Command::Replay { file, state_dir } => {
            cmd_replay(cli.config.as_deref(), file, state_dir).await
        }
    };
    // The agents are destroyed by now; export their final spans.
    telemetry.flush();
    outcome
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AgentConfig> {
    let config = match path {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::from_env()?,
    };
    Ok(config)
}

fn cmd_check(path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(path)?;

    println!("Namespace:        {}", config.storage_namespace);
    println!("Session timeout:  {}s", config.session_timeout.as_secs());
    println!("Sampling rate:    {}", config.sampling_rate);
    println!("Flush interval:   {}s", config.flush_interval.as_secs());
    println!("Queue bound:      {}", config.max_queue_len);
    println!(
        "Rate limits:      {}/s overall, {}/min per event",
        config.max_events_per_second, config.max_same_event_per_minute
    );
    println!(
        "Breaker:          {} failures, {}s cool-down",
        config.breaker_failure_threshold,
        config.breaker_cooldown.as_secs()
    );
    println!("QA mode:          {}", config.qa_mode);
    if config.destinations.is_empty() {
        println!("Destinations:     -");
    }
    for destination in &config.destinations {
        println!(
            "Destination:      {} -> {} (token: {})",
            destination.name,
            destination.url,
            if destination.api_key.is_some() { "set" } else { "none" }
        );
    }
    Ok(())
}

async fn cmd_simulate(
    path: Option<&Path>,
    tabs: usize,
    seconds: u64,
    storage_link: bool,
) -> anyhow::Result<()> {
    anyhow::ensure!(tabs > 0, "need at least one tab");

    let origin = OriginStore::new(Arc::new(MemoryBackend::new(Tier::Durable)));
    let bus = (!storage_link).then(TabBus::new);

    let mut agents = Vec::with_capacity(tabs);
    for n in 1..=tabs {
        let tab_id = format!("tab-{n}");
        let mut environment = Environment::new()
            .with_tab_id(&tab_id)
            .with_durable(Arc::new(origin.handle(&tab_id)) as Arc<dyn StorageBackend>);
        if let Some(bus) = &bus {
            environment = environment.with_bus(Arc::clone(bus));
        }

        let agent = Agent::new(load_config(path)?, environment)?;
        agent.init().await?;
        agent.track(Event::page_view(format!("https://example.com/{tab_id}")))?;
        agents.push(agent);
    }

    tokio::time::sleep(Duration::from_secs(seconds)).await;

    println!("{:<8}  {:<10}  SESSION", "TAB", "ROLE");
    println!("{}", "-".repeat(60));
    for agent in &agents {
        println!(
            "{:<8}  {:<10}  {}",
            agent.tab_id().unwrap_or("-"),
            agent.role().map(|r| r.to_string()).unwrap_or_default(),
            agent.session_id().as_deref().unwrap_or("-")
        );
    }

    for agent in &agents {
        agent.destroy();
    }
    Ok(())
}

async fn cmd_replay(
    path: Option<&Path>,
    file: PathBuf,
    state_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = load_config(path)?;
    let content = std::fs::read_to_string(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;

    let mut environment = Environment::new().with_tab_id("replay");
    if let Some(dir) = state_dir {
        environment = environment.with_durable(Arc::new(FileBackend::open(dir)?));
    }
    let agent = Agent::new(config, environment)?;
    agent.init().await?;

    let (mut queued, mut suppressed) = (0usize, 0usize);
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .with_context(|| format!("{}:{}: not an event", file.display(), index + 1))?;
        match agent.track(event)? {
            TrackOutcome::Queued => queued += 1,
            TrackOutcome::Suppressed(reason) => {
                suppressed += 1;
                tracing::debug!(line = index + 1, %reason, "event suppressed");
            }
        }
    }

    let report = agent.flush().await?;
    println!(
        "Tracked {queued} event(s), suppressed {suppressed}; flushed {} to {} destination(s){}",
        report.events,
        report.delivered_to,
        if report.persisted { ", persisted for retry" } else { "" }
    );
    println!("{}", serde_json::to_string_pretty(&agent.diagnostics()?)?);

    agent.destroy();
    Ok(())
}
