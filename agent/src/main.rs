//! Telemetry Agent demo
//!
//! Boots the agent with the logging exporter, emits sample spans, logs and
//! metrics for a while, then shuts down cleanly.

use clap::Parser;
use color_eyre::eyre::{eyre, Result, WrapErr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use telemetry_agent::storage::DirectoryCacheStorage;
use telemetry_agent::{
    AgentConfig, InitState, LogRecordData, MetricData, Severity, SpanData, TelemetryAgent,
};
use telemetry_shared::utils::{bytes_to_hex, parse_duration, parse_size};
use telemetry_shared::utils::time::{system_time_millis, system_time_nanos};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "telemetry-agent")]
#[command(about = "Demo of the buffered telemetry agent", long_about = None)]
#[command(version)]
struct Args {
    /// Directory holding the disk buffer
    #[arg(long, env = "TELEMETRY_AGENT_CACHE_DIR")]
    cache_dir: Option<PathBuf>,

    /// How long to emit sample telemetry (e.g., "30s", "5m")
    #[arg(short, long, default_value = "10s")]
    duration: String,

    /// Configuration file (TOML or JSON)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Export directly, without the disk buffer
    #[arg(long)]
    no_disk: bool,

    /// Disk quota per signal kind (e.g., "20MiB")
    #[arg(long)]
    max_buffer_size: Option<String>,

    /// Print the agent's Prometheus metrics on exit
    #[arg(long)]
    print_metrics: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();

    init_tracing(args.verbose)?;

    info!("Starting telemetry agent demo");
    info!("Configuration: {:?}", args);

    let duration =
        parse_duration(&args.duration).map_err(|e| eyre!("Failed to parse duration: {:#}", e))?;

    let mut config = AgentConfig::load(args.config.as_deref())
        .map_err(|e| eyre!("Failed to load configuration: {:#}", e))?;
    if args.no_disk {
        config.disk_buffering.enabled = false;
    }
    if let Some(size) = &args.max_buffer_size {
        config.disk_buffering.storage.max_folder_size_bytes =
            parse_size(size).map_err(|e| eyre!("Failed to parse buffer size: {:#}", e))?;
        config
            .validate()
            .map_err(|e| eyre!("Invalid buffer size: {:#}", e))?;
    }

    let mut builder = TelemetryAgent::builder(config);
    if let Some(dir) = args.cache_dir {
        builder = builder.with_cache_storage(Arc::new(DirectoryCacheStorage::new(dir)));
    }
    let agent = builder.build().wrap_err("Failed to start telemetry agent")?;

    // Emitted before the exporters exist; replayed once they attach.
    agent
        .logs()
        .emit(LogRecordData::new(Severity::Info, "agent booting"));

    match agent.wait_until_ready().await {
        InitState::Ready { disk_buffering } => {
            info!("Exporters ready (disk buffering: {})", disk_buffering)
        }
        state => warn!("Exporters not ready: {:?}", state),
    }

    run_demo(&agent, duration).await;

    agent.shutdown().await.wrap_err("Shutdown failed")?;
    if args.print_metrics {
        println!("{}", telemetry_agent::metrics::encode_metrics());
    }
    info!("Demo complete");
    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}

/// One request span, one log line and two metric points per tick.
async fn run_demo(agent: &TelemetryAgent, duration: Duration) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let mut request: u64 = 0;

    while started.elapsed() < duration {
        ticker.tick().await;
        request += 1;

        let trace_id = bytes_to_hex(&(system_time_nanos() as u128 ^ request as u128).to_be_bytes());
        let span_id = bytes_to_hex(&request.to_be_bytes());
        let start = system_time_nanos();
        let latency_ms = 20 + (system_time_millis() % 80);

        let mut span = SpanData::new("GET /checkout", trace_id.clone(), span_id.clone())
            .with_attribute("http.status_code", 200i64)
            .with_attribute("request.sequence", request as i64);
        span.start_time_unix_nano = start;
        span.end_time_unix_nano = start + latency_ms * 1_000_000;
        agent.spans().emit(span);

        let mut log = LogRecordData::new(Severity::Info, format!("served request {}", request))
            .with_attribute("latency_ms", latency_ms as i64);
        log.trace_id = Some(trace_id);
        log.span_id = Some(span_id);
        agent.logs().emit(log);

        agent.metrics().emit(MetricData::counter("http.requests", request as f64));
        agent
            .metrics()
            .emit(MetricData::gauge("http.latency_ms", latency_ms as f64));
    }

    if let Err(e) = agent.force_flush().await {
        warn!("Final flush failed: {}", e);
    }
    info!("Emitted {} sample requests", request);
}
