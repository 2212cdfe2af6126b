use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use render_gateway_protocol::CaptureMode;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::client::{ClientError, GatewayClient};
use crate::engine::{DecodedFrame, EngineConfig, ViewportSink};
use crate::session::{DriverConfig, DriverError, SessionDriver, SessionTarget};
use crate::stats::FrameStats;

#[derive(Parser, Debug)]
#[command(name = "render-gateway-viewer", bin_name = "render-gateway-viewer")]
#[command(about = "Headless viewer for a render-gateway session", version)]
pub struct ViewerCli {
    /// Gateway base URL.
    #[arg(long, default_value = "http://localhost:80")]
    gateway: String,

    /// Start a new session for this application.
    #[arg(long, conflicts_with = "pid", required_unless_present = "pid")]
    app: Option<String>,

    /// Attach to a running session.
    #[arg(long)]
    pid: Option<u32>,

    /// Host the runtime ports are reached on. Defaults to the gateway host.
    #[arg(long)]
    runtime_host: Option<String>,

    #[arg(long, value_enum, default_value_t = StreamMode::Jpeg)]
    mode: StreamMode,

    #[arg(long, default_value_t = 5)]
    stats_interval_secs: u64,

    /// Engines to create before giving up. Unlimited when omitted.
    #[arg(long)]
    max_attempts: Option<u32>,

    /// Viewport size announced once streaming starts.
    #[arg(long, value_parser = parse_size)]
    size: Option<(u32, u32)>,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMode {
    Jpeg,
    Raw,
    Elementary,
}

impl From<StreamMode> for CaptureMode {
    fn from(mode: StreamMode) -> Self {
        match mode {
            StreamMode::Jpeg => CaptureMode::StreamedCompressed,
            StreamMode::Raw => CaptureMode::StreamedUncompressed,
            StreamMode::Elementary => CaptureMode::ElementaryStream,
        }
    }
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error("invalid size {0}, expected WIDTHxHEIGHT")]
    InvalidSize(String),
    #[error("viewer error: {0}")]
    Viewer(String),
}

fn parse_size(value: &str) -> Result<(u32, u32), String> {
    let invalid = || CliError::InvalidSize(value.to_string()).to_string();
    let (width, height) = value.split_once(['x', 'X']).ok_or_else(invalid)?;
    let width = width.trim().parse().map_err(|_| invalid())?;
    let height = height.trim().parse().map_err(|_| invalid())?;
    Ok((width, height))
}

pub fn run_viewer() -> Result<(), CliError> {
    let cli = ViewerCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Viewer(err.to_string()))?;
    runtime.block_on(view(&cli))
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Viewer(err.to_string()))
}

async fn view(cli: &ViewerCli) -> Result<(), CliError> {
    let target = match (&cli.app, cli.pid) {
        (_, Some(pid)) => SessionTarget::Pid(pid),
        (Some(app), None) => SessionTarget::App(app.clone()),
        (None, None) => return Err(CliError::Viewer("either --app or --pid is required".to_string())),
    };
    let client = GatewayClient::new(&cli.gateway)?;
    let config = DriverConfig {
        max_attempts: cli.max_attempts,
        runtime_host: cli.runtime_host.clone(),
        engine: EngineConfig {
            initial_size: cli.size,
            ..EngineConfig::default().with_capture_mode(cli.mode.into())
        },
        ..DriverConfig::default()
    };
    let driver = SessionDriver::new(client, config);

    let stats = Arc::new(Mutex::new(FrameStats::new()));
    let reporter = spawn_stats_reporter(
        Arc::clone(&stats),
        Duration::from_secs(cli.stats_interval_secs.max(1)),
    );
    let make_sink = || StatsSink {
        stats: Arc::clone(&stats),
        seen_frame: false,
    };
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down viewer");
    };

    let report = driver.run(target, make_sink, shutdown).await;
    reporter.abort();
    let report = report?;
    tracing::info!(
        pid = report.session.pid,
        engines = report.engines,
        stopped = ?report.stopped,
        last_error = report.last_error.as_deref().unwrap_or(""),
        "viewer finished"
    );
    Ok(())
}

/// Counts frames and units into the shared statistics window.
struct StatsSink {
    stats: Arc<Mutex<FrameStats>>,
    seen_frame: bool,
}

impl StatsSink {
    fn record(&mut self, bytes: usize) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        stats.record(Instant::now(), bytes);
    }
}

impl ViewportSink for StatsSink {
    fn render(&mut self, frame: DecodedFrame) {
        if !self.seen_frame {
            self.seen_frame = true;
            tracing::info!(width = frame.width, height = frame.height, "first frame");
        }
        self.record(frame.payload_len);
    }

    fn unit(&mut self, unit: Vec<u8>) {
        self.record(unit.len());
    }
}

fn spawn_stats_reporter(
    stats: Arc<Mutex<FrameStats>>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let snapshot = stats
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .snapshot();
            tracing::info!(
                frames = snapshot.frames,
                fps = format!("{:.1}", snapshot.fps),
                mean_kb = format!("{:.1}", snapshot.mean_kb),
                quality = snapshot.tier.as_str(),
                "frame stats"
            );
        }
    })
}
