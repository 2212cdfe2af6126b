use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
#[cfg(feature = "test-utils")]
use render_gateway_protocol::testing::{MockRuntime, MockRuntimeConfig};
#[cfg(feature = "test-utils")]
use render_gateway_protocol::STREAM_PORT_OFFSET;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::packages::PackageStore;
use crate::router::{build_router_with_state, shutdown_sessions, AppState};
use crate::session_manager::{
    default_core_dir, RuntimeConfig, SessionManagerConfig, DEFAULT_CONSOLE_PORT_BASE,
};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 80;
const DEFAULT_BUILD_CONFIG: &str = "dev";

#[derive(Parser, Debug)]
#[command(name = "render-gateway", bin_name = "render-gateway")]
#[command(about = "Launches rendering runtimes and streams their viewports", version)]
#[command(arg_required_else_help = true)]
pub struct GatewayCli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway HTTP server.
    Server(ServerArgs),
    /// Stand-in runtime that speaks the console and viewport protocols.
    #[cfg(feature = "test-utils")]
    #[command(hide = true)]
    MockRuntime(MockRuntimeArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Base URL used in app and session links. Defaults to http://host:port.
    #[arg(long)]
    public_url: Option<String>,

    #[arg(long, env = "RENDER_GATEWAY_PACKAGES_DIR")]
    packages_dir: Option<PathBuf>,

    #[arg(long, env = "RENDER_GATEWAY_RUNTIME_EXE")]
    runtime_exe: Option<PathBuf>,

    /// Engine binaries folder searched for the runtime executable.
    #[arg(long)]
    binaries: Option<PathBuf>,

    #[arg(long = "sr-bin-dir", env = "SR_BIN_DIR", hide = true)]
    sr_bin_dir: Option<PathBuf>,

    /// Engine build configuration.
    #[arg(long, default_value = DEFAULT_BUILD_CONFIG)]
    config: String,

    #[arg(long)]
    core_dir: Option<PathBuf>,

    /// Passed to the runtime before the viewport flags. Repeatable.
    #[arg(long = "runtime-arg", allow_hyphen_values = true)]
    runtime_args: Vec<String>,

    #[arg(long, default_value = "win32")]
    source_platform: String,

    /// First console port handed out; each run takes the next one.
    #[arg(long, default_value_t = DEFAULT_CONSOLE_PORT_BASE)]
    console_port_base: u16,

    #[arg(long, default_value_t = 10)]
    sweep_interval_secs: u64,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

/// Accepts the same flags a real runtime is launched with.
#[cfg(feature = "test-utils")]
#[derive(Args, Debug)]
pub struct MockRuntimeArgs {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long)]
    port: u16,

    #[arg(long)]
    silent_mode: bool,

    #[arg(long)]
    viewport_provider: bool,

    #[arg(long)]
    source_dir: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long = "map-source-dir", num_args = 2, value_names = ["NAME", "PATH"], action = clap::ArgAction::Append)]
    map_source_dir: Vec<String>,

    #[arg(long)]
    source_platform: Option<String>,

    #[arg(long)]
    compile: bool,

    #[arg(long = "continue")]
    continue_: bool,

    #[arg(long, default_value_t = 0)]
    ready_after_ms: u64,

    #[arg(long, default_value_t = 0)]
    not_ready_frames: usize,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("runtime executable not found, looked at: {}", .0.join(", "))]
    RuntimeNotFound(Vec<String>),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("server error: {0}")]
    Server(String),
}

pub fn run_gateway() -> Result<(), CliError> {
    let cli = GatewayCli::parse();
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&cli.command)
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
        .map_err(|err| CliError::Server(err.to_string()))
}

pub fn run_command(command: &Command) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(args),
        #[cfg(feature = "test-utils")]
        Command::MockRuntime(args) => run_mock_runtime(args),
    }
}

fn run_server(server: &ServerArgs) -> Result<(), CliError> {
    let cwd = std::env::current_dir()?;
    let executable = discover_runtime_exe(
        server.runtime_exe.as_deref(),
        &cwd,
        server.binaries.as_deref(),
        server.sr_bin_dir.as_deref(),
        &server.config,
    )?;
    let core_dir = server
        .core_dir
        .clone()
        .unwrap_or_else(|| default_core_dir(&executable));
    tracing::info!(
        executable = %executable.display(),
        core_dir = %core_dir.display(),
        "runtime resolved"
    );

    let display_host = match server.host.as_str() {
        "0.0.0.0" | "::" => "localhost",
        other => other,
    };
    let public_url = server
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", display_host, server.port));
    let packages_root = server
        .packages_dir
        .clone()
        .unwrap_or_else(default_packages_dir);
    let packages = PackageStore::new(packages_root, public_url.trim_end_matches('/'))?;

    let runtime_config = RuntimeConfig::new(executable, &core_dir)
        .with_prefix_args(server.runtime_args.clone())
        .with_source_platform(server.source_platform.clone());
    let manager_config = SessionManagerConfig {
        console_port_base: server.console_port_base,
        sweep_interval: Duration::from_secs(server.sweep_interval_secs.max(1)),
        ..SessionManagerConfig::default()
    };
    let cors = build_cors_layer(server)?;

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let state = Arc::new(AppState::new(packages, runtime_config, manager_config));
        let (router, state) = build_router_with_state(state);
        let router = router.layer(cors);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, public_url = %public_url, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_sessions(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

#[cfg(feature = "test-utils")]
fn run_mock_runtime(args: &MockRuntimeArgs) -> Result<(), CliError> {
    let stream_port = args
        .port
        .checked_add(STREAM_PORT_OFFSET)
        .ok_or_else(|| CliError::Server(format!("no stream port for {}", args.port)))?;
    let config = MockRuntimeConfig {
        ready_after: Duration::from_millis(args.ready_after_ms),
        not_ready_frames: args.not_ready_frames,
        ..MockRuntimeConfig::default()
    };
    tracing::info!(
        source_dir = ?args.source_dir,
        data_dir = ?args.data_dir,
        compile = args.compile,
        "mock runtime starting"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;
    runtime.block_on(async move {
        let _mock = MockRuntime::bind(&args.host, args.port, stream_port, config).await?;
        let _ = tokio::signal::ctrl_c().await;
        Ok(())
    })
}

/// Explicit path first, then `engine/win64/<config>/stingray_win64_<config>.exe`
/// under the working directory, the binaries folder and `SR_BIN_DIR`.
pub fn discover_runtime_exe(
    explicit: Option<&Path>,
    cwd: &Path,
    binaries: Option<&Path>,
    sr_bin_dir: Option<&Path>,
    config: &str,
) -> Result<PathBuf, CliError> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(CliError::RuntimeNotFound(vec![path.display().to_string()]));
    }

    let relative = Path::new("engine")
        .join("win64")
        .join(config)
        .join(format!("stingray_win64_{config}.exe"));
    let candidates: Vec<PathBuf> = [Some(cwd), binaries, sr_bin_dir]
        .into_iter()
        .flatten()
        .map(|base| base.join(&relative))
        .collect();
    candidates
        .iter()
        .find(|candidate| candidate.is_file())
        .cloned()
        .ok_or_else(|| {
            CliError::RuntimeNotFound(
                candidates
                    .iter()
                    .map(|candidate| candidate.display().to_string())
                    .collect(),
            )
        })
}

fn default_packages_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("render-gateway").join("packages"))
        .unwrap_or_else(|| PathBuf::from(".").join(".render-gateway").join("packages"))
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::fs;

    fn place_runtime(base: &Path, config: &str) -> PathBuf {
        let dir = base.join("engine").join("win64").join(config);
        fs::create_dir_all(&dir).expect("mkdir");
        let exe = dir.join(format!("stingray_win64_{config}.exe"));
        fs::write(&exe, b"").expect("write exe");
        exe
    }

    #[test]
    fn cli_definition_is_consistent() {
        GatewayCli::command().debug_assert();
    }

    #[test]
    fn discovery_prefers_working_directory() {
        let cwd = tempfile::tempdir().expect("tempdir");
        let bins = tempfile::tempdir().expect("tempdir");
        let local = place_runtime(cwd.path(), "dev");
        place_runtime(bins.path(), "dev");
        let found = discover_runtime_exe(None, cwd.path(), Some(bins.path()), None, "dev")
            .expect("found");
        assert_eq!(found, local);
    }

    #[test]
    fn discovery_falls_back_to_binaries_then_env_dir() {
        let cwd = tempfile::tempdir().expect("tempdir");
        let bins = tempfile::tempdir().expect("tempdir");
        let sr = tempfile::tempdir().expect("tempdir");
        let from_env = place_runtime(sr.path(), "release");
        let found = discover_runtime_exe(
            None,
            cwd.path(),
            Some(bins.path()),
            Some(sr.path()),
            "release",
        )
        .expect("found");
        assert_eq!(found, from_env);

        let from_bins = place_runtime(bins.path(), "release");
        let found = discover_runtime_exe(
            None,
            cwd.path(),
            Some(bins.path()),
            Some(sr.path()),
            "release",
        )
        .expect("found");
        assert_eq!(found, from_bins);
    }

    #[test]
    fn discovery_reports_every_candidate() {
        let cwd = tempfile::tempdir().expect("tempdir");
        let err = discover_runtime_exe(None, cwd.path(), None, None, "dev").expect_err("missing");
        match err {
            CliError::RuntimeNotFound(candidates) => assert_eq!(candidates.len(), 1),
            other => panic!("unexpected error: {other}"),
        }
        let err = discover_runtime_exe(Some(Path::new("/nope/runtime")), cwd.path(), None, None, "dev")
            .expect_err("missing");
        assert!(matches!(err, CliError::RuntimeNotFound(_)));
    }

    #[cfg(feature = "test-utils")]
    #[test]
    fn mock_runtime_accepts_launch_flags() {
        let cli = GatewayCli::try_parse_from([
            "render-gateway",
            "mock-runtime",
            "--silent-mode",
            "--viewport-provider",
            "--port",
            "16050",
            "--source-dir",
            "/pkg/demo",
            "--data-dir",
            "/pkg/.compiled/demo_data/win32",
            "--map-source-dir",
            "core",
            "/engine",
            "--map-source-dir",
            "gwnav",
            "/engine/editor/plugins/navigation",
            "--source-platform",
            "win32",
            "--compile",
            "--continue",
        ])
        .expect("parse");
        let Command::MockRuntime(args) = cli.command else {
            panic!("expected mock-runtime");
        };
        assert_eq!(args.port, 16050);
        assert_eq!(args.map_source_dir.len(), 4);
        assert!(args.compile && args.continue_);
    }

    #[cfg(not(feature = "test-utils"))]
    #[test]
    fn mock_runtime_is_absent_from_release_builds() {
        let parsed = GatewayCli::try_parse_from(["render-gateway", "mock-runtime", "--port", "16050"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn server_accepts_repeated_runtime_args() {
        let cli = GatewayCli::try_parse_from([
            "render-gateway",
            "server",
            "--runtime-arg",
            "mock-runtime",
            "--runtime-arg",
            "--ready-after-ms=10",
        ])
        .expect("parse");
        let Command::Server(args) = cli.command else {
            panic!("expected server");
        };
        assert_eq!(args.runtime_args, vec!["mock-runtime", "--ready-after-ms=10"]);
        assert_eq!(args.port, 80);
    }
}
