use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use render_gateway_error::GatewayError;
use render_gateway_protocol::{console_url, ChannelError, ControlChannel, STREAM_PORT_OFFSET};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use utoipa::ToSchema;

use crate::packages::{find_executables, AppDescriptor, AppKind, PackageStore};
use crate::prober::{wait_until_open, ProbePolicy};
use crate::supervisor::{LaunchSpec, ProcessExit, ProcessHandle, Supervisor};

pub const DEFAULT_CONSOLE_PORT_BASE: u16 = 16050;

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Host used to reach spawned runtimes.
    pub probe_host: String,
    pub console_port_base: u16,
    pub stream_port_offset: u16,
    /// Lifetime granted to a new session before its first keep-alive.
    pub first_contact_grace: Duration,
    pub keep_alive_extension: Duration,
    pub sweep_interval: Duration,
    pub probe: ProbePolicy,
    /// Used when a session is re-checked after launch.
    pub refresh_probe: ProbePolicy,
    pub handshake_timeout: Duration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        Self {
            probe_host: "127.0.0.1".to_string(),
            console_port_base: DEFAULT_CONSOLE_PORT_BASE,
            stream_port_offset: STREAM_PORT_OFFSET,
            first_contact_grace: Duration::from_secs(100),
            keep_alive_extension: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(10),
            probe: ProbePolicy::default(),
            refresh_probe: ProbePolicy::from_max_wait(Duration::from_secs(1)),
            handshake_timeout: Duration::from_millis(1000),
        }
    }
}

/// How source packages are launched.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub executable: PathBuf,
    /// Passed before every other argument.
    pub prefix_args: Vec<String>,
    pub source_platform: String,
    /// `--map-source-dir <name> <path>` pairs.
    pub source_dir_mappings: Vec<(String, PathBuf)>,
}

impl RuntimeConfig {
    /// Maps `core` and `gwnav` under `core_dir`, the engine checkout root.
    pub fn new(executable: impl Into<PathBuf>, core_dir: &Path) -> Self {
        Self {
            executable: executable.into(),
            prefix_args: Vec::new(),
            source_platform: "win32".to_string(),
            source_dir_mappings: vec![
                ("core".to_string(), core_dir.to_path_buf()),
                (
                    "gwnav".to_string(),
                    core_dir.join("editor").join("plugins").join("navigation"),
                ),
            ],
        }
    }

    pub fn with_prefix_args(mut self, prefix_args: Vec<String>) -> Self {
        self.prefix_args = prefix_args;
        self
    }

    pub fn with_source_platform(mut self, platform: impl Into<String>) -> Self {
        self.source_platform = platform.into();
        self
    }
}

/// Three levels above the directory holding the runtime executable.
pub fn default_core_dir(executable: &Path) -> PathBuf {
    let mut dir = executable.parent().map(Path::to_path_buf).unwrap_or_default();
    for _ in 0..3 {
        dir = dir.parent().map(Path::to_path_buf).unwrap_or(dir);
    }
    dir
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionPorts {
    pub console: u16,
    pub stream: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct SessionLinks {
    pub info: String,
    pub view: String,
    pub cmd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub app_name: String,
    pub pid: u32,
    pub ports: SessionPorts,
    pub executable: String,
    pub args: Vec<String>,
    /// Unix time in milliseconds after which the sweep terminates the process.
    pub keep_alive_deadline: u64,
    pub ready: bool,
    pub links: SessionLinks,
}

/// Result of a run request. A launch error leaves the session registered
/// and not ready.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub session: Session,
    pub launch_error: Option<GatewayError>,
}

#[derive(Debug)]
struct SessionRecord {
    session: Session,
    handle: ProcessHandle,
    deadline: Instant,
}

impl SessionRecord {
    fn extend(&mut self, by: Duration) {
        self.deadline = Instant::now() + by;
        self.session.keep_alive_deadline = unix_ms_after(by);
    }
}

#[derive(Debug)]
struct Registry {
    sessions: HashMap<u32, SessionRecord>,
    next_console_port: u16,
}

#[derive(Debug, Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    packages: PackageStore,
    runtime: RuntimeConfig,
    config: SessionManagerConfig,
    supervisor: Supervisor,
    registry: Mutex<Registry>,
}

impl SessionManager {
    /// Starts the exit listener and the idle sweep. Needs a tokio runtime.
    pub fn new(packages: PackageStore, runtime: RuntimeConfig, config: SessionManagerConfig) -> Self {
        let (supervisor, exits) = Supervisor::new();
        let registry = Registry {
            sessions: HashMap::new(),
            next_console_port: config.console_port_base,
        };
        let inner = Arc::new(Inner {
            packages,
            runtime,
            config,
            supervisor,
            registry: Mutex::new(registry),
        });
        spawn_exit_listener(Arc::downgrade(&inner), exits);
        spawn_sweeper(Arc::downgrade(&inner), inner.config.sweep_interval);
        Self { inner }
    }

    pub fn packages(&self) -> &PackageStore {
        &self.inner.packages
    }

    pub fn config(&self) -> &SessionManagerConfig {
        &self.inner.config
    }

    pub fn list_applications(&self) -> Vec<AppDescriptor> {
        self.inner.packages.list()
    }

    pub fn get_application(&self, name: &str) -> Result<AppDescriptor, GatewayError> {
        self.inner.packages.describe(name)
    }

    pub async fn run_application(&self, name: &str) -> Result<RunOutcome, GatewayError> {
        let app = self.inner.packages.describe(name)?;
        let plan = self.launch_plan(&app)?;

        let (session, console_port) = {
            let mut registry = self.inner.registry.lock().await;
            let console_port = registry.next_console_port;
            let ports = SessionPorts {
                console: console_port,
                stream: console_port
                    .checked_add(self.inner.config.stream_port_offset)
                    .ok_or_else(port_range_exhausted)?,
            };
            registry.next_console_port = console_port
                .checked_add(1)
                .ok_or_else(port_range_exhausted)?;

            let spec = plan.into_spec(console_port);
            // spawned under the lock so an early exit cannot race registration
            let handle = self.inner.supervisor.spawn(&spec)?;
            let session = self.new_session(&app, &spec, &handle, ports);
            registry.sessions.insert(
                handle.pid(),
                SessionRecord {
                    session: session.clone(),
                    handle,
                    deadline: Instant::now() + self.inner.config.first_contact_grace,
                },
            );
            (session, console_port)
        };
        tracing::info!(
            app = %name,
            pid = session.pid,
            port = console_port,
            "session registered"
        );

        let launch_error = self.bring_up(console_port).await.err();
        let pid = session.pid;
        let session = {
            let mut registry = self.inner.registry.lock().await;
            match registry.sessions.get_mut(&pid) {
                Some(record) => {
                    record.session.ready = launch_error.is_none();
                    record.session.clone()
                }
                None => session,
            }
        };
        match &launch_error {
            None => tracing::info!(app = %name, pid, "session ready"),
            Some(err) if err.is_transient_launch_failure() => {
                tracing::warn!(app = %name, pid, error = %err, "session not ready")
            }
            Some(err) => tracing::error!(app = %name, pid, error = %err, "session bring-up failed"),
        }
        Ok(RunOutcome {
            session,
            launch_error,
        })
    }

    /// Re-probes the console port and records the result as `ready`.
    pub async fn refresh_session(&self, pid: u32) -> Result<Session, GatewayError> {
        let console_port = self.get_session(pid).await?.ports.console;
        let config = &self.inner.config;
        let open = wait_until_open(&config.probe_host, console_port, config.refresh_probe)
            .await
            .is_ok();
        let mut registry = self.inner.registry.lock().await;
        let record = registry
            .sessions
            .get_mut(&pid)
            .ok_or(GatewayError::SessionNotFound { pid })?;
        record.session.ready = open;
        Ok(record.session.clone())
    }

    pub async fn keep_alive(&self, pid: u32) -> Result<Session, GatewayError> {
        let mut registry = self.inner.registry.lock().await;
        let record = registry
            .sessions
            .get_mut(&pid)
            .ok_or(GatewayError::SessionNotFound { pid })?;
        record.extend(self.inner.config.keep_alive_extension);
        tracing::debug!(pid, "keep-alive");
        Ok(record.session.clone())
    }

    pub async fn get_session(&self, pid: u32) -> Result<Session, GatewayError> {
        let registry = self.inner.registry.lock().await;
        registry
            .sessions
            .get(&pid)
            .map(|record| record.session.clone())
            .ok_or(GatewayError::SessionNotFound { pid })
    }

    pub async fn list_sessions(&self) -> Vec<Session> {
        let registry = self.inner.registry.lock().await;
        let mut sessions: Vec<Session> = registry
            .sessions
            .values()
            .map(|record| record.session.clone())
            .collect();
        sessions.sort_by_key(|session| session.ports.console);
        sessions
    }

    /// Terminates every session whose deadline has passed. Removal follows
    /// from the exit notification.
    pub async fn sweep(&self) -> usize {
        self.inner.sweep().await
    }

    /// Terminates every running session.
    pub async fn shutdown(&self) {
        let handles: Vec<ProcessHandle> = {
            let registry = self.inner.registry.lock().await;
            registry
                .sessions
                .values()
                .map(|record| record.handle.clone())
                .collect()
        };
        for handle in handles {
            tracing::info!(pid = handle.pid(), "terminating runtime on shutdown");
            handle.terminate();
        }
    }

    async fn bring_up(&self, console_port: u16) -> Result<(), GatewayError> {
        let config = &self.inner.config;
        wait_until_open(&config.probe_host, console_port, config.probe).await?;
        let url = console_url(&config.probe_host, console_port);
        let channel = ControlChannel::connect_with_timeout(&url, config.handshake_timeout)
            .await
            .map_err(channel_error)?;
        let handshake = channel
            .handshake(config.handshake_timeout)
            .await
            .map_err(channel_error);
        channel.close().await;
        handshake
    }

    fn launch_plan(&self, app: &AppDescriptor) -> Result<LaunchPlan, GatewayError> {
        let app_dir = self.inner.packages.app_dir(&app.name);
        match app.kind {
            AppKind::Source => {
                let runtime = &self.inner.runtime;
                let data_dir = self
                    .inner
                    .packages
                    .compiled_data_dir(&app.name, &runtime.source_platform);
                fs::create_dir_all(&data_dir)?;
                let mut extra = vec![
                    "--source-dir".to_string(),
                    slashed(&app_dir),
                    "--data-dir".to_string(),
                    slashed(&data_dir),
                ];
                for (name, path) in &runtime.source_dir_mappings {
                    extra.push("--map-source-dir".to_string());
                    extra.push(name.clone());
                    extra.push(slashed(path));
                }
                extra.extend([
                    "--source-platform".to_string(),
                    runtime.source_platform.clone(),
                    "--compile".to_string(),
                    "--continue".to_string(),
                ]);
                Ok(LaunchPlan {
                    executable: runtime.executable.clone(),
                    prefix: runtime.prefix_args.clone(),
                    extra,
                    working_dir: app_dir,
                })
            }
            AppKind::Bundled => {
                let candidates = find_executables(&app_dir);
                match candidates.as_slice() {
                    [executable] => Ok(LaunchPlan {
                        executable: executable.clone(),
                        prefix: Vec::new(),
                        extra: Vec::new(),
                        working_dir: app_dir,
                    }),
                    _ => Err(GatewayError::NoExecutableFound {
                        app: app.name.clone(),
                        candidates: candidates.len(),
                    }),
                }
            }
            AppKind::Webgl2 => Err(GatewayError::UnsupportedKind {
                app: app.name.clone(),
                kind: app.kind.as_str().to_string(),
            }),
        }
    }

    fn new_session(
        &self,
        app: &AppDescriptor,
        spec: &LaunchSpec,
        handle: &ProcessHandle,
        ports: SessionPorts,
    ) -> Session {
        let public_url = self.inner.packages.public_url();
        let pid = handle.pid();
        Session {
            app_name: app.name.clone(),
            pid,
            ports,
            executable: slashed(&spec.executable),
            args: spec.args.clone(),
            keep_alive_deadline: unix_ms_after(self.inner.config.first_contact_grace),
            ready: false,
            links: SessionLinks {
                info: format!("{public_url}/process/{pid}"),
                view: format!(
                    "{public_url}/game.html?path={}&pid={pid}&viewer=true",
                    app.name
                ),
                cmd: spec.command_line(),
            },
        }
    }
}

fn port_range_exhausted() -> GatewayError {
    GatewayError::Io {
        message: "console port range exhausted".to_string(),
    }
}

impl Inner {
    async fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<ProcessHandle> = {
            let registry = self.registry.lock().await;
            registry
                .sessions
                .values()
                .filter(|record| record.deadline < now)
                .map(|record| record.handle.clone())
                .collect()
        };
        for handle in &expired {
            tracing::warn!(pid = handle.pid(), "killing inactive runtime");
            handle.terminate();
        }
        expired.len()
    }

    async fn remove(&self, exit: ProcessExit) {
        let removed = self.registry.lock().await.sessions.remove(&exit.pid);
        if let Some(record) = removed {
            tracing::info!(
                pid = exit.pid,
                app = %record.session.app_name,
                code = ?exit.code,
                signal = ?exit.signal,
                "session removed"
            );
        }
    }
}

/// Launch arguments before the console port is known.
struct LaunchPlan {
    executable: PathBuf,
    prefix: Vec<String>,
    extra: Vec<String>,
    working_dir: PathBuf,
}

impl LaunchPlan {
    fn into_spec(self, console_port: u16) -> LaunchSpec {
        let mut args = self.prefix;
        args.extend(viewport_provider_args(console_port));
        args.extend(self.extra);
        LaunchSpec {
            executable: self.executable,
            args,
            working_dir: self.working_dir,
        }
    }
}

pub fn viewport_provider_args(console_port: u16) -> Vec<String> {
    vec![
        "--silent-mode".to_string(),
        "--viewport-provider".to_string(),
        "--port".to_string(),
        console_port.to_string(),
    ]
}

fn spawn_exit_listener(inner: Weak<Inner>, mut exits: mpsc::UnboundedReceiver<ProcessExit>) {
    tokio::spawn(async move {
        while let Some(exit) = exits.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.remove(exit).await;
        }
    });
}

fn spawn_sweeper(inner: Weak<Inner>, period: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.sweep().await;
        }
    });
}

fn channel_error(err: ChannelError) -> GatewayError {
    match err {
        ChannelError::Connect { url, reason } => GatewayError::ConnectionLost {
            message: format!("{url}: {reason}"),
        },
        ChannelError::RequestTimeout { kind, .. } => GatewayError::RequestTimeout { request: kind },
        ChannelError::ConnectionLost => GatewayError::ConnectionLost {
            message: "control channel closed".to_string(),
        },
        other => GatewayError::ProtocolError {
            message: other.to_string(),
        },
    }
}

fn slashed(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn unix_ms_after(duration: Duration) -> u64 {
    let at = SystemTime::now() + duration;
    at.duration_since(UNIX_EPOCH)
        .map(|since| since.as_millis() as u64)
        .unwrap_or(0)
}
