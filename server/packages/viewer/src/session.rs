//! Outer loop around the engine: finds or starts a session through the
//! gateway, keeps it alive and replaces the engine each time it closes.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};

use crate::client::{ClientError, GatewayClient, SessionInfo};
use crate::engine::{EngineConfig, EngineHandle, EngineState, EngineTarget, ViewportSink};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// Start a new runtime for an installed application.
    App(String),
    /// Attach to a session that is already running.
    Pid(u32),
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub keep_alive_interval: Duration,
    /// Delay between polls while the session reports it is still starting.
    pub not_ready_retry: Duration,
    pub ready_wait: Duration,
    /// Engines created before giving up. `None` keeps going until shutdown.
    pub max_attempts: Option<u32>,
    /// Host the runtime is reached on. Defaults to the gateway's host.
    pub runtime_host: Option<String>,
    pub engine: EngineConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(10),
            not_ready_retry: Duration::from_secs(1),
            ready_wait: Duration::from_secs(120),
            max_attempts: None,
            runtime_host: None,
            engine: EngineConfig::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("session {pid} did not become ready within {waited_ms}ms")]
    NotReady { pid: u32, waited_ms: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    AttemptsExhausted,
    SessionGone,
}

#[derive(Debug, Clone)]
pub struct DriverReport {
    pub session: SessionInfo,
    pub engines: u32,
    pub stopped: StopReason,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionDriver {
    client: GatewayClient,
    config: DriverConfig,
}

impl SessionDriver {
    pub fn new(client: GatewayClient, config: DriverConfig) -> Self {
        Self { client, config }
    }

    pub fn client(&self) -> &GatewayClient {
        &self.client
    }

    pub async fn resolve(&self, target: &SessionTarget) -> Result<SessionInfo, DriverError> {
        let session = match target {
            SessionTarget::App(name) => {
                let session = self.client.run(name).await?;
                tracing::info!(
                    app = %name,
                    pid = session.pid,
                    port = session.ports.console,
                    ready = session.ready,
                    "session started"
                );
                session
            }
            SessionTarget::Pid(pid) => self.client.process(*pid).await?,
        };
        Ok(session)
    }

    /// Polls the gateway until the session reports ready.
    pub async fn wait_ready(&self, mut session: SessionInfo) -> Result<SessionInfo, DriverError> {
        let started = Instant::now();
        while !session.ready {
            if started.elapsed() >= self.config.ready_wait {
                return Err(DriverError::NotReady {
                    pid: session.pid,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tracing::info!(pid = session.pid, "still starting");
            sleep(self.config.not_ready_retry).await;
            session = self.client.process(session.pid).await?;
        }
        Ok(session)
    }

    pub fn engine_target(&self, session: &SessionInfo) -> EngineTarget {
        let host = self
            .config
            .runtime_host
            .clone()
            .or_else(|| self.client.base().host_str().map(str::to_string))
            .unwrap_or_else(|| "127.0.0.1".to_string());
        EngineTarget::new(host, session.ports.console).with_stream_port(session.ports.stream)
    }

    /// Streams the session until `shutdown` resolves, the session disappears
    /// or the engine budget runs out. `make_sink` is called once per engine.
    pub async fn run<S, F, Fut>(
        &self,
        target: SessionTarget,
        mut make_sink: F,
        shutdown: Fut,
    ) -> Result<DriverReport, DriverError>
    where
        S: ViewportSink,
        F: FnMut() -> S,
        Fut: Future<Output = ()>,
    {
        let session = self.resolve(&target).await?;
        let pid = session.pid;
        // a compiling runtime must not be swept while we wait for it
        let keep_alive = spawn_keep_alive(self.client.clone(), pid, self.config.keep_alive_interval);
        let session = match self.wait_ready(session).await {
            Ok(session) => session,
            Err(err) => {
                keep_alive.abort();
                return Err(err);
            }
        };
        tokio::pin!(shutdown);

        let mut engines = 0u32;
        let mut last_error = None;
        let stopped = loop {
            engines += 1;
            let engine = EngineHandle::spawn(
                self.engine_target(&session),
                self.config.engine.clone(),
                make_sink(),
            );
            let mut states = engine.watch_state();
            let interrupted = loop {
                tokio::select! {
                    () = &mut shutdown => break true,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break false;
                        }
                        let state = *states.borrow_and_update();
                        tracing::info!(pid, engine = engines, state = ?state, "viewer state");
                        if state == EngineState::Closed {
                            break false;
                        }
                    }
                }
            };

            if interrupted {
                engine.close();
                if let Err(err) = engine.join().await {
                    last_error = Some(err.to_string());
                }
                break StopReason::Shutdown;
            }
            if let Err(err) = engine.join().await {
                last_error = Some(err.to_string());
            }
            if self.config.max_attempts.is_some_and(|max| engines >= max) {
                break StopReason::AttemptsExhausted;
            }
            match self.client.process(pid).await {
                Err(err) if err.is_not_found() => {
                    tracing::warn!(pid, "session is gone");
                    break StopReason::SessionGone;
                }
                Err(err) => tracing::debug!(pid, error = %err, "session lookup failed"),
                Ok(_) => {}
            }
            tokio::select! {
                () = &mut shutdown => break StopReason::Shutdown,
                () = sleep(self.config.engine.reconnect_delay) => {}
            }
        };
        keep_alive.abort();

        tracing::info!(pid, engines, stopped = ?stopped, "viewer stopped");
        Ok(DriverReport {
            session,
            engines,
            stopped,
            last_error,
        })
    }
}

/// Extends the session deadline every `interval` until the gateway forgets
/// the session.
fn spawn_keep_alive(client: GatewayClient, pid: u32, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match client.keep_alive(pid).await {
                Ok(session) => tracing::debug!(
                    pid,
                    deadline = session.keep_alive_deadline,
                    "keep-alive sent"
                ),
                Err(err) if err.is_not_found() => {
                    tracing::warn!(pid, "keep-alive rejected, session is gone");
                    return;
                }
                Err(err) => tracing::debug!(pid, error = %err, "keep-alive failed"),
            }
        }
    })
}
