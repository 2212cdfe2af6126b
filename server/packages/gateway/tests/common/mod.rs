#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use render_gateway::packages::PackageStore;
use render_gateway::prober::ProbePolicy;
use render_gateway::router::{build_router_with_state, shutdown_sessions, AppState};
use render_gateway::session_manager::{RuntimeConfig, SessionManagerConfig};
use serde_json::Value;
use tempfile::TempDir;
use tower::util::ServiceExt;

pub const PUBLIC_URL: &str = "http://gateway.test";
const BOUNDARY: &str = "render-gateway-test-boundary";

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
    _dir: TempDir,
}

impl TestApp {
    /// Gateway whose runtime is this crate's binary in mock-runtime mode.
    pub async fn new(config: SessionManagerConfig) -> Self {
        let runtime = RuntimeConfig::new(mock_runtime_exe(), Path::new("/engine"))
            .with_prefix_args(vec!["mock-runtime".to_string()]);
        Self::with_runtime(runtime, config).await
    }

    pub async fn with_runtime(runtime: RuntimeConfig, config: SessionManagerConfig) -> Self {
        let dir = tempfile::tempdir().expect("create temp packages dir");
        let packages =
            PackageStore::new(dir.path().join("packages"), PUBLIC_URL).expect("package store");
        let state = Arc::new(AppState::new(packages, runtime, config));
        let (app, state) = build_router_with_state(state);
        Self {
            app,
            state,
            _dir: dir,
        }
    }

    pub async fn shutdown(&self) {
        shutdown_sessions(&self.state).await;
    }
}

pub fn mock_runtime_exe() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_render-gateway"))
}

/// Probes often enough that a freshly spawned process is found quickly.
pub fn test_config(console_port_base: u16) -> SessionManagerConfig {
    SessionManagerConfig {
        console_port_base,
        probe: ProbePolicy {
            max_attempts: 100,
            interval: Duration::from_millis(100),
            connect_timeout: Duration::from_millis(200),
        },
        refresh_probe: ProbePolicy {
            max_attempts: 1,
            interval: Duration::from_millis(10),
            connect_timeout: Duration::from_millis(200),
        },
        ..SessionManagerConfig::default()
    }
}

pub async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    listener.local_addr().expect("addr").port()
}

pub async fn send(app: &Router, method: Method, path: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .expect("request");
    read_response(app, request).await
}

pub async fn send_text(app: &Router, method: Method, path: &str) -> (StatusCode, String) {
    let request = Request::builder()
        .method(method)
        .uri(path)
        .body(Body::empty())
        .expect("request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, String::from_utf8_lossy(&bytes).to_string())
}

pub async fn upload(app: &Router, file_name: &str, bytes: &[u8]) -> (StatusCode, Value) {
    let mut body = Vec::new();
    write!(
        body,
        "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: application/zip\r\n\r\n"
    )
    .expect("write part header");
    body.extend_from_slice(bytes);
    write!(body, "\r\n--{BOUNDARY}--\r\n").expect("write trailer");

    let request = Request::builder()
        .method(Method::POST)
        .uri("/upload")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .expect("request");
    read_response(app, request).await
}

async fn read_response(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(
            String::from_utf8_lossy(&bytes).to_string(),
        ))
    };
    (status, value)
}

/// Zip archive holding `entries` as (path, contents).
pub fn zip_archive(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (path, contents) in entries {
        writer
            .start_file(*path, zip::write::FileOptions::default())
            .expect("start entry");
        writer.write_all(contents.as_bytes()).expect("write entry");
    }
    writer.finish().expect("finish zip").into_inner()
}

pub fn source_package(title: &str) -> Vec<u8> {
    let settings = format!(
        "project_name = \"{title}\"\nproject_description = \"{title} demo\"\n"
    );
    zip_archive(&[
        ("game/settings.ini", settings.as_str()),
        ("game/boot.package", "boot"),
    ])
}

/// Polls until `GET path` answers `status`.
pub async fn wait_for_status(
    app: &Router,
    path: &str,
    status: StatusCode,
    within: Duration,
) -> bool {
    let until = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < until {
        let (current, _) = send(app, Method::GET, path).await;
        if current == status {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
