//! Upload, run and evict against real child processes: the runtime is this
//! crate's binary started in `mock-runtime` mode.

mod common;

use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::{Method, StatusCode};
use common::*;
use render_gateway::prober::ProbePolicy;
use render_gateway::session_manager::{RuntimeConfig, SessionManagerConfig};
use render_gateway_protocol::ControlChannel;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_millis() as u64
}

#[tokio::test]
async fn upload_run_and_keep_alive() {
    let base = free_port().await;
    let test_app = TestApp::new(test_config(base)).await;
    let (status, _) = upload(&test_app.app, "demo.zip", &source_package("Demo")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, session) = send(&test_app.app, Method::GET, "/run/demo").await;
    assert_eq!(status, StatusCode::OK, "{session}");
    assert_eq!(session["appName"], "demo");
    assert_eq!(session["ready"], true);
    assert_eq!(session["ports"]["console"], base);
    assert_eq!(session["ports"]["stream"], base + 1000);
    let pid = session["pid"].as_u64().expect("pid");
    assert_eq!(
        session["links"]["view"],
        format!("{PUBLIC_URL}/game.html?path=demo&pid={pid}&viewer=true")
    );
    assert_eq!(session["links"]["info"], format!("{PUBLIC_URL}/process/{pid}"));
    let args: Vec<String> =
        serde_json::from_value(session["args"].clone()).expect("args");
    assert_eq!(args[0], "mock-runtime");
    let port_arg = base.to_string();
    assert!(args
        .windows(2)
        .any(|pair| pair[0] == "--port" && pair[1] == port_arg));
    assert!(args.iter().any(|arg| arg == "--compile"));

    // the runtime answers on its console port once the gateway reports ready
    let channel = ControlChannel::connect(&render_gateway_protocol::console_url("127.0.0.1", base))
        .await
        .expect("console reachable");
    channel
        .handshake(Duration::from_secs(1))
        .await
        .expect("handshake");
    channel.close().await;

    let (status, processes) = send(&test_app.app, Method::GET, "/processes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(processes.as_array().map(Vec::len), Some(1));

    let (status, refreshed) = send(&test_app.app, Method::GET, &format!("/process/{pid}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refreshed["ready"], true);

    let before = now_ms();
    let (status, kept) =
        send(&test_app.app, Method::POST, &format!("/process/{pid}/keep-a-live")).await;
    let after = now_ms();
    assert_eq!(status, StatusCode::OK);
    let deadline = kept["keepAliveDeadline"].as_u64().expect("deadline");
    assert!(deadline >= before + 60_000);
    assert!(deadline <= after + 60_000);

    test_app.shutdown().await;
    assert!(
        wait_for_status(
            &test_app.app,
            &format!("/process/{pid}"),
            StatusCode::NOT_FOUND,
            Duration::from_secs(10)
        )
        .await
    );
}

#[tokio::test]
async fn idle_session_is_evicted() {
    let base = free_port().await;
    let config = SessionManagerConfig {
        first_contact_grace: Duration::from_secs(4),
        sweep_interval: Duration::from_millis(100),
        ..test_config(base)
    };
    let test_app = TestApp::new(config).await;
    let (status, _) = upload(&test_app.app, "demo.zip", &source_package("Demo")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, session) = send(&test_app.app, Method::GET, "/run/demo").await;
    assert_eq!(status, StatusCode::OK, "{session}");
    let pid = session["pid"].as_u64().expect("pid");

    assert!(
        wait_for_status(
            &test_app.app,
            &format!("/process/{pid}"),
            StatusCode::NOT_FOUND,
            Duration::from_secs(15)
        )
        .await,
        "session {pid} was never evicted"
    );
    let (status, _) =
        send(&test_app.app, Method::POST, &format!("/process/{pid}/keep-a-live")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn concurrent_runs_get_distinct_ports() {
    let base = free_port().await;
    let test_app = TestApp::new(test_config(base)).await;
    let (status, _) = upload(&test_app.app, "demo.zip", &source_package("Demo")).await;
    assert_eq!(status, StatusCode::OK);

    let (a, b, c) = tokio::join!(
        send(&test_app.app, Method::GET, "/run/demo"),
        send(&test_app.app, Method::GET, "/run/demo"),
        send(&test_app.app, Method::GET, "/run/demo"),
    );
    let mut ports = HashSet::new();
    for (status, session) in [a, b, c] {
        assert_eq!(status, StatusCode::OK, "{session}");
        ports.insert(session["ports"]["console"].as_u64().expect("port"));
    }
    assert_eq!(ports.len(), 3);
    assert!(ports.iter().all(|port| *port >= u64::from(base) && *port < u64::from(base) + 3));

    test_app.shutdown().await;
}

#[cfg(unix)]
#[tokio::test]
async fn silent_runtime_answers_424_with_session() {
    let runtime = RuntimeConfig::new("/bin/sh", std::path::Path::new("/engine"))
        .with_prefix_args(vec!["-c".to_string(), "exec sleep 30".to_string()]);
    let config = SessionManagerConfig {
        probe: ProbePolicy {
            max_attempts: 2,
            interval: Duration::from_millis(20),
            connect_timeout: Duration::from_millis(50),
        },
        ..test_config(free_port().await)
    };
    let test_app = TestApp::with_runtime(runtime, config).await;
    let (status, _) = upload(&test_app.app, "demo.zip", &source_package("Demo")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, session) = send(&test_app.app, Method::GET, "/run/demo").await;
    assert_eq!(status, StatusCode::FAILED_DEPENDENCY);
    assert_eq!(session["ready"], false);
    let pid = session["pid"].as_u64().expect("pid");

    let (status, processes) = send(&test_app.app, Method::GET, "/processes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(processes[0]["pid"], pid);

    test_app.shutdown().await;
}
