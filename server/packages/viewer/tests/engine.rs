use std::future::Future;
use std::time::Duration;

use render_gateway_protocol::testing::{
    render_frame, MockRuntime, MockRuntimeConfig, MAX_FRAME_DIMENSION,
};
use render_gateway_protocol::{CaptureMode, CaptureOptions, DctMethod, InputEvent, StreamControl};
use render_gateway_viewer::engine::{
    decode_frame, DecodedFrame, EngineConfig, EngineError, EngineEvent, EngineHandle, EngineState,
    EngineTarget, ViewportSink,
};
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

struct ChannelSink {
    frames: mpsc::UnboundedSender<DecodedFrame>,
    units: mpsc::UnboundedSender<Vec<u8>>,
}

impl ViewportSink for ChannelSink {
    fn render(&mut self, frame: DecodedFrame) {
        let _ = self.frames.send(frame);
    }

    fn unit(&mut self, unit: Vec<u8>) {
        let _ = self.units.send(unit);
    }
}

struct Received {
    frames: mpsc::UnboundedReceiver<DecodedFrame>,
    units: mpsc::UnboundedReceiver<Vec<u8>>,
}

fn sink() -> (ChannelSink, Received) {
    let (frames, frame_rx) = mpsc::unbounded_channel();
    let (units, unit_rx) = mpsc::unbounded_channel();
    (
        ChannelSink { frames, units },
        Received {
            frames: frame_rx,
            units: unit_rx,
        },
    )
}

fn target(runtime: &MockRuntime) -> EngineTarget {
    EngineTarget::new("127.0.0.1", runtime.console_port()).with_stream_port(runtime.stream_port())
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        ready_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(20),
        ..EngineConfig::default()
    }
}

async fn start(config: MockRuntimeConfig) -> MockRuntime {
    MockRuntime::start(config).await.expect("mock runtime")
}

async fn within<T>(future: impl Future<Output = T>) -> T {
    timeout(WAIT, future).await.expect("timed out")
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let until = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < until {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn streams_jpeg_frames_after_handshake() {
    let runtime = start(MockRuntimeConfig::default()).await;
    let (sink, mut received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);

    for _ in 0..3 {
        let frame = within(received.frames.recv()).await.expect("frame");
        assert_eq!((frame.width, frame.height), (4, 2));
        assert_eq!(frame.rgba.len(), 4 * 2 * 4);
    }
    assert_eq!(engine.state(), EngineState::Streaming);
    assert_eq!(
        runtime.controls().first(),
        Some(&StreamControl::Options {
            mode: CaptureMode::StreamedCompressed,
            options: CaptureOptions::jpeg(90, DctMethod::Fast),
        })
    );

    let mut states = engine.watch_state();
    engine.close();
    within(states.wait_for(|state| *state == EngineState::Closed))
        .await
        .expect("closed");
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn raw_frames_are_passed_through() {
    let runtime = start(MockRuntimeConfig {
        width: 3,
        height: 1,
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, mut received) = sink();
    let config = fast_config().with_capture_mode(CaptureMode::StreamedUncompressed);
    let engine = EngineHandle::spawn(target(&runtime), config, sink);

    let frame = within(received.frames.recv()).await.expect("frame");
    assert_eq!((frame.width, frame.height), (3, 1));
    assert_eq!(frame.rgba, [200u8, 30, 30, 255].repeat(3));
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn not_ready_replies_are_retried() {
    let runtime = start(MockRuntimeConfig {
        not_ready_frames: 3,
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, mut received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);

    within(received.frames.recv()).await.expect("frame");
    assert!(runtime.frame_requests() >= 4);
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn waits_until_runtime_reports_ready() {
    let runtime = start(MockRuntimeConfig {
        ready_after: Duration::from_millis(300),
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, mut received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);

    assert!(within(engine.wait_for_state(EngineState::Streaming)).await);
    assert!(runtime.console_connections() >= 2);
    within(received.frames.recv()).await.expect("frame");
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn resize_is_debounced_and_announced() {
    let runtime = start(MockRuntimeConfig::default()).await;
    let (sink, mut received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);
    assert!(within(engine.wait_for_state(EngineState::Streaming)).await);

    engine.resize(10, 10);
    engine.resize(8, 6);
    let resized = within(async {
        loop {
            let frame = received.frames.recv().await.expect("frame");
            if frame.width == 8 {
                return frame;
            }
        }
    })
    .await;
    assert_eq!(resized.height, 6);

    let scripts = runtime.scripts();
    assert!(scripts.iter().any(|s| s == "stingray.Window.set_resolution(8, 6)"));
    assert!(!scripts.iter().any(|s| s.contains("set_resolution(10, 10)")));
    assert!(runtime.controls().contains(&StreamControl::Resize {
        width: 8,
        height: 6
    }));
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn initial_size_is_announced_on_open() {
    let runtime = start(MockRuntimeConfig::default()).await;
    let (sink, mut received) = sink();
    let config = EngineConfig {
        initial_size: Some((16, 9)),
        ..fast_config()
    };
    let engine = EngineHandle::spawn(target(&runtime), config, sink);

    let frame = within(received.frames.recv()).await.expect("frame");
    assert_eq!((frame.width, frame.height), (16, 9));
    assert!(runtime
        .scripts()
        .iter()
        .any(|s| s == "stingray.Window.set_resolution(16, 9)"));
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn input_is_flushed_as_batched_scripts() {
    let runtime = start(MockRuntimeConfig::default()).await;
    let (sink, _received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);
    assert!(within(engine.wait_for_state(EngineState::Streaming)).await);

    engine.input(InputEvent::KeyDown { key: 65 });
    engine.input(InputEvent::KeyDown { key: 65 });
    engine.input(InputEvent::KeyUp { key: 65 });
    engine.browser_button(true, 1);

    assert!(
        eventually(|| {
            let batches = input_batches(&runtime);
            batches.contains("[\"input_type\"] = 1") && batches.contains("[\"input_type\"] = 3")
        })
        .await
    );
    let batches = input_batches(&runtime);
    assert_eq!(batches.matches("[\"input_type\"] = 0").count(), 1);
    assert!(batches.contains("[\"button\"] = 2"));
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn input_batches_arrive_in_order() {
    let runtime = start(MockRuntimeConfig::default()).await;
    let (sink, mut received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);
    assert!(within(engine.wait_for_state(EngineState::Streaming)).await);

    for key in 1..=12u32 {
        engine.input(InputEvent::KeyPress { key });
        tokio::time::sleep(Duration::from_millis(7)).await;
    }
    // frames keep flowing while input is written
    within(received.frames.recv()).await.expect("frame");

    let expected: Vec<String> = (1..=12).map(|key| format!("[\"key\"] = {key}}}")).collect();
    assert!(
        eventually(|| {
            let batches = input_batches(&runtime);
            expected.iter().all(|key| batches.contains(key.as_str()))
        })
        .await
    );
    let batches = input_batches(&runtime);
    let positions: Vec<usize> = expected
        .iter()
        .filter_map(|key| batches.find(key.as_str()))
        .collect();
    assert_eq!(positions.len(), 12);
    assert!(positions.windows(2).all(|pair| pair[0] < pair[1]));
    engine.close();
    within(engine.join()).await.expect("clean close");
}

fn input_batches(runtime: &MockRuntime) -> String {
    runtime
        .scripts()
        .into_iter()
        .filter(|script| script.starts_with("stingray.Input.add_remote_events("))
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn console_commands_and_scripts_are_forwarded() {
    let runtime = start(MockRuntimeConfig::default()).await;
    let (sink, _received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);

    // queued during bring-up and sent once streaming starts
    engine.command("#reload demo fast");
    engine.script("print(1)");

    assert!(
        eventually(|| runtime
            .commands()
            .contains(&("reload".to_string(), vec!["demo".to_string(), "fast".to_string()])))
        .await
    );
    assert!(eventually(|| runtime.scripts().iter().any(|s| s == "print(1)")).await);
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn runtime_log_lines_become_events() {
    let runtime = start(MockRuntimeConfig {
        greeting: Some("compiling boot.package".to_string()),
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, _received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);
    let mut events = engine.subscribe();

    let event = within(events.recv()).await.expect("event");
    assert_eq!(
        event,
        EngineEvent::Log {
            message: "compiling boot.package".to_string()
        }
    );
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn elementary_stream_units_reach_the_sink() {
    let runtime = start(MockRuntimeConfig {
        stream_chunks: vec![
            vec![0x00, 0x00],
            vec![0x00, 0x01, 0x0A, 0x0A, 0x00, 0x00, 0x01, 0x0B, 0x0B, 0x0B],
        ],
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, mut received) = sink();
    let config = fast_config().with_capture_mode(CaptureMode::ElementaryStream);
    let engine = EngineHandle::spawn(target(&runtime), config, sink);

    assert_eq!(within(received.units.recv()).await, Some(vec![0x0A, 0x0A]));
    assert_eq!(within(received.units.recv()).await, Some(vec![0x0B, 0x0B, 0x0B]));
    // the runtime closed the stream, which ends the engine
    within(engine.join()).await.expect("clean close");
}

#[tokio::test]
async fn not_ready_on_the_stream_port_sends_no_frame_request() {
    let runtime = start(MockRuntimeConfig {
        stream_chunks: vec![vec![0x00, 0x00, 0x01, 0x0C, 0x00, 0x00, 0x01]],
        stream_not_ready: true,
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, mut received) = sink();
    let config = EngineConfig {
        not_ready_retry: Duration::from_millis(10),
        ..fast_config().with_capture_mode(CaptureMode::ElementaryStream)
    };
    let engine = EngineHandle::spawn(target(&runtime), config, sink);

    assert_eq!(within(received.units.recv()).await, Some(vec![0x0C]));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(runtime.stream_texts(), 0);
    assert_eq!(runtime.frame_requests(), 0);
    engine.close();
    within(engine.join()).await.expect("clean close");
}

#[test]
fn oversized_mock_frames_are_clamped() {
    let payload = render_frame(CaptureMode::StreamedUncompressed, u32::MAX, 2);
    let frame = decode_frame(&payload, CaptureMode::StreamedUncompressed).expect("frame");
    assert_eq!((frame.width, frame.height), (MAX_FRAME_DIMENSION, 2));
    assert_eq!(frame.rgba.len(), (MAX_FRAME_DIMENSION * 2 * 4) as usize);
}

#[tokio::test]
async fn gives_up_after_configured_bring_up_attempts() {
    let runtime = start(MockRuntimeConfig {
        answer_handshake: false,
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, _received) = sink();
    let config = EngineConfig {
        ready_timeout: Duration::from_millis(100),
        max_control_attempts: Some(2),
        ..fast_config()
    };
    let engine = EngineHandle::spawn(target(&runtime), config, sink);
    let states = engine.watch_state();

    let result = within(engine.join()).await;
    assert!(matches!(
        result,
        Err(EngineError::ControlUnavailable { attempts: 2 })
    ));
    assert_eq!(*states.borrow(), EngineState::Closed);
    assert_eq!(runtime.console_connections(), 2);
}

#[tokio::test]
async fn close_during_bring_up_ends_cleanly() {
    let runtime = start(MockRuntimeConfig {
        answer_handshake: false,
        ..MockRuntimeConfig::default()
    })
    .await;
    let (sink, _received) = sink();
    let engine = EngineHandle::spawn(target(&runtime), fast_config(), sink);

    assert!(eventually(|| engine.state() == EngineState::AwaitingReady).await);
    engine.close();
    within(engine.join()).await.expect("clean close");
}
