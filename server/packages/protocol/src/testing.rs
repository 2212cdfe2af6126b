//! In-process stand-in for a runtime: answers the console handshake, serves
//! frames on `/viewportserver` and pushes an elementary stream on the stream
//! port.

use std::io::Cursor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::control::{ConsoleMessage, IS_READY};
use crate::frame::{CaptureMode, Frame, FrameHeader, FrameRequest, StreamControl, NOT_READY};
use crate::VIEWPORT_PATH;

#[derive(Debug, Clone)]
pub struct MockRuntimeConfig {
    /// `is-ready` answers `ready: false` until this long after start.
    pub ready_after: Duration,
    /// When false the handshake is never answered.
    pub answer_handshake: bool,
    /// Number of frame requests answered with `not_ready` first.
    pub not_ready_frames: usize,
    pub width: u32,
    pub height: u32,
    /// Bytes pushed to each stream-port client, one message per chunk.
    pub stream_chunks: Vec<Vec<u8>>,
    /// Log line sent to a console client after its first `is-ready` reply.
    pub greeting: Option<String>,
    /// Sends `not_ready` before the stream chunks and keeps the stream socket
    /// open, counting text messages, until the client leaves.
    pub stream_not_ready: bool,
}

/// Largest width or height the mock renders.
pub const MAX_FRAME_DIMENSION: u32 = 2048;

impl Default for MockRuntimeConfig {
    fn default() -> Self {
        Self {
            ready_after: Duration::ZERO,
            answer_handshake: true,
            not_ready_frames: 0,
            width: 4,
            height: 2,
            stream_chunks: Vec::new(),
            greeting: None,
            stream_not_ready: false,
        }
    }
}

#[derive(Debug, Default)]
struct Recorded {
    scripts: Mutex<Vec<String>>,
    commands: Mutex<Vec<(String, Vec<String>)>>,
    controls: Mutex<Vec<StreamControl>>,
    frame_requests: AtomicUsize,
    console_connections: AtomicUsize,
    stream_texts: AtomicUsize,
    size: Mutex<(u32, u32)>,
}

pub struct MockRuntime {
    console_addr: SocketAddr,
    stream_addr: SocketAddr,
    recorded: Arc<Recorded>,
    tasks: Vec<JoinHandle<()>>,
}

impl MockRuntime {
    /// Binds both listeners on ephemeral loopback ports.
    pub async fn start(config: MockRuntimeConfig) -> std::io::Result<Self> {
        Self::bind("127.0.0.1", 0, 0, config).await
    }

    pub async fn bind(
        host: &str,
        console_port: u16,
        stream_port: u16,
        config: MockRuntimeConfig,
    ) -> std::io::Result<Self> {
        let console = TcpListener::bind((host, console_port)).await?;
        let stream = TcpListener::bind((host, stream_port)).await?;
        let console_addr = console.local_addr()?;
        let stream_addr = stream.local_addr()?;

        let recorded = Arc::new(Recorded {
            size: Mutex::new((config.width, config.height)),
            ..Recorded::default()
        });
        let config = Arc::new(config);
        let started = Instant::now();

        let console_task = {
            let recorded = Arc::clone(&recorded);
            let config = Arc::clone(&config);
            tokio::spawn(async move {
                while let Ok((socket, _)) = console.accept().await {
                    let recorded = Arc::clone(&recorded);
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        serve_console_socket(socket, recorded, config, started).await;
                    });
                }
            })
        };
        let stream_task = {
            let recorded = Arc::clone(&recorded);
            let config = Arc::clone(&config);
            tokio::spawn(async move {
                while let Ok((socket, _)) = stream.accept().await {
                    let recorded = Arc::clone(&recorded);
                    let config = Arc::clone(&config);
                    tokio::spawn(async move {
                        serve_stream_socket(socket, recorded, config).await;
                    });
                }
            })
        };

        tracing::info!(
            console_port = console_addr.port(),
            stream_port = stream_addr.port(),
            "mock runtime listening"
        );
        Ok(Self {
            console_addr,
            stream_addr,
            recorded,
            tasks: vec![console_task, stream_task],
        })
    }

    pub fn console_port(&self) -> u16 {
        self.console_addr.port()
    }

    pub fn stream_port(&self) -> u16 {
        self.stream_addr.port()
    }

    pub fn scripts(&self) -> Vec<String> {
        lock(&self.recorded.scripts).clone()
    }

    pub fn commands(&self) -> Vec<(String, Vec<String>)> {
        lock(&self.recorded.commands).clone()
    }

    pub fn controls(&self) -> Vec<StreamControl> {
        lock(&self.recorded.controls).clone()
    }

    pub fn frame_requests(&self) -> usize {
        self.recorded.frame_requests.load(Ordering::SeqCst)
    }

    pub fn console_connections(&self) -> usize {
        self.recorded.console_connections.load(Ordering::SeqCst)
    }

    /// Text messages received on the stream port.
    pub fn stream_texts(&self) -> usize {
        self.recorded.stream_texts.load(Ordering::SeqCst)
    }

    /// Stops accepting new sockets. Connected sockets keep being served.
    pub fn shutdown(&self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Drop for MockRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn serve_console_socket(
    socket: TcpStream,
    recorded: Arc<Recorded>,
    config: Arc<MockRuntimeConfig>,
    started: Instant,
) {
    let mut path = String::new();
    let capture_path =
        |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            Ok(response)
        };
    let accepted = tokio_tungstenite::accept_hdr_async(socket, capture_path).await;
    let ws = match accepted {
        Ok(ws) => ws,
        Err(err) => {
            tracing::debug!(error = %err, "mock runtime handshake failed");
            return;
        }
    };

    if path == VIEWPORT_PATH {
        serve_viewport(ws, recorded, config).await;
        return;
    }

    recorded.console_connections.fetch_add(1, Ordering::SeqCst);
    let (mut writer, mut reader) = ws.split();
    let mut greeting = config.greeting.clone();

    while let Some(Ok(message)) = reader.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        if let Ok(console) = serde_json::from_value::<ConsoleMessage>(value.clone()) {
            match console {
                ConsoleMessage::Script { script } => lock(&recorded.scripts).push(script),
                ConsoleMessage::Command { command, arg } => {
                    lock(&recorded.commands).push((command, arg))
                }
            }
            continue;
        }

        let Some(id) = value.get("id").cloned() else {
            continue;
        };
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let reply = if kind == IS_READY {
            if !config.answer_handshake {
                continue;
            }
            json!({ "id": id, "ready": started.elapsed() >= config.ready_after })
        } else {
            json!({ "id": id, "type": kind })
        };
        if writer.send(Message::Text(reply.to_string())).await.is_err() {
            break;
        }
        if kind == IS_READY {
            if let Some(line) = greeting.take() {
                let log = json!({ "message": line });
                if writer.send(Message::Text(log.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn serve_viewport<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    recorded: Arc<Recorded>,
    config: Arc<MockRuntimeConfig>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut writer, mut reader) = ws.split();
    while let Some(Ok(message)) = reader.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        if let Ok(control) = serde_json::from_str::<StreamControl>(&text) {
            if let StreamControl::Resize { width, height } = &control {
                *lock(&recorded.size) = (*width, *height);
            }
            lock(&recorded.controls).push(control);
            continue;
        }
        let Ok(request) = serde_json::from_str::<FrameRequest>(&text) else {
            continue;
        };

        // counted across sockets so a reconnecting viewer resumes streaming
        let seen = recorded.frame_requests.fetch_add(1, Ordering::SeqCst) + 1;
        let reply = if seen <= config.not_ready_frames {
            Message::Text(NOT_READY.to_string())
        } else {
            let (width, height) = *lock(&recorded.size);
            Message::Binary(render_frame(request.mode, width, height))
        };
        if writer.send(reply).await.is_err() {
            break;
        }
    }
    let _ = writer.close().await;
}

async fn serve_stream_socket(
    socket: TcpStream,
    recorded: Arc<Recorded>,
    config: Arc<MockRuntimeConfig>,
) {
    let ws = match tokio_tungstenite::accept_async(socket).await {
        Ok(ws) => ws,
        Err(err) => {
            tracing::debug!(error = %err, "mock stream handshake failed");
            return;
        }
    };
    let (mut writer, mut reader) = ws.split();
    if config.stream_not_ready
        && writer
            .send(Message::Text(NOT_READY.to_string()))
            .await
            .is_err()
    {
        return;
    }
    for chunk in &config.stream_chunks {
        if writer.send(Message::Binary(chunk.clone())).await.is_err() {
            return;
        }
    }
    if config.stream_not_ready {
        while let Some(Ok(message)) = reader.next().await {
            if let Message::Text(_) = message {
                recorded.stream_texts.fetch_add(1, Ordering::SeqCst);
            }
        }
        return;
    }
    let _ = writer.send(Message::Close(None)).await;
}

/// Renders a solid frame payload for the requested mode. Sizes are clamped
/// to `MAX_FRAME_DIMENSION`.
pub fn render_frame(mode: CaptureMode, width: u32, height: u32) -> Vec<u8> {
    let width = width.min(MAX_FRAME_DIMENSION);
    let height = height.min(MAX_FRAME_DIMENSION);
    let header = FrameHeader {
        width,
        height,
        bits_per_pixel: 32,
        color_buffer_size: width * height * 4,
        ..FrameHeader::default()
    };
    if mode.is_jpeg() {
        let image =
            image::RgbImage::from_pixel(width.max(1), height.max(1), image::Rgb([200, 30, 30]));
        let mut out = Cursor::new(Vec::new());
        if image::DynamicImage::ImageRgb8(image)
            .write_to(&mut out, image::ImageFormat::Jpeg)
            .is_ok()
        {
            return Frame::encode(header, mode, out.get_ref());
        }
    }
    let pixels = [200u8, 30, 30, 255].repeat((width * height) as usize);
    Frame::encode(header, CaptureMode::StreamedUncompressed, &pixels)
}
