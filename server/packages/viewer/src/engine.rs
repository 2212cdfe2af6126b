//! Viewer side of a session: brings up the control channel, opens the
//! viewport socket and paces frames one request at a time while batching
//! input back to the runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use render_gateway_protocol::script::set_resolution;
use render_gateway_protocol::{
    console_url, stream_port_for, stream_url, viewport_url, CaptureMode, CaptureOptions,
    ChannelError, ConsoleMessage, ControlChannel, ControlEvent, ElementaryStreamReassembler,
    Frame, FrameError, FrameRequest, InputEvent, StreamControl, NOT_READY,
};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::input::InputBatcher;

type ViewportWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

const EVENT_CAPACITY: usize = 256;
/// Input batches waiting on the console socket before flushes are skipped.
const INPUT_QUEUE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disconnected,
    ControlConnecting,
    AwaitingReady,
    ViewportConnecting,
    Streaming,
    Closed,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Budget for opening the control socket and for the `is-ready` reply.
    pub ready_timeout: Duration,
    pub not_ready_retry: Duration,
    pub input_flush: Duration,
    pub resize_debounce: Duration,
    /// Longest a resize waits while more keep arriving.
    pub resize_recheck: Duration,
    pub reconnect_delay: Duration,
    pub capture_mode: CaptureMode,
    pub capture_options: CaptureOptions,
    pub handle: u32,
    pub script_namespace: String,
    /// Viewport size announced as soon as streaming starts.
    pub initial_size: Option<(u32, u32)>,
    /// Consecutive failed control bring-ups before giving up. `None` retries
    /// forever.
    pub max_control_attempts: Option<u32>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let capture_mode = CaptureMode::StreamedCompressed;
        Self {
            ready_timeout: Duration::from_millis(1000),
            not_ready_retry: Duration::ZERO,
            input_flush: Duration::from_millis(30),
            resize_debounce: Duration::from_millis(50),
            resize_recheck: Duration::from_millis(100),
            reconnect_delay: Duration::from_millis(100),
            capture_mode,
            capture_options: CaptureOptions::defaults_for(capture_mode),
            handle: 1,
            script_namespace: "stingray".to_string(),
            initial_size: None,
            max_control_attempts: None,
        }
    }
}

impl EngineConfig {
    pub fn with_capture_mode(mut self, mode: CaptureMode) -> Self {
        self.capture_mode = mode;
        self.capture_options = CaptureOptions::defaults_for(mode);
        self
    }
}

/// Where a runtime listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineTarget {
    pub host: String,
    pub console_port: u16,
    pub stream_port: u16,
}

impl EngineTarget {
    pub fn new(host: impl Into<String>, console_port: u16) -> Self {
        Self {
            host: host.into(),
            console_port,
            stream_port: stream_port_for(console_port),
        }
    }

    pub fn with_stream_port(mut self, stream_port: u16) -> Self {
        self.stream_port = stream_port;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Log { message: String },
    Unsolicited(Value),
    FrameDropped { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
    /// Size of the frame as received, header included.
    pub payload_len: usize,
}

/// Receives what the engine pulls off the viewport socket.
pub trait ViewportSink: Send + 'static {
    fn render(&mut self, frame: DecodedFrame);

    /// One reassembled elementary-stream unit.
    fn unit(&mut self, unit: Vec<u8>) {
        let _ = unit;
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("control channel unavailable after {attempts} attempts")]
    ControlUnavailable { attempts: u32 },
    #[error("viewport connection to {url} failed: {reason}")]
    ViewportConnect { url: String, reason: String },
    #[error("viewport stream failed: {0}")]
    Viewport(String),
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("failed to decode frame: {0}")]
    Decode(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("engine task failed: {0}")]
    Join(String),
}

#[derive(Debug)]
enum EngineCommand {
    Input(InputEvent),
    BrowserButton { down: bool, button: u8 },
    Resize { width: u32, height: u32 },
    Script(String),
    Command(String),
    Close,
}

/// Owner side of a running engine. Dropping it closes the engine.
#[derive(Debug)]
pub struct EngineHandle {
    commands: mpsc::UnboundedSender<EngineCommand>,
    state: watch::Receiver<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    task: JoinHandle<Result<(), EngineError>>,
}

impl EngineHandle {
    pub fn spawn<S: ViewportSink>(target: EngineTarget, config: EngineConfig, sink: S) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(EngineState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let pending_size = config.initial_size;
        let task = EngineTask {
            target,
            config,
            sink,
            state: state_tx,
            events: events.clone(),
            batcher: InputBatcher::new(),
            pending_size,
            announced_size: None,
            next_frame_id: 0,
        };
        let task = tokio::spawn(task.run(command_rx));
        Self {
            commands,
            state,
            events,
            task,
        }
    }

    pub fn state(&self) -> EngineState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<EngineState> {
        self.state.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Resolves with true once `wanted` is reached, or false if the engine
    /// closed first.
    pub async fn wait_for_state(&self, wanted: EngineState) -> bool {
        let mut state = self.state.clone();
        state
            .wait_for(|state| *state == wanted || *state == EngineState::Closed)
            .await
            .map(|state| *state == wanted)
            .unwrap_or(false)
    }

    pub fn input(&self, event: InputEvent) {
        self.send(EngineCommand::Input(event));
    }

    pub fn browser_button(&self, down: bool, button: u8) {
        self.send(EngineCommand::BrowserButton { down, button });
    }

    pub fn resize(&self, width: u32, height: u32) {
        self.send(EngineCommand::Resize { width, height });
    }

    pub fn script(&self, script: impl Into<String>) {
        self.send(EngineCommand::Script(script.into()));
    }

    /// `#name arg1 arg2` style console command.
    pub fn command(&self, line: impl Into<String>) {
        self.send(EngineCommand::Command(line.into()));
    }

    pub fn close(&self) {
        self.send(EngineCommand::Close);
    }

    pub async fn join(self) -> Result<(), EngineError> {
        self.task
            .await
            .map_err(|err| EngineError::Join(err.to_string()))?
    }

    fn send(&self, command: EngineCommand) {
        if self.commands.send(command).is_err() {
            tracing::debug!("engine already closed");
        }
    }
}

enum StreamEnd {
    ControlLost,
    Closed,
}

type Connected = (ControlChannel, broadcast::Receiver<ControlEvent>);

struct EngineTask<S> {
    target: EngineTarget,
    config: EngineConfig,
    sink: S,
    state: watch::Sender<EngineState>,
    events: broadcast::Sender<EngineEvent>,
    batcher: InputBatcher,
    pending_size: Option<(u32, u32)>,
    announced_size: Option<(u32, u32)>,
    next_frame_id: u64,
}

impl<S: ViewportSink> EngineTask<S> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<EngineCommand>) -> Result<(), EngineError> {
        let result = self.drive(&mut commands).await;
        if let Err(err) = &result {
            tracing::warn!(
                port = self.target.console_port,
                error = %err,
                "viewer engine stopped"
            );
        }
        self.set_state(EngineState::Closed);
        result
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<EngineCommand>) -> Result<(), EngineError> {
        let mut backlog = Vec::new();
        loop {
            let Some((control, control_events)) = self.connect_control(commands, &mut backlog).await?
            else {
                return Ok(());
            };
            let backlog = std::mem::take(&mut backlog);
            match self.stream(control, control_events, commands, backlog).await? {
                StreamEnd::ControlLost => {
                    tracing::info!(port = self.target.console_port, "control channel lost, reconnecting");
                    self.pending_size = self.announced_size.take().or(self.pending_size);
                }
                StreamEnd::Closed => return Ok(()),
            }
        }
    }

    /// Loops connect + `is-ready` until it succeeds. `None` means the engine
    /// was closed meanwhile.
    async fn connect_control(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<EngineCommand>,
        backlog: &mut Vec<EngineCommand>,
    ) -> Result<Option<Connected>, EngineError> {
        let url = console_url(&self.target.host, self.target.console_port);
        let mut failures = 0u32;
        loop {
            self.set_state(EngineState::ControlConnecting);
            let outcome = {
                let attempt = open_control(&url, self.config.ready_timeout, &self.state);
                tokio::pin!(attempt);
                loop {
                    tokio::select! {
                        result = &mut attempt => break Some(result),
                        command = commands.recv() => match command {
                            None | Some(EngineCommand::Close) => break None,
                            Some(command) => backlog.push(command),
                        },
                    }
                }
            };

            let err = match outcome {
                None => return Ok(None),
                Some(Ok(connected)) => return Ok(Some(connected)),
                Some(Err(err)) => err,
            };
            failures += 1;
            tracing::debug!(url = %url, failures, error = %err, "control bring-up failed");
            if let Some(max) = self.config.max_control_attempts {
                if failures >= max {
                    return Err(EngineError::ControlUnavailable { attempts: failures });
                }
            }

            let delay = sleep(self.config.reconnect_delay);
            tokio::pin!(delay);
            loop {
                tokio::select! {
                    () = &mut delay => break,
                    command = commands.recv() => match command {
                        None | Some(EngineCommand::Close) => return Ok(None),
                        Some(command) => backlog.push(command),
                    },
                }
            }
        }
    }

    async fn stream(
        &mut self,
        control: ControlChannel,
        mut control_events: broadcast::Receiver<ControlEvent>,
        commands: &mut mpsc::UnboundedReceiver<EngineCommand>,
        mut backlog: Vec<EngineCommand>,
    ) -> Result<StreamEnd, EngineError> {
        self.set_state(EngineState::ViewportConnecting);
        let elementary = self.config.capture_mode == CaptureMode::ElementaryStream;
        let url = if elementary {
            stream_url(&self.target.host, self.target.stream_port)
        } else {
            viewport_url(&self.target.host, self.target.console_port)
        };

        let connect = tokio_tungstenite::connect_async(url.as_str());
        tokio::pin!(connect);
        let socket = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok((socket, _)) => break socket,
                    Err(err) => {
                        control.close().await;
                        return Err(EngineError::ViewportConnect {
                            url: url.clone(),
                            reason: err.to_string(),
                        });
                    }
                },
                command = commands.recv() => match command {
                    None | Some(EngineCommand::Close) => {
                        control.close().await;
                        return Ok(StreamEnd::Closed);
                    }
                    Some(command) => backlog.push(command),
                },
            }
        };
        let (mut writer, mut reader) = socket.split();
        let control = Arc::new(control);
        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE);
        let input_writer = tokio::spawn(write_input(Arc::clone(&control), input_rx));
        self.set_state(EngineState::Streaming);
        tracing::info!(url = %url, "viewport connected");

        let mut outstanding = false;
        if !elementary {
            let options = StreamControl::Options {
                mode: self.config.capture_mode,
                options: self.config.capture_options,
            };
            send_json(&mut writer, &options).await?;
        }
        self.announce_resize(&control, &mut writer).await?;
        for command in backlog {
            self.apply(command, &control, &mut writer).await?;
        }
        if !elementary {
            self.request_frame(&mut writer).await?;
            outstanding = true;
        }

        let mut reassembler = ElementaryStreamReassembler::new();
        let mut flush = tokio::time::interval(self.config.input_flush);
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let retry = sleep(Duration::ZERO);
        tokio::pin!(retry);
        let mut retry_armed = false;
        let resize_timer = sleep(Duration::ZERO);
        tokio::pin!(resize_timer);
        let mut resize_started: Option<Instant> = None;

        loop {
            tokio::select! {
                () = control.closed() => {
                    let _ = writer.close().await;
                    self.finish_units(&mut reassembler);
                    return Ok(StreamEnd::ControlLost);
                }
                event = control_events.recv() => match event {
                    Ok(event) => self.forward(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "control events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        let _ = writer.close().await;
                        self.finish_units(&mut reassembler);
                        return Ok(StreamEnd::ControlLost);
                    }
                },
                message = reader.next() => match message {
                    Some(Ok(Message::Binary(payload))) => {
                        if elementary {
                            for unit in reassembler.push(&payload) {
                                self.sink.unit(unit);
                            }
                        } else {
                            outstanding = false;
                            self.render(&payload);
                            self.request_frame(&mut writer).await?;
                            outstanding = true;
                        }
                    }
                    Some(Ok(Message::Text(text))) if text == NOT_READY => {
                        outstanding = false;
                        // the stream port never takes frame requests
                        if !elementary {
                            retry.as_mut().reset(Instant::now() + self.config.not_ready_retry);
                            retry_armed = true;
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        tracing::debug!(message = %text, "ignoring viewport text");
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        self.finish_units(&mut reassembler);
                        control.close().await;
                        tracing::info!(url = %url, "viewport closed");
                        return Ok(StreamEnd::Closed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        self.finish_units(&mut reassembler);
                        control.close().await;
                        return Err(EngineError::Viewport(err.to_string()));
                    }
                },
                () = &mut retry, if retry_armed => {
                    retry_armed = false;
                    if !outstanding {
                        self.request_frame(&mut writer).await?;
                        outstanding = true;
                    }
                }
                _ = flush.tick() => self.flush_input(&input_tx),
                () = &mut resize_timer, if resize_started.is_some() => {
                    resize_started = None;
                    self.announce_resize(&control, &mut writer).await?;
                    if !elementary && !outstanding {
                        retry_armed = false;
                        self.request_frame(&mut writer).await?;
                        outstanding = true;
                    }
                }
                command = commands.recv() => match command {
                    None | Some(EngineCommand::Close) => {
                        self.flush_input(&input_tx);
                        drop(input_tx);
                        let _ = input_writer.await;
                        let _ = writer.close().await;
                        control.close().await;
                        return Ok(StreamEnd::Closed);
                    }
                    Some(EngineCommand::Resize { width, height }) => {
                        self.pending_size = Some((width, height));
                        let now = Instant::now();
                        let started = *resize_started.get_or_insert(now);
                        let deadline = (now + self.config.resize_debounce)
                            .min(started + self.config.resize_recheck);
                        resize_timer.as_mut().reset(deadline);
                    }
                    Some(command) => self.apply(command, &control, &mut writer).await?,
                },
            }
        }
    }

    async fn apply(
        &mut self,
        command: EngineCommand,
        control: &ControlChannel,
        writer: &mut ViewportWriter,
    ) -> Result<(), EngineError> {
        match command {
            EngineCommand::Input(event) => {
                self.batcher.push(event);
            }
            EngineCommand::BrowserButton { down, button } => {
                self.batcher.push_browser_button(down, button);
            }
            EngineCommand::Resize { width, height } => {
                self.pending_size = Some((width, height));
                self.announce_resize(control, writer).await?;
            }
            EngineCommand::Script(script) => {
                notify(control, &ConsoleMessage::script(script)).await;
            }
            EngineCommand::Command(line) => match ConsoleMessage::parse_command(&line) {
                Some(message) => notify(control, &message).await,
                None => tracing::warn!(line = %line, "empty console command"),
            },
            EngineCommand::Close => {}
        }
        Ok(())
    }

    async fn request_frame(&mut self, writer: &mut ViewportWriter) -> Result<(), EngineError> {
        self.next_frame_id += 1;
        let request = FrameRequest {
            id: format!("frame-{}", self.next_frame_id),
            mode: self.config.capture_mode,
            handle: self.config.handle,
            options: self.config.capture_options,
        };
        send_json(writer, &request).await
    }

    /// Tells the runtime about the latest requested size, once.
    async fn announce_resize(
        &mut self,
        control: &ControlChannel,
        writer: &mut ViewportWriter,
    ) -> Result<(), EngineError> {
        let Some((width, height)) = self.pending_size.take() else {
            return Ok(());
        };
        if self.announced_size == Some((width, height)) {
            return Ok(());
        }
        self.announced_size = Some((width, height));
        tracing::debug!(width, height, "announcing viewport size");
        let script = set_resolution(&self.config.script_namespace, width, height);
        notify(control, &ConsoleMessage::script(script)).await;
        send_json(writer, &StreamControl::Resize { width, height }).await
    }

    /// Hands the queued input to the writer task. While the writer is backed
    /// up the events stay in the batcher for a later tick.
    fn flush_input(&mut self, input: &mpsc::Sender<String>) {
        if self.batcher.is_empty() {
            return;
        }
        let Ok(permit) = input.try_reserve() else {
            tracing::trace!(queued = self.batcher.len(), "input writer busy");
            return;
        };
        match self.batcher.flush_script(&self.config.script_namespace) {
            Ok(Some(script)) => permit.send(script),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "dropping input batch"),
        }
    }

    fn render(&mut self, payload: &[u8]) {
        match decode_frame(payload, self.config.capture_mode) {
            Ok(frame) => self.sink.render(frame),
            Err(err) => {
                tracing::debug!(error = %err, "dropping frame");
                let _ = self.events.send(EngineEvent::FrameDropped {
                    reason: err.to_string(),
                });
            }
        }
    }

    fn finish_units(&mut self, reassembler: &mut ElementaryStreamReassembler) {
        if let Some(unit) = reassembler.finish() {
            self.sink.unit(unit);
        }
    }

    fn forward(&self, event: ControlEvent) {
        let event = match event {
            ControlEvent::Log { message } => {
                tracing::debug!(message = %message, "runtime log");
                EngineEvent::Log { message }
            }
            ControlEvent::Unsolicited(value) => EngineEvent::Unsolicited(value),
        };
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: EngineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!(from = ?previous, to = ?state, "engine state");
        }
    }
}

async fn open_control(
    url: &str,
    timeout: Duration,
    state: &watch::Sender<EngineState>,
) -> Result<Connected, ChannelError> {
    let channel = ControlChannel::connect_with_timeout(url, timeout).await?;
    let events = channel.subscribe();
    state.send_replace(EngineState::AwaitingReady);
    if let Err(err) = channel.handshake(timeout).await {
        channel.close().await;
        return Err(err);
    }
    Ok((channel, events))
}

async fn notify(control: &ControlChannel, message: &ConsoleMessage) {
    if let Err(err) = control.notify(message).await {
        tracing::debug!(error = %err, "console message not sent");
    }
}

async fn write_input(control: Arc<ControlChannel>, mut batches: mpsc::Receiver<String>) {
    while let Some(script) = batches.recv().await {
        notify(&control, &ConsoleMessage::script(script)).await;
    }
}

async fn send_json<T: Serialize>(writer: &mut ViewportWriter, value: &T) -> Result<(), EngineError> {
    let text = serde_json::to_string(value).map_err(|err| EngineError::Viewport(err.to_string()))?;
    writer
        .send(Message::Text(text))
        .await
        .map_err(|err| EngineError::Viewport(err.to_string()))
}

/// Parses a viewport payload and turns it into RGBA pixels.
pub fn decode_frame(payload: &[u8], mode: CaptureMode) -> Result<DecodedFrame, EngineError> {
    let frame = Frame::parse(payload, mode)?;
    if mode.is_jpeg() {
        let image = image::load_from_memory_with_format(frame.pixels, image::ImageFormat::Jpeg)
            .map_err(|err| EngineError::Decode(err.to_string()))?
            .to_rgba8();
        return Ok(DecodedFrame {
            width: image.width(),
            height: image.height(),
            rgba: image.into_raw(),
            payload_len: payload.len(),
        });
    }
    Ok(DecodedFrame {
        width: frame.header.width,
        height: frame.header.height,
        rgba: frame.pixels.to_vec(),
        payload_len: payload.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use render_gateway_protocol::FrameHeader;

    #[test]
    fn raw_frames_decode_to_pixels() {
        let header = FrameHeader {
            width: 2,
            height: 1,
            bits_per_pixel: 32,
            color_buffer_size: 8,
            ..FrameHeader::default()
        };
        let payload = Frame::encode(header, CaptureMode::StreamedUncompressed, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let frame = decode_frame(&payload, CaptureMode::StreamedUncompressed).expect("decode");
        assert_eq!((frame.width, frame.height), (2, 1));
        assert_eq!(frame.rgba, vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(frame.payload_len, payload.len());
    }

    #[test]
    fn broken_jpeg_is_a_decode_error() {
        let header = FrameHeader {
            width: 2,
            height: 1,
            ..FrameHeader::default()
        };
        let payload = Frame::encode(header, CaptureMode::StreamedCompressed, b"not a jpeg");
        assert!(matches!(
            decode_frame(&payload, CaptureMode::StreamedCompressed),
            Err(EngineError::Decode(_))
        ));
        assert!(matches!(
            decode_frame(&[0u8; 4], CaptureMode::StreamedCompressed),
            Err(EngineError::Frame(FrameError::TooShort { .. }))
        ));
    }

    #[test]
    fn target_derives_stream_port() {
        let target = EngineTarget::new("127.0.0.1", 16050);
        assert_eq!(target.stream_port, 17050);
        assert_eq!(target.with_stream_port(9).stream_port, 9);
    }

    #[test]
    fn default_config_requests_fast_jpeg() {
        let config = EngineConfig::default();
        assert_eq!(config.capture_mode, CaptureMode::StreamedCompressed);
        assert_eq!(config.capture_options.quality, Some(90));
        assert_eq!(config.input_flush, Duration::from_millis(30));
        let raw = config.with_capture_mode(CaptureMode::StreamedUncompressed);
        assert_eq!(raw.capture_options, CaptureOptions::default());
    }
}
