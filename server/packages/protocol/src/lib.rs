//! Wire protocol shared by the gateway, the viewer and spawned runtimes.
//!
//! Two channels exist per running runtime: a JSON control channel addressed at
//! the console port, and a viewport channel carrying frames. The viewport
//! channel is either the request/response frame exchange on
//! `/viewportserver` or a pushed elementary stream on a derived port.

pub mod channel;
pub mod control;
pub mod elementary;
pub mod frame;
pub mod input;
pub mod script;
#[cfg(feature = "test-utils")]
pub mod testing;

pub use channel::{ChannelError, ControlChannel, ControlEvent};
pub use control::{ConsoleMessage, ControlRequest, IS_READY};
pub use elementary::ElementaryStreamReassembler;
pub use frame::{
    CaptureMode, CaptureOptions, DctMethod, Frame, FrameError, FrameHeader, FrameRequest,
    StreamControl, FRAME_HEADER_LEN, NOT_READY,
};
pub use input::{InputEvent, InputType};

/// Path of the frame request/response endpoint on the console port.
pub const VIEWPORT_PATH: &str = "/viewportserver";

/// Offset from the console port to the elementary-stream port.
pub const STREAM_PORT_OFFSET: u16 = 1000;

/// Default request timeout on the control channel.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

pub fn console_url(host: &str, console_port: u16) -> String {
    format!("ws://{host}:{console_port}")
}

pub fn viewport_url(host: &str, console_port: u16) -> String {
    format!("ws://{host}:{console_port}{VIEWPORT_PATH}")
}

pub fn stream_url(host: &str, stream_port: u16) -> String {
    format!("ws://{host}:{stream_port}/")
}

pub fn stream_port_for(console_port: u16) -> u16 {
    console_port.saturating_add(STREAM_PORT_OFFSET)
}
