//! Viewer side of render-gateway: the streaming engine that talks to a
//! runtime's control and viewport sockets, plus the gateway client and the
//! session driver that keeps a viewer attached across engine restarts.

pub mod cli;
pub mod client;
pub mod engine;
pub mod input;
pub mod session;
pub mod stats;

pub use client::{ClientError, GatewayClient, SessionInfo};
pub use engine::{
    DecodedFrame, EngineConfig, EngineError, EngineEvent, EngineHandle, EngineState,
    EngineTarget, ViewportSink,
};
pub use session::{DriverConfig, DriverError, DriverReport, SessionDriver, SessionTarget, StopReason};
pub use stats::{FrameStats, QualityTier, StatsSnapshot};
