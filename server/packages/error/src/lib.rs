use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnknownApplication,
    SessionNotFound,
    InvalidPackage,
    UnsupportedKind,
    SpawnFailed,
    NoExecutableFound,
    ProbeTimeout,
    RequestTimeout,
    ConnectionLost,
    ProtocolError,
    Io,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:render-gateway:error:invalid_request",
            Self::UnknownApplication => "urn:render-gateway:error:unknown_application",
            Self::SessionNotFound => "urn:render-gateway:error:session_not_found",
            Self::InvalidPackage => "urn:render-gateway:error:invalid_package",
            Self::UnsupportedKind => "urn:render-gateway:error:unsupported_kind",
            Self::SpawnFailed => "urn:render-gateway:error:spawn_failed",
            Self::NoExecutableFound => "urn:render-gateway:error:no_executable_found",
            Self::ProbeTimeout => "urn:render-gateway:error:probe_timeout",
            Self::RequestTimeout => "urn:render-gateway:error:request_timeout",
            Self::ConnectionLost => "urn:render-gateway:error:connection_lost",
            Self::ProtocolError => "urn:render-gateway:error:protocol_error",
            Self::Io => "urn:render-gateway:error:io",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnknownApplication => "Unknown Application",
            Self::SessionNotFound => "Session Not Found",
            Self::InvalidPackage => "Invalid Package",
            Self::UnsupportedKind => "Unsupported Application Kind",
            Self::SpawnFailed => "Spawn Failed",
            Self::NoExecutableFound => "No Executable Found",
            Self::ProbeTimeout => "Probe Timeout",
            Self::RequestTimeout => "Request Timeout",
            Self::ConnectionLost => "Connection Lost",
            Self::ProtocolError => "Protocol Error",
            Self::Io => "I/O Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnknownApplication => 404,
            Self::SessionNotFound => 404,
            Self::InvalidPackage => 417,
            Self::UnsupportedKind => 400,
            Self::SpawnFailed => 500,
            Self::NoExecutableFound => 500,
            Self::ProbeTimeout => 504,
            Self::RequestTimeout => 504,
            Self::ConnectionLost => 502,
            Self::ProtocolError => 502,
            Self::Io => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unknown application: {app}")]
    UnknownApplication { app: String },
    #[error("session not found: {pid}")]
    SessionNotFound { pid: u32 },
    #[error("{reason}")]
    InvalidPackage { reason: String },
    #[error("application {app} of kind {kind} has no runtime process")]
    UnsupportedKind { app: String, kind: String },
    #[error("failed to spawn `{executable}`: {message}")]
    SpawnFailed { executable: String, message: String },
    #[error("no single executable found for {app} ({candidates} candidates)")]
    NoExecutableFound { app: String, candidates: usize },
    #[error("port {port} did not open after {attempts} attempts")]
    ProbeTimeout { port: u16, attempts: u32 },
    #[error("request `{request}` timed out")]
    RequestTimeout { request: String },
    #[error("connection lost: {message}")]
    ConnectionLost { message: String },
    #[error("protocol error: {message}")]
    ProtocolError { message: String },
    #[error("io error: {message}")]
    Io { message: String },
}

impl GatewayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnknownApplication { .. } => ErrorType::UnknownApplication,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::InvalidPackage { .. } => ErrorType::InvalidPackage,
            Self::UnsupportedKind { .. } => ErrorType::UnsupportedKind,
            Self::SpawnFailed { .. } => ErrorType::SpawnFailed,
            Self::NoExecutableFound { .. } => ErrorType::NoExecutableFound,
            Self::ProbeTimeout { .. } => ErrorType::ProbeTimeout,
            Self::RequestTimeout { .. } => ErrorType::RequestTimeout,
            Self::ConnectionLost { .. } => ErrorType::ConnectionLost,
            Self::ProtocolError { .. } => ErrorType::ProtocolError,
            Self::Io { .. } => ErrorType::Io,
        }
    }

    /// Bring-up failures that leave the session registered but not ready.
    pub fn is_transient_launch_failure(&self) -> bool {
        matches!(
            self,
            Self::ProbeTimeout { .. } | Self::RequestTimeout { .. } | Self::ConnectionLost { .. }
        )
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));

        let mut extensions = Map::new();
        match self {
            Self::UnknownApplication { app } => {
                extensions.insert("app".to_string(), Value::String(app.clone()));
            }
            Self::SessionNotFound { pid } => {
                extensions.insert("pid".to_string(), Value::from(*pid));
            }
            Self::UnsupportedKind { app, kind } => {
                extensions.insert("app".to_string(), Value::String(app.clone()));
                let mut details = Map::new();
                details.insert("kind".to_string(), Value::String(kind.clone()));
                extensions.insert("details".to_string(), Value::Object(details));
            }
            Self::SpawnFailed { executable, .. } => {
                let mut details = Map::new();
                details.insert(
                    "executable".to_string(),
                    Value::String(executable.clone()),
                );
                extensions.insert("details".to_string(), Value::Object(details));
            }
            Self::NoExecutableFound { app, candidates } => {
                extensions.insert("app".to_string(), Value::String(app.clone()));
                let mut details = Map::new();
                details.insert("candidates".to_string(), Value::from(*candidates));
                extensions.insert("details".to_string(), Value::Object(details));
            }
            Self::ProbeTimeout { port, attempts } => {
                let mut details = Map::new();
                details.insert("port".to_string(), Value::from(*port));
                details.insert("attempts".to_string(), Value::from(*attempts));
                extensions.insert("details".to_string(), Value::Object(details));
            }
            Self::InvalidRequest { .. }
            | Self::InvalidPackage { .. }
            | Self::RequestTimeout { .. }
            | Self::ConnectionLost { .. }
            | Self::ProtocolError { .. }
            | Self::Io { .. } => {}
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(value: std::io::Error) -> Self {
        Self::Io {
            message: value.to_string(),
        }
    }
}

impl From<GatewayError> for ProblemDetails {
    fn from(value: GatewayError) -> Self {
        value.to_problem_details()
    }
}

impl From<&GatewayError> for ProblemDetails {
    fn from(value: &GatewayError) -> Self {
        value.to_problem_details()
    }
}
