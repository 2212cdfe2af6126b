//! Thin HTTP client for the gateway's run / process endpoints.

use render_gateway_error::ProblemDetails;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error("gateway answered {status}{}", problem_suffix(.problem))]
    Gateway {
        status: StatusCode,
        problem: Option<ProblemDetails>,
    },
}

impl ClientError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Gateway { status, .. } => Some(*status),
            Self::Http(err) => err.status(),
            Self::Url(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }
}

fn problem_suffix(problem: &Option<ProblemDetails>) -> String {
    match problem {
        Some(problem) => match &problem.detail {
            Some(detail) => format!(": {detail}"),
            None => format!(": {}", problem.title),
        },
        None => String::new(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPorts {
    pub console: u16,
    pub stream: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLinks {
    pub info: String,
    pub view: String,
    pub cmd: String,
}

/// A runtime session as the gateway reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub app_name: String,
    pub pid: u32,
    pub ports: SessionPorts,
    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub keep_alive_deadline: u64,
    pub ready: bool,
    pub links: SessionLinks,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppLinks {
    pub info: String,
    pub run: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub links: AppLinks,
}

#[derive(Debug, Clone)]
pub struct GatewayClient {
    base: Url,
    http: reqwest::Client,
}

impl GatewayClient {
    pub fn new(base: &str) -> Result<Self, ClientError> {
        Ok(Self {
            base: Url::parse(base)?,
            http: reqwest::Client::new(),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn app(&self, name: &str) -> Result<AppInfo, ClientError> {
        let response = self.http.get(self.endpoint(&format!("app/{name}"))?).send().await?;
        read_json(response).await
    }

    /// Starts a runtime for `name`. A session that spawned but never came up
    /// (424) is still returned, with `ready` false.
    pub async fn run(&self, name: &str) -> Result<SessionInfo, ClientError> {
        let response = self.http.get(self.endpoint(&format!("run/{name}"))?).send().await?;
        if response.status() == StatusCode::FAILED_DEPENDENCY {
            return Ok(response.json().await?);
        }
        read_json(response).await
    }

    /// Current session state, re-probed by the gateway.
    pub async fn process(&self, pid: u32) -> Result<SessionInfo, ClientError> {
        let response = self.http.get(self.endpoint(&format!("process/{pid}"))?).send().await?;
        read_json(response).await
    }

    pub async fn processes(&self) -> Result<Vec<SessionInfo>, ClientError> {
        let response = self.http.get(self.endpoint("processes")?).send().await?;
        read_json(response).await
    }

    pub async fn keep_alive(&self, pid: u32) -> Result<SessionInfo, ClientError> {
        let response = self
            .http
            .post(self.endpoint(&format!("process/{pid}/keep-a-live"))?)
            .send()
            .await?;
        read_json(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        let base = self.base.as_str().trim_end_matches('/');
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let problem = response.json::<ProblemDetails>().await.ok();
    Err(ClientError::Gateway { status, problem })
}
