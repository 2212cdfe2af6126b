use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use render_gateway_error::{ErrorType, GatewayError, ProblemDetails};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{Modify, OpenApi, ToSchema};

use crate::packages::{AppDescriptor, AppKind, AppLinks, PackageStore};
use crate::session_manager::{
    RuntimeConfig, Session, SessionLinks, SessionManager, SessionManagerConfig, SessionPorts,
};

mod types;

pub use types::*;

const UPLOAD_LIMIT_BYTES: usize = 1 << 30;

#[derive(Debug)]
pub struct AppState {
    session_manager: SessionManager,
}

impl AppState {
    /// Must be called inside a tokio runtime.
    pub fn new(
        packages: PackageStore,
        runtime: RuntimeConfig,
        config: SessionManagerConfig,
    ) -> Self {
        Self {
            session_manager: SessionManager::new(packages, runtime, config),
        }
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut router = Router::new()
        .route("/", get(get_root))
        .route("/version", get(get_version))
        .route("/openapi.json", get(get_openapi))
        .route("/apps", get(list_apps))
        .route("/app/:name", get(get_app))
        .route(
            "/upload",
            post(upload_package).layer(DefaultBodyLimit::max(UPLOAD_LIMIT_BYTES)),
        )
        .route("/run/:name", get(run_app))
        .route("/processes", get(list_processes))
        .route("/process/:pid", get(get_process))
        .route("/process/:pid/keep-a-live", post(keep_alive))
        .fallback(not_found)
        .with_state(shared.clone());

    let http_logging = match std::env::var("RENDER_GATEWAY_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::debug!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Kills every runtime the gateway started.
pub async fn shutdown_sessions(state: &Arc<AppState>) {
    state.session_manager.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_version,
        list_apps,
        get_app,
        upload_package,
        run_app,
        list_processes,
        get_process,
        keep_alive
    ),
    components(
        schemas(
            AppDescriptor,
            AppKind,
            AppLinks,
            Session,
            SessionPorts,
            SessionLinks,
            UploadForm,
            VersionResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "apps", description = "Installed packages"),
        (name = "processes", description = "Runtime sessions")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Gateway(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

const SERVER_INFO: &str = "\
This is a render gateway. Available endpoints:\n\
  - GET  /apps                      - Installed applications\n\
  - POST /upload                    - Install a package archive\n\
  - GET  /run/:name                 - Start a runtime session\n\
  - GET  /processes                 - Running sessions\n\
  - POST /process/:pid/keep-a-live  - Extend a session\n";

async fn get_root() -> &'static str {
    SERVER_INFO
}

async fn not_found() -> (StatusCode, String) {
    (
        StatusCode::NOT_FOUND,
        format!("404 Not Found\n\n{SERVER_INFO}"),
    )
}

#[utoipa::path(
    get,
    path = "/version",
    responses((status = 200, body = VersionResponse)),
    tag = "meta"
)]
async fn get_version() -> Json<VersionResponse> {
    Json(VersionResponse::current())
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/apps",
    responses((status = 200, body = [AppDescriptor])),
    tag = "apps"
)]
async fn list_apps(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<AppDescriptor>>, ApiError> {
    let manager = state.session_manager.clone();
    let apps = tokio::task::spawn_blocking(move || manager.list_applications())
        .await
        .map_err(join_error)?;
    Ok(Json(apps))
}

#[utoipa::path(
    get,
    path = "/app/{name}",
    responses(
        (status = 200, body = AppDescriptor),
        (status = 404, body = ProblemDetails)
    ),
    params(("name" = String, Path, description = "Application name")),
    tag = "apps"
)]
async fn get_app(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<AppDescriptor>, ApiError> {
    let manager = state.session_manager.clone();
    let app = tokio::task::spawn_blocking(move || manager.get_application(&name))
        .await
        .map_err(join_error)??;
    Ok(Json(app))
}

#[utoipa::path(
    post,
    path = "/upload",
    request_body(content = UploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, body = AppDescriptor),
        (status = 400, body = ProblemDetails),
        (status = 417, body = ProblemDetails)
    ),
    tag = "apps"
)]
async fn upload_package(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<AppDescriptor>, ApiError> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field.file_name().unwrap_or_default().to_string();
        let bytes = field.bytes().await.map_err(multipart_error)?;
        upload = Some((file_name, bytes));
        break;
    }
    let (file_name, bytes) = upload.ok_or_else(|| GatewayError::InvalidRequest {
        message: "missing multipart field `file`".to_string(),
    })?;

    let packages = state.session_manager.packages().clone();
    let app = tokio::task::spawn_blocking(move || packages.install_archive(&file_name, &bytes))
        .await
        .map_err(join_error)?
        .inspect_err(|err| tracing::warn!(error = %err, "package rejected"))?;
    tracing::info!(app = %app.name, kind = app.kind.as_str(), "package installed");
    Ok(Json(app))
}

/// A launch that got as far as spawning answers 424 with the session, so the
/// caller still learns the pid.
#[utoipa::path(
    get,
    path = "/run/{name}",
    responses(
        (status = 200, body = Session),
        (status = 404, body = ProblemDetails),
        (status = 424, body = Session, description = "Spawned but never became ready")
    ),
    params(("name" = String, Path, description = "Application name")),
    tag = "processes"
)]
async fn run_app(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    let outcome = state.session_manager.run_application(&name).await?;
    let status = match &outcome.launch_error {
        None => StatusCode::OK,
        Some(_) => StatusCode::FAILED_DEPENDENCY,
    };
    Ok((status, Json(outcome.session)).into_response())
}

#[utoipa::path(
    get,
    path = "/processes",
    responses((status = 200, body = [Session])),
    tag = "processes"
)]
async fn list_processes(State(state): State<Arc<AppState>>) -> Json<Vec<Session>> {
    Json(state.session_manager.list_sessions().await)
}

#[utoipa::path(
    get,
    path = "/process/{pid}",
    responses(
        (status = 200, body = Session),
        (status = 404, body = ProblemDetails)
    ),
    params(("pid" = u32, Path, description = "Runtime process id")),
    tag = "processes"
)]
async fn get_process(
    State(state): State<Arc<AppState>>,
    Path(pid): Path<u32>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.session_manager.refresh_session(pid).await?))
}

#[utoipa::path(
    post,
    path = "/process/{pid}/keep-a-live",
    responses(
        (status = 200, body = Session),
        (status = 404, body = ProblemDetails)
    ),
    params(("pid" = u32, Path, description = "Runtime process id")),
    tag = "processes"
)]
async fn keep_alive(
    State(state): State<Arc<AppState>>,
    Path(pid): Path<u32>,
) -> Result<Json<Session>, ApiError> {
    Ok(Json(state.session_manager.keep_alive(pid).await?))
}

fn join_error(err: tokio::task::JoinError) -> GatewayError {
    GatewayError::Io {
        message: err.to_string(),
    }
}

fn multipart_error(err: axum::extract::multipart::MultipartError) -> GatewayError {
    GatewayError::InvalidRequest {
        message: err.body_text(),
    }
}
