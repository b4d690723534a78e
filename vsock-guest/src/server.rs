//! HTTP routes for the exec service.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use thiserror::Error;
use tracing::{error, warn};
use vsock_proto::{
    EXEC_PATH, ErrorBody, ExecRequest, ExecResponse, ProtocolError, STATUS_PATH, SYSINFO_PATH,
    StatusResponse, WS_EXEC_PATH,
};

use crate::error::{ExecError, SysinfoError};
use crate::exec::ExecService;
use crate::session;
use crate::sysinfo::{self, SystemInfo};

#[derive(Clone)]
struct AppState {
    exec: ExecService,
}

/// Build the service router.
pub fn router(service: ExecService) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status))
        .route(SYSINFO_PATH, get(system_info))
        .route(EXEC_PATH, post(exec))
        .route(WS_EXEC_PATH, get(exec_session))
        .with_state(AppState { exec: service })
}

/// Error returned by a handler, rendered as `{"error": "..."}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request body: {0}")]
    InvalidBody(#[source] serde_json::Error),

    #[error("command cannot be empty")]
    EmptyCommand,

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error(transparent)]
    Sysinfo(#[from] SysinfoError),
}

impl From<ProtocolError> for ApiError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Json(e) => Self::InvalidBody(e),
            ProtocolError::EmptyCommand => Self::EmptyCommand,
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InvalidBody(_) | Self::EmptyCommand | Self::Exec(ExecError::EmptyCommand) => {
                StatusCode::BAD_REQUEST
            }
            Self::Exec(_) | Self::Sysinfo(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "request failed");
        } else {
            warn!(error = %self, "rejected request");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn status() -> Json<StatusResponse> {
    Json(StatusResponse::ok())
}

async fn system_info() -> Result<Json<SystemInfo>, ApiError> {
    let info = tokio::task::spawn_blocking(sysinfo::collect)
        .await
        .map_err(SysinfoError::from)??;
    Ok(Json(info))
}

/// The body is taken as raw bytes so that malformed JSON maps to our own
/// 400 body instead of the extractor's rejection.
async fn exec(State(state): State<AppState>, body: Bytes) -> Result<Json<ExecResponse>, ApiError> {
    let request = ExecRequest::from_json(&body)?;
    let response = state.exec.execute(request.cmd).await?;
    Ok(Json(response))
}

async fn exec_session(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| session::serve_websocket(socket, state.exec))
}
