use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("path {} already exists", .0.display())]
    AlreadyExists(PathBuf),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("Unknown {kind} event: {event}")]
    UnknownEvent { kind: String, event: String },
    #[error("path {} is outside the workspace root", .0.display())]
    OutsideSandbox(PathBuf),
    #[error("destination {} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("Unsupported language server: {0}")]
    UnsupportedLanguageServer(String),
    #[error("terminal {0} not found")]
    TerminalNotFound(String),
    #[error("failed to spawn pty: {0}")]
    PtySpawn(String),
    #[error("failed to start '{command}': {message}")]
    ProcessSpawn { command: String, message: String },
    #[error("'{command}' exited: {status}")]
    ProcessExited { command: String, status: String },
    #[error("proxy reload '{command}' failed: {message}")]
    ReloadFailed { command: String, message: String },
    #[error("invalid search pattern: {0}")]
    Pattern(#[from] regex::Error),
    #[error("glob expansion failed: {0}")]
    Glob(String),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = match self {
            BridgeError::NotFound(_) | BridgeError::TerminalNotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::AlreadyExists(_) => StatusCode::CONFLICT,
            BridgeError::InvalidRequest(_)
            | BridgeError::UnknownEvent { .. }
            | BridgeError::NotADirectory(_)
            | BridgeError::UnsupportedLanguageServer(_)
            | BridgeError::Pattern(_)
            | BridgeError::Json(_) => StatusCode::BAD_REQUEST,
            BridgeError::OutsideSandbox(_) => StatusCode::FORBIDDEN,
            BridgeError::ReloadFailed { .. }
            | BridgeError::ProcessSpawn { .. }
            | BridgeError::ProcessExited { .. } => StatusCode::BAD_GATEWAY,
            BridgeError::PtySpawn(_) | BridgeError::Glob(_) | BridgeError::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let code = match status.as_u16() {
            400 => "bad_request",
            403 => "forbidden",
            404 => "not_found",
            409 => "conflict",
            502 => "command_failed",
            _ => "internal_error",
        }
        .to_string();

        let body = ErrorBody {
            code,
            message: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
