use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use botgate_model::ApiMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port in range {first}-{last}")]
    NoPortAvailable { first: u16, last: u16 },
}

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Negotiation(#[from] PortError),

    /// The port passed negotiation but another process bound it first.
    #[error("port {port} was claimed before the server could bind it: {source}")]
    PortConflict {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("start was cancelled by a concurrent stop")]
    Cancelled,

    #[error("a previous server is still shutting down")]
    ShuttingDown,

    #[error("server task exited before reporting readiness")]
    ServerExited,

    #[error("internal error: {0}")]
    Internal(String),
}

impl StartError {
    pub fn is_port_conflict(&self) -> bool {
        matches!(self, StartError::PortConflict { .. })
    }
}

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("no bot with id {0}")]
    NotFound(String),

    #[error("console bot creation is disabled, bots cannot be started from the API")]
    ConsoleBotCreationDisabled,

    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log file name must be a bare file name")]
    InvalidName,

    #[error("log directory not found")]
    DirNotFound,

    #[error("log file {0} not found")]
    NotFound(String),

    #[error("failed to read logs: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error(transparent)]
    Log(#[from] LogError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Runner(RunnerError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Runner(_) => StatusCode::BAD_REQUEST,
            ApiError::Log(LogError::InvalidName) => StatusCode::BAD_REQUEST,
            ApiError::Log(LogError::DirNotFound | LogError::NotFound(_)) => StatusCode::NOT_FOUND,
            ApiError::Log(LogError::Io(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request rejected");
        }
        (status, Json(ApiMessage::failed(self.to_string()))).into_response()
    }
}
