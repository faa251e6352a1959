//! Error taxonomy and JSON responses for the deploy API

use crate::deploy::{ConflictReport, DeployStage};
use crate::engine::EngineError;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Error kinds that cross the API boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Malformed headers or payload
    Validation,
    /// Chunk or transfer failed an integrity check
    TransferIntegrity,
    /// A container already owns the derived name
    Conflict,
    /// Container engine failure
    Engine,
    /// Container engine call exceeded its deadline
    Timeout,
    /// Start failed and the created container could not be confirmed removed
    RollbackFailed,
    /// Route store failure
    Persistence,
    /// Missing or wrong bearer token
    Unauthorized,
    /// Unknown resource
    NotFound,
    /// Anything else
    Internal,
}

impl ErrorKind {
    /// Get the error code as a string for the X-Deploy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::TransferIntegrity => "TRANSFER_INTEGRITY",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Engine => "ENGINE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RollbackFailed => "ROLLBACK_FAILED",
            ErrorKind::Persistence => "PERSISTENCE",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Internal => "INTERNAL",
        }
    }
}

/// Why a chunk or a transfer was rejected
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntegrityFailure {
    #[error("chunk {chunk} is empty")]
    EmptyChunk { chunk: u32 },

    #[error("chunk {chunk} declared {declared} bytes but carried {actual}")]
    ChunkSizeMismatch { chunk: u32, declared: u64, actual: u64 },

    #[error("chunk {chunk} is outside 0..{total_chunks}")]
    ChunkOutOfRange { chunk: u32, total_chunks: u32 },

    #[error("chunk metadata disagrees with the transfer in progress: {0}")]
    MetadataMismatch(String),

    #[error("chunk {chunk} would bring the buffered transfer to {buffered} bytes, more than the declared {declared}")]
    ExceedsDeclaredSize { chunk: u32, buffered: u64, declared: u64 },

    #[error("chunk {0} is missing")]
    MissingChunk(u32),

    #[error("assembled {actual} bytes but the transfer declared {expected}")]
    TotalSizeMismatch { expected: u64, actual: u64 },

    #[error("no transfer in progress; it was already assembled or has expired")]
    UnknownTransfer,
}

impl IntegrityFailure {
    /// Chunk-level rejections are the client's fault; assembly failures are ours
    ///
    /// A transfer that is gone by assembly time was claimed by a concurrent
    /// final chunk, so the late request gets a conflict.
    pub fn status_code(&self) -> StatusCode {
        match self {
            IntegrityFailure::EmptyChunk { .. }
            | IntegrityFailure::ChunkSizeMismatch { .. }
            | IntegrityFailure::ChunkOutOfRange { .. }
            | IntegrityFailure::MetadataMismatch(_)
            | IntegrityFailure::ExceedsDeclaredSize { .. } => StatusCode::BAD_REQUEST,
            IntegrityFailure::UnknownTransfer => StatusCode::CONFLICT,
            IntegrityFailure::MissingChunk(_) | IntegrityFailure::TotalSizeMismatch { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Every way a deploy request can fail
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("transfer {transfer_id}: {failure}")]
    Integrity {
        transfer_id: String,
        failure: IntegrityFailure,
    },

    #[error("container '{}' already exists ({})", .0.container_name, .0.state)]
    Conflict(Box<ConflictReport>),

    #[error("{stage} failed: {source}")]
    Engine {
        stage: DeployStage,
        source: EngineError,
    },

    #[error("container {container_id} failed to start: {source}")]
    StartFailed {
        container_id: String,
        source: EngineError,
        /// Container output captured before rollback
        logs: Option<String>,
    },

    #[error("container {container_id} could not be removed after '{cause}': {rollback_error}")]
    RollbackFailed {
        container_id: String,
        cause: String,
        rollback_error: String,
    },

    #[error("route store failure for {domain}: {reason}")]
    Persistence { domain: String, reason: String },

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeployError {
    pub fn integrity(transfer_id: impl Into<String>, failure: IntegrityFailure) -> Self {
        DeployError::Integrity {
            transfer_id: transfer_id.into(),
            failure,
        }
    }

    pub fn engine(stage: DeployStage, source: EngineError) -> Self {
        DeployError::Engine { stage, source }
    }

    pub fn persistence(domain: impl Into<String>, err: anyhow::Error) -> Self {
        DeployError::Persistence {
            domain: domain.into(),
            reason: format!("{:#}", err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            DeployError::Validation(_) => ErrorKind::Validation,
            DeployError::Integrity { .. } => ErrorKind::TransferIntegrity,
            DeployError::Conflict(_) => ErrorKind::Conflict,
            DeployError::Engine {
                source: EngineError::Timeout { .. },
                ..
            }
            | DeployError::StartFailed {
                source: EngineError::Timeout { .. },
                ..
            } => ErrorKind::Timeout,
            DeployError::Engine { .. } | DeployError::StartFailed { .. } => ErrorKind::Engine,
            DeployError::RollbackFailed { .. } => ErrorKind::RollbackFailed,
            DeployError::Persistence { .. } => ErrorKind::Persistence,
            DeployError::Unauthorized => ErrorKind::Unauthorized,
            DeployError::NotFound(_) => ErrorKind::NotFound,
            DeployError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            DeployError::Validation(_) => StatusCode::BAD_REQUEST,
            DeployError::Integrity { failure, .. } => failure.status_code(),
            DeployError::Conflict(_) => StatusCode::CONFLICT,
            DeployError::Unauthorized => StatusCode::UNAUTHORIZED,
            DeployError::NotFound(_) => StatusCode::NOT_FOUND,
            _ if self.kind() == ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// JSON body returned by every deploy endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResponse {
    pub success: bool,
    pub message: String,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(rename = "containerID", skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub running_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<String>,
}

impl DeployResponse {
    pub fn ok(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            status_code: status.as_u16(),
            ..Default::default()
        }
    }

    pub fn from_error(err: &DeployError) -> Self {
        let mut response = Self {
            success: false,
            message: err.to_string(),
            status_code: err.status_code().as_u16(),
            ..Default::default()
        };

        if let DeployError::Conflict(report) = err {
            response.domain = Some(report.domain.clone());
            response.container_id = Some(report.container_id.clone());
            response.container_name = Some(report.container_name.clone());
            response.state = Some(report.state.clone());
            response.running_time = Some(report.running_time.clone());
            response.ports = Some(report.ports.clone());
        }

        response
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"success":{},"message":"{}","statusCode":{}}}"#,
                self.success,
                self.message.replace('\"', "\\\""),
                self.status_code
            )
        })
    }
}

/// Build an HTTP response carrying a [`DeployResponse`]
pub fn json_response(body: &DeployResponse) -> Response<Full<Bytes>> {
    let status = StatusCode::from_u16(body.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_json())))
        .expect("valid response with StatusCode enum and static header")
}

/// Build an error response with the X-Deploy-Error header set
pub fn json_error_response(err: &DeployError) -> Response<Full<Bytes>> {
    let body = DeployResponse::from_error(err);
    let mut response = json_response(&body);
    response.headers_mut().insert(
        "x-deploy-error",
        hyper::header::HeaderValue::from_static(err.kind().as_header_value()),
    );
    response
}
