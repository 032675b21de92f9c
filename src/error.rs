//! Control-plane fault codes, JSON error bodies and the supervisor's error type

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fault codes returned by the control-plane RPC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RpcErrorCode {
    /// No program or route by that name
    BadName,
    /// Group already registered with an identical spec
    AlreadyAdded,
    /// Group cannot be removed while its process is alive
    StillRunning,
    /// Process is already starting or running
    AlreadyStarted,
    /// Process is not running
    NotRunning,
    /// Executable could not be spawned
    SpawnError,
    /// Process exited before its start window elapsed
    AbnormalTermination,
    /// Malformed query parameters
    BadArguments,
    /// Unknown or unsendable signal
    BadSignal,
    /// Configuration could not be reloaded
    Failed,
}

impl RpcErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RpcErrorCode::BadName => StatusCode::NOT_FOUND,
            RpcErrorCode::AlreadyAdded => StatusCode::CONFLICT,
            RpcErrorCode::StillRunning => StatusCode::CONFLICT,
            RpcErrorCode::AlreadyStarted => StatusCode::CONFLICT,
            RpcErrorCode::NotRunning => StatusCode::CONFLICT,
            RpcErrorCode::SpawnError => StatusCode::INTERNAL_SERVER_ERROR,
            RpcErrorCode::AbnormalTermination => StatusCode::INTERNAL_SERVER_ERROR,
            RpcErrorCode::BadArguments => StatusCode::BAD_REQUEST,
            RpcErrorCode::BadSignal => StatusCode::BAD_REQUEST,
            RpcErrorCode::Failed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value of the X-Control-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RpcErrorCode::BadName => "BAD_NAME",
            RpcErrorCode::AlreadyAdded => "ALREADY_ADDED",
            RpcErrorCode::StillRunning => "STILL_RUNNING",
            RpcErrorCode::AlreadyStarted => "ALREADY_STARTED",
            RpcErrorCode::NotRunning => "NOT_RUNNING",
            RpcErrorCode::SpawnError => "SPAWN_ERROR",
            RpcErrorCode::AbnormalTermination => "ABNORMAL_TERMINATION",
            RpcErrorCode::BadArguments => "BAD_ARGUMENTS",
            RpcErrorCode::BadSignal => "BAD_SIGNAL",
            RpcErrorCode::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_header_value())
    }
}

/// A fault raised by the control plane's program manager
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ControlError {
    pub code: RpcErrorCode,
    pub message: String,
}

impl ControlError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_name(name: &str) -> Self {
        Self::new(RpcErrorCode::BadName, format!("no such program: {}", name))
    }
}

/// JSON error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: RpcErrorCode,
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Control-Error header
pub fn json_error_response(code: RpcErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Control-Error", code.as_header_value())
        .body(Full::new(Bytes::from(error.to_json())))
        .expect("valid response with StatusCode enum and static headers")
}

impl From<ControlError> for Response<Full<Bytes>> {
    fn from(err: ControlError) -> Self {
        json_error_response(err.code, err.message)
    }
}

/// Errors surfaced by the supervisor and its RPC client
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The control plane never answered its startup probe
    #[error("control plane did not answer after {attempts} attempts: {last}")]
    Unreachable { attempts: u32, last: String },

    /// Socket or HTTP level failure talking to the control plane
    #[error("control plane transport error: {0}")]
    Transport(String),

    /// The control plane answered with a fault
    #[error("control plane fault {code}: {message}")]
    Fault { code: RpcErrorCode, message: String },

    #[error("failed to spawn control plane: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to write control plane configuration: {0:#}")]
    Config(anyhow::Error),
}

impl SupervisorError {
    /// The fault code when the control plane rejected the call
    pub fn fault_code(&self) -> Option<RpcErrorCode> {
        match self {
            SupervisorError::Fault { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Errors from one generation attempt
#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("cannot generate non-dynamic task '{0}'")]
    NotDynamic(String),

    #[error("generator exited with {0}")]
    ExitStatus(std::process::ExitStatus),

    #[error("malformed generator output: {0}")]
    MalformedOutput(#[from] serde_json::Error),

    #[error("generator output has no entry for '{0}'")]
    MissingOutput(String),

    #[error("generator didn't return any flags for '{0}'")]
    NoFlags(String),

    #[error("generator for '{task}' returned flag '{flag}' which clashes with a static one")]
    FlagClash { task: String, flag: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0:#}")]
    Database(anyhow::Error),

    /// A rolled-back generation, naming the whole group and the requester
    #[error("generator for [{}] failed for user '{requester}'", tasks.join(", "))]
    Failed {
        tasks: Vec<String>,
        requester: String,
        source: Box<GenerateError>,
    },
}

impl From<anyhow::Error> for GenerateError {
    fn from(err: anyhow::Error) -> Self {
        GenerateError::Database(err)
    }
}

impl GenerateError {
    /// The underlying cause of an aggregated failure
    pub fn root(&self) -> &GenerateError {
        match self {
            GenerateError::Failed { source, .. } => source.root(),
            other => other,
        }
    }
}

impl From<ErrorResponse> for SupervisorError {
    fn from(body: ErrorResponse) -> Self {
        SupervisorError::Fault {
            code: body.code,
            message: body.message,
        }
    }
}
