use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
}

#[derive(thiserror::Error, Debug)]
pub enum ErrorKind {
    #[error("allocation error: {0}")]
    AllocationError(AllocationErrorKind),
    #[error("probe error: {0}")]
    ProbeError(ProbeErrorKind),
    #[error("bitrate error: {0}")]
    BitrateError(BitrateErrorKind),
    #[error("config error: {0}")]
    ConfigError(ConfigErrorKind),
    #[error("signaling error: {0}")]
    SignalingError(SignalingErrorKind),
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error(transparent)]
    JsonError(#[from] serde_json::Error),
    #[error(transparent)]
    QrCodeError(#[from] qrcode::types::QrError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum AllocationErrorKind {
    #[error("unknown tier")]
    UnknownTierError,
    #[error("insufficient bandwidth: required {required_mbps:.2} Mbps, available {available_mbps:.2} Mbps")]
    InsufficientBandwidthError {
        required_mbps: f64,
        available_mbps: f64,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeErrorKind {
    #[error("probe timeout")]
    ProbeTimeoutError,
    #[error("probe not started")]
    ProbeNotStartedError,
    #[error("probe already running")]
    ProbeAlreadyRunningError,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BitrateErrorKind {
    #[error("stale target")]
    StaleTargetError,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigErrorKind {
    #[error("invalid tier")]
    InvalidTierError,
    #[error("duplicate tier")]
    DuplicateTierError,
    #[error("invalid value")]
    InvalidValueError,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingErrorKind {
    #[error("stream not found")]
    StreamNotFoundError,
    #[error("streamer not found")]
    StreamerNotFoundError,
    #[error("connection not registered")]
    NotRegisteredError,
}

impl Error {
    pub fn new_allocation(message: String, kind: AllocationErrorKind) -> Self {
        Self {
            kind: ErrorKind::AllocationError(kind),
            message,
        }
    }

    pub fn new_probe(message: String, kind: ProbeErrorKind) -> Self {
        Self {
            kind: ErrorKind::ProbeError(kind),
            message,
        }
    }

    pub fn new_bitrate(message: String, kind: BitrateErrorKind) -> Self {
        Self {
            kind: ErrorKind::BitrateError(kind),
            message,
        }
    }

    pub fn new_config(message: String, kind: ConfigErrorKind) -> Self {
        Self {
            kind: ErrorKind::ConfigError(kind),
            message,
        }
    }

    pub fn new_signaling(message: String, kind: SignalingErrorKind) -> Self {
        Self {
            kind: ErrorKind::SignalingError(kind),
            message,
        }
    }

    /// Message suitable for showing to the client that triggered the error.
    pub fn client_message(&self) -> String {
        match &self.kind {
            ErrorKind::AllocationError(AllocationErrorKind::InsufficientBandwidthError {
                required_mbps,
                available_mbps,
            }) => format!(
                "Insufficient bandwidth: {:.1} Mbps required, {:.1} Mbps available",
                required_mbps, available_mbps
            ),
            _ => self.message.clone(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: ErrorKind::IoError(err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self {
            message: err.to_string(),
            kind: ErrorKind::JsonError(err),
        }
    }
}

impl From<qrcode::types::QrError> for Error {
    fn from(err: qrcode::types::QrError) -> Self {
        Self {
            message: err.to_string(),
            kind: ErrorKind::QrCodeError(err),
        }
    }
}

impl ResponseError for Error {
    fn status_code(&self) -> StatusCode {
        match &self.kind {
            ErrorKind::AllocationError(AllocationErrorKind::UnknownTierError) => {
                StatusCode::BAD_REQUEST
            }
            ErrorKind::AllocationError(_) => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::SignalingError(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.client_message() }))
    }
}
