use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FieldcamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Parameter error: {0}")]
    Params(#[from] ParamsError),

    #[error("System error: {message}")]
    System { message: String },

    #[error("Component error in {component}: {message}")]
    Component { component: String, message: String },
}

/// Camera device errors. All of them end the current capture cycle only.
#[derive(Error, Debug, Clone)]
pub enum CameraError {
    #[error("Failed to open camera device {device}: {details}")]
    OpenFailed { device: String, details: String },

    #[error("Failed to read frame from camera: {details}")]
    ReadFailed { details: String },

    #[error("Camera frame timeout after {timeout:?}")]
    FrameTimeout { timeout: Duration },

    #[error("Camera configuration error: {details}")]
    Configuration { details: String },
}

#[derive(Error, Debug, Clone)]
pub enum AnalyzerError {
    #[error("Frame processing failed: {details}")]
    FrameProcessing { details: String },

    #[error("Frame {index} is {actual:?}, reference is {expected:?}")]
    DimensionMismatch {
        index: usize,
        expected: (u32, u32),
        actual: (u32, u32),
    },
}

/// Disk, permission and log store failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreation {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {path}: {details}")]
    Write { path: String, details: String },

    #[error("Failed to relocate {from} to {to}: {details}")]
    Relocation {
        from: String,
        to: String,
        details: String,
    },

    #[error("Relocation target already exists: {path}")]
    DestinationExists { path: String },

    #[error("Log store error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Timed out after {timeout:?} waiting for the log store lock")]
    LockTimeout { timeout: Duration },

    #[error("Storage IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network or remote-side rejection. Recovered through the uplink backoff.
#[derive(Error, Debug, Clone)]
pub enum DeliveryError {
    #[error("Transport error: {details}")]
    Transport { details: String },

    #[error("Remote rejected request with status {status}")]
    Rejected { status: u16 },

    #[error("Request timed out")]
    Timeout,
}

#[derive(Error, Debug, Clone)]
pub enum ParamsError {
    #[error("Configuration unavailable: {details}")]
    ConfigUnavailable { details: String },

    #[error("Invalid parameter document: {details}")]
    Invalid { details: String },
}

impl FieldcamError {
    pub fn system<S: Into<String>>(message: S) -> Self {
        Self::System {
            message: message.into(),
        }
    }

    pub fn component<S: Into<String>>(component: S, message: S) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    /// Whether the node should keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            FieldcamError::Config(_) => false,
            FieldcamError::Camera(_)
            | FieldcamError::Delivery(_)
            | FieldcamError::Params(_)
            | FieldcamError::Storage(_)
            | FieldcamError::Analyzer(_) => true,
            FieldcamError::Io(_) => true,
            FieldcamError::System { .. } => false,
            FieldcamError::Component { .. } => true,
        }
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout
        } else if let Some(status) = e.status() {
            DeliveryError::Rejected {
                status: status.as_u16(),
            }
        } else {
            DeliveryError::Transport {
                details: e.to_string(),
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, FieldcamError>;
