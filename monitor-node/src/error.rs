use thiserror::Error;

#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Connect error: {0}")]
    ConnectError(String),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Encode error: {0}")]
    EncodeError(String),

    #[error("Inference transport error: {0}")]
    InferenceTransient(String),

    #[error("Inference parse error: {0}")]
    InferenceParse(String),

    #[error("Inference timeout after {0}s")]
    InferenceTimeout(u64),

    #[error("Store error: {0}")]
    StoreError(String),

    #[error("Control bridge error: {0}")]
    ControlBridgeError(String),

    #[error("Client error: {0}")]
    ClientError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

impl MonitorError {
    /// Stable kind label used in logs, persisted records and WS error
    /// messages.
    pub fn kind(&self) -> &'static str {
        match self {
            MonitorError::ConfigError(_) => "config",
            MonitorError::ConnectError(_) => "connect",
            MonitorError::ProtocolError(_) => "protocol",
            MonitorError::EncodeError(_) => "encode",
            MonitorError::InferenceTransient(_) => "inference_transient",
            MonitorError::InferenceParse(_) => "inference_parse",
            MonitorError::InferenceTimeout(_) => "timeout",
            MonitorError::StoreError(_) => "store",
            MonitorError::ControlBridgeError(_) => "control_bridge",
            MonitorError::ClientError(_) => "client",
            MonitorError::IoError(_) => "io",
            MonitorError::SerializationError(_) => "serialization",
        }
    }

    /// Only configuration failures (and reader budget exhaustion, handled by
    /// the reader itself) terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, MonitorError::ConfigError(_))
    }
}

impl From<reqwest::Error> for MonitorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            MonitorError::InferenceTimeout(0)
        } else {
            MonitorError::InferenceTransient(error.to_string())
        }
    }
}

impl From<image::ImageError> for MonitorError {
    fn from(error: image::ImageError) -> Self {
        MonitorError::EncodeError(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MonitorError>;
