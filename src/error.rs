use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetlogError {
    #[error("Interface discovery failed: {0}")]
    Discovery(String),

    #[error("Network interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("Failed to start capture on {interface}: {reason}")]
    CaptureStart { interface: String, reason: String },

    #[error("Capture failed on {interface}: {reason}")]
    Capture { interface: String, reason: String },

    #[error("Event sink error: {0}")]
    Sink(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Failed to bind metrics server to {address}: {source}")]
    MetricsBind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl NetlogError {
    pub fn capture(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::Capture {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }

    pub fn capture_start(interface: impl Into<String>, reason: impl ToString) -> Self {
        Self::CaptureStart {
            interface: interface.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, NetlogError>;
