use thiserror::Error;

/// Unified error type for the proxy fleet engine
#[derive(Error, Debug)]
pub enum FleetError {
    // Per-attempt errors
    #[error("connection failed: {0}")]
    ConnectError(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("proxy pool exhausted after {attempts} attempt(s){}", last_error_suffix(.last_error))]
    PoolExhausted {
        attempts: u32,
        last_error: Option<String>,
    },

    // Configuration errors
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for fleet operations
pub type Result<T> = std::result::Result<T, FleetError>;

fn last_error_suffix(last_error: &Option<String>) -> String {
    match last_error {
        Some(e) => format!(": last error: {}", e),
        None => String::new(),
    }
}

impl FleetError {
    /// Whether a fresh attempt (possibly through another proxy) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FleetError::ConnectError(_)
                | FleetError::Protocol(_)
                | FleetError::Timeout(_)
                | FleetError::Http(_)
                | FleetError::Io(_)
        )
    }

    /// Short category label, logged as the `category` field
    pub fn category(&self) -> &'static str {
        match self {
            FleetError::ConnectError(_) | FleetError::Io(_) => "connect",
            FleetError::Protocol(_) => "protocol",
            FleetError::Timeout(_) => "timeout",
            FleetError::PoolExhausted { .. } => "pool_exhausted",
            FleetError::InvalidConfig(_) => "config",
            FleetError::InvalidProxyAddress(_) | FleetError::InvalidRequest(_) => "request",
            FleetError::Http(_) => "http",
            FleetError::Internal(_) => "internal",
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for FleetError {
    fn from(err: hyper::Error) -> Self {
        FleetError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for FleetError {
    fn from(err: url::ParseError) -> Self {
        FleetError::InvalidRequest(err.to_string())
    }
}
