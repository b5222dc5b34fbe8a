//! Unified error handling for the hub gateway
//!
//! Every layer of the gateway (frame codec, serial link, mode manager, API)
//! converts its local error into [`HubError`] at the module boundary, so the
//! API server and the admin HTTP layer see one taxonomy.

use thiserror::Error;

// ============================================================================
// HubError - Main error type
// ============================================================================

/// Main error type for the hub gateway
#[derive(Debug, Error)]
pub enum HubError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // ======================================
    // Framing & Protocol Errors
    // ======================================
    /// Malformed, short or CRC-failing frame
    #[error("Frame error: {0}")]
    Frame(String),

    #[error("No response from {target} within {timeout_ms} ms")]
    ProtocolTimeout { target: String, timeout_ms: u64 },

    /// Router answered with one of its error codes
    #[error("Router {router} reported error code {code}")]
    RouterError { router: u8, code: u8 },

    /// Operation needs another bus mode than the current one
    #[error("Mode conflict: {operation} requires {required}, bus is in {current}")]
    ModeConflict {
        operation: String,
        required: String,
        current: String,
    },

    // ======================================
    // Validation Errors
    // ======================================
    /// Caller supplied value outside protocol bounds; message is user visible
    #[error("{0}")]
    ArgumentRange(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // ======================================
    // Link & Connection Errors
    // ======================================
    /// Underlying bus transport is gone, the current mode must be abandoned
    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    // ======================================
    // Resource Errors
    // ======================================
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    // ======================================
    // File & I/O Errors
    // ======================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // ======================================
    // Service & Runtime Errors
    // ======================================
    #[error("Service startup failed: {0}")]
    StartupFailed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using HubError
pub type HubResult<T> = Result<T, HubError>;

impl HubError {
    /// HTTP status code used by the admin API
    pub fn status_code(&self) -> u16 {
        match self {
            Self::ArgumentRange(_) | Self::Validation(_) | Self::Frame(_) => 400,

            Self::NotFound { .. } => 404,

            Self::AlreadyExists(_) | Self::ModeConflict { .. } => 409,

            Self::RouterError { .. }
            | Self::Transport(_)
            | Self::ConnectionFailed { .. } => 502,

            Self::LinkClosed(_) | Self::StartupFailed(_) => 503,

            Self::ProtocolTimeout { .. } => 504,

            Self::Configuration(_)
            | Self::InvalidConfig { .. }
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Internal(_) => 500,
        }
    }

    /// Link-level failure that requires the mode manager to reinitialize
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::LinkClosed(_))
    }
}

impl From<serde_json::Error> for HubError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

// Helper macros for creating errors
#[macro_export]
macro_rules! range_error {
    ($msg:expr) => {
        $crate::HubError::ArgumentRange($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::HubError::ArgumentRange(format!($fmt, $($arg)*))
    };
}

// ============================================================================
// HubError implements HubErrorTrait
// ============================================================================

impl HubErrorTrait for HubError {
    fn error_code(&self) -> &'static str {
        match self {
            // Configuration
            Self::Configuration(_) => "CONFIGURATION_ERROR",
            Self::InvalidConfig { .. } => "INVALID_CONFIG",

            // Framing & Protocol
            Self::Frame(_) => "FRAME_ERROR",
            Self::ProtocolTimeout { .. } => "PROTOCOL_TIMEOUT",
            Self::RouterError { .. } => "ROUTER_ERROR",
            Self::ModeConflict { .. } => "MODE_CONFLICT",

            // Validation
            Self::ArgumentRange(_) => "ARGUMENT_RANGE",
            Self::Validation(_) => "VALIDATION_ERROR",

            // Link
            Self::LinkClosed(_) => "LINK_CLOSED",
            Self::Transport(_) => "TRANSPORT_ERROR",
            Self::ConnectionFailed { .. } => "CONNECTION_FAILED",

            // Resources
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists(_) => "ALREADY_EXISTS",

            // File & I/O
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",

            // Service & Runtime
            Self::StartupFailed(_) => "STARTUP_FAILED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } => ErrorCategory::Configuration,

            Self::Frame(_) | Self::RouterError { .. } => ErrorCategory::Protocol,

            Self::ProtocolTimeout { .. } => ErrorCategory::Timeout,

            Self::ModeConflict { .. } => ErrorCategory::Conflict,

            Self::ArgumentRange(_) | Self::Validation(_) => ErrorCategory::Validation,

            Self::LinkClosed(_) | Self::Transport(_) | Self::ConnectionFailed { .. } => {
                ErrorCategory::Connection
            },

            Self::NotFound { .. } => ErrorCategory::NotFound,

            Self::AlreadyExists(_) => ErrorCategory::Conflict,

            Self::Io(_)
            | Self::Serialization(_)
            | Self::StartupFailed(_)
            | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

// ============================================================================
// Hub Error Trait - Architectural layer
// ============================================================================

/// Error category enum - used for classification and log levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    // Infrastructure layer
    Configuration,
    Timeout,

    // Request layer
    Validation,
    NotFound,
    Conflict,

    // Bus layer
    Protocol,
    Connection,

    // System level
    Internal,
}

/// Common capability interface for gateway error types
///
/// Module-local error enums (frame codec, transport) can implement this to get
/// the same retry and logging policy as [`HubError`] without being folded
/// into it early.
pub trait HubErrorTrait: std::error::Error + Send + Sync + 'static {
    /// Error code (for API, logs)
    fn error_code(&self) -> &'static str;

    /// Error category (for classification)
    fn category(&self) -> ErrorCategory;

    /// Whether the error is retryable (default implementation is category-based)
    fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Timeout)
    }

    /// Recommended retry delay in milliseconds
    fn retry_delay_ms(&self) -> u64 {
        match self.category() {
            ErrorCategory::Timeout => 500,
            ErrorCategory::Connection => 1500,
            _ => 0,
        }
    }

    /// Convert to HTTP status code
    #[cfg(feature = "axum-support")]
    fn http_status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self.category() {
            ErrorCategory::Configuration => StatusCode::BAD_REQUEST,
            ErrorCategory::Validation => StatusCode::UNPROCESSABLE_ENTITY,
            ErrorCategory::NotFound => StatusCode::NOT_FOUND,
            ErrorCategory::Conflict => StatusCode::CONFLICT,
            ErrorCategory::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorCategory::Connection => StatusCode::BAD_GATEWAY,
            ErrorCategory::Protocol | ErrorCategory::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert into an Axum HTTP response
    #[cfg(feature = "axum-support")]
    #[allow(clippy::disallowed_methods)] // json! macro internally uses unwrap (safe for known valid JSON)
    fn into_http_response(self) -> axum::response::Response
    where
        Self: Sized,
    {
        use axum::response::{IntoResponse, Json};
        use serde_json::json;

        (
            self.http_status(),
            Json(json!({
                "error_code": self.error_code(),
                "message": self.to_string(),
                "category": format!("{:?}", self.category()),
                "retryable": self.is_retryable(),
                "retry_delay_ms": self.retry_delay_ms(),
            })),
        )
            .into_response()
    }

    /// Log level for this error
    fn log_level(&self) -> tracing::Level {
        use tracing::Level;
        match self.category() {
            ErrorCategory::Internal => Level::ERROR,
            ErrorCategory::Validation | ErrorCategory::NotFound => Level::INFO,
            _ => Level::WARN,
        }
    }
}
