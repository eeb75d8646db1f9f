//! Error types for the MCP server.

use thiserror::Error;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// MCP server errors.
#[derive(Error, Debug)]
pub enum Error {
    /// JSON-RPC protocol error.
    #[error("JSON-RPC error: {code} - {message}")]
    JsonRpc {
        /// Error code.
        code: i32,
        /// Error message.
        message: String,
    },

    /// Tool not found.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// Invalid parameters.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// The automation context (browser process) could not be acquired.
    #[error("browser launch failed: {0}")]
    BrowserLaunch(String),

    /// A page-level automation call failed.
    #[error("browser error: {0}")]
    Browser(String),

    /// Navigation failed.
    #[error("navigation to {url} failed: {message}")]
    Navigation {
        /// Target URL.
        url: String,
        /// Failure reason.
        message: String,
    },

    /// An operation exceeded its time budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Data session missing or expired.
    #[error("data session not found: {0}")]
    SessionNotFound(String),

    /// Persisted data entry missing.
    #[error("data entry not found: {0}")]
    EntryNotFound(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Blocking task failed to complete.
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Get the JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            Error::JsonRpc { code, .. } => *code,
            Error::ToolNotFound(_) => codes::METHOD_NOT_FOUND,
            Error::InvalidParams(_) => codes::INVALID_PARAMS,
            Error::BrowserLaunch(_) => -32000,
            Error::Browser(_) | Error::Navigation { .. } => -32001,
            Error::Timeout(_) => -32003,
            Error::SessionNotFound(_) | Error::EntryNotFound(_) => -32004,
            Error::Serialization(_) => codes::PARSE_ERROR,
            Error::Io(_) => -32002,
            Error::Join(_) | Error::Internal(_) => codes::INTERNAL_ERROR,
        }
    }

    /// Convert to JSON-RPC error response.
    pub fn to_json_rpc_error(&self) -> serde_json::Value {
        serde_json::json!({
            "code": self.code(),
            "message": self.to_string(),
        })
    }
}

impl From<chromiumoxide::error::CdpError> for Error {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        Error::Browser(err.to_string())
    }
}

/// Standard JSON-RPC error codes.
pub mod codes {
    /// Parse error.
    pub const PARSE_ERROR: i32 = -32700;
    /// Invalid request.
    pub const INVALID_REQUEST: i32 = -32600;
    /// Method not found.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_json_rpc() {
        assert_eq!(Error::ToolNotFound("x".into()).code(), -32601);
        assert_eq!(Error::InvalidParams("x".into()).code(), -32602);
        assert_eq!(Error::Internal("x".into()).code(), -32603);
    }

    #[test]
    fn json_rpc_error_carries_message() {
        let err = Error::SessionNotFound("abc".into());
        let value = err.to_json_rpc_error();
        assert_eq!(value["code"], -32004);
        assert_eq!(value["message"], "data session not found: abc");
    }
}
