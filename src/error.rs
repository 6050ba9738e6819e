//! Crate-level error type.
//!
//! Every fallible operation in the engine, the stores and the HTTP surface
//! returns [`EngineError`]. The variants map one-to-one onto how a caller
//! should react: client errors (`Validation`, `NotFound`, `InvalidAction`)
//! are never retried, `Persistence` may be retried as a whole operation.

use thiserror::Error;

/// Errors surfaced by the experiment engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Missing or malformed required input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The referenced experiment does not exist.
    #[error("experiment not found: {id}")]
    NotFound { id: String },

    /// Unrecognized status action, or one the state machine forbids.
    #[error("invalid action '{action}': {reason}")]
    InvalidAction { action: String, reason: String },

    /// Underlying store read/write failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Configuration could not be loaded or is out of range.
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub(crate) fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub(crate) fn not_found(id: impl Into<String>) -> Self {
        EngineError::NotFound { id: id.into() }
    }

    pub(crate) fn invalid_action(action: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidAction { action: action.into(), reason: reason.into() }
    }

    /// `true` for errors caused by the caller's input.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            EngineError::Validation(_)
                | EngineError::NotFound { .. }
                | EngineError::InvalidAction { .. }
        )
    }

    /// HTTP status code used when the error crosses the web boundary.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_) | EngineError::InvalidAction { .. } => 400,
            EngineError::NotFound { .. } => 404,
            EngineError::Persistence(_) | EngineError::Config(_) | EngineError::Io(_) => 500,
        }
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Persistence(format!("payload encoding: {e}"))
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_classified() {
        assert!(EngineError::validation("x").is_client_error());
        assert!(EngineError::not_found("abc").is_client_error());
        assert!(EngineError::invalid_action("jump", "unknown").is_client_error());
        assert!(!EngineError::Persistence("disk".into()).is_client_error());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(EngineError::validation("x").http_status(), 400);
        assert_eq!(EngineError::invalid_action("a", "b").http_status(), 400);
        assert_eq!(EngineError::not_found("x").http_status(), 404);
        assert_eq!(EngineError::Persistence("x".into()).http_status(), 500);
    }

    #[test]
    fn test_display_includes_context() {
        let e = EngineError::invalid_action("jump", "unknown action");
        assert_eq!(e.to_string(), "invalid action 'jump': unknown action");
        let e = EngineError::not_found("exp-1");
        assert_eq!(e.to_string(), "experiment not found: exp-1");
    }

    #[test]
    fn test_rusqlite_error_maps_to_persistence() {
        let e: EngineError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, EngineError::Persistence(_)));
    }
}
