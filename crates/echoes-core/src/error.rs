//! Error types shared by the `Echoes` configuration layer.

use thiserror::Error;

/// Result type alias using `Echoes` Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types for `Echoes` operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn settings_parse_failure_converts_to_json_error() {
        let err: Error = serde_json::from_str::<crate::Config>("{ not json")
            .map_err(Error::from)
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
        assert!(err.to_string().starts_with("JSON error:"));
    }

    #[test]
    fn missing_settings_file_converts_to_io_error() {
        let err: Error = std::fs::read_to_string("/nonexistent/echoes/settings.json")
            .map_err(Error::from)
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
