use std::io;

/// Error taxonomy shared by every pipeline stage.
///
/// `Transient` is the only retryable category; everything else surfaces to
/// the caller unchanged. `Unavailable` marks optional collaborators
/// (type-checker, linter, summary LLM) that are absent; the surrounding
/// operation still succeeds with a degraded result.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("parse error in {file} (line {line}): {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type CoreResult<T> = Result<T, CoreError>;

impl CoreError {
    pub fn parse(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }

    /// Whether the in-component retry loop should take another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Stable category label for structured results and logs.
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::InvalidInput(_) => "invalid_input",
            Self::Parse { .. } => "parse_error",
            Self::Transient(_) => "transient",
            Self::Unavailable(_) => "unavailable",
            Self::Conflict(_) => "conflict",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<io::Error> for CoreError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(err.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::Interrupted => {
                Self::Transient(err.to_string())
            }
            _ => Self::Internal(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidInput(err.to_string())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: CoreError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert_eq!(err.category(), "not_found");
        assert!(!err.is_transient());
    }

    #[test]
    fn only_transient_is_retryable() {
        assert!(CoreError::Transient("rate limit".into()).is_transient());
        assert!(!CoreError::Unavailable("no linter".into()).is_transient());
        assert!(!CoreError::Conflict("hunk moved".into()).is_transient());
    }
}
