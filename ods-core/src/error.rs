use thiserror::Error;

#[derive(Debug, Error)]
pub enum OdsError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("registration conflict: {0}")]
    RegistrationConflict(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("chunk {index} failed hash verification: expected {expected}, got {actual}")]
    ChunkHashFailure {
        index: u32,
        expected: String,
        actual: String,
    },

    #[error("package {filename} failed hash verification: expected {expected}, got {actual}")]
    PackageHashFailure {
        filename: String,
        expected: String,
        actual: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("cipher error: {0}")]
    Cipher(String),

    #[error("package not found: {0}")]
    PackageNotFound(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OdsError {
    /// Errors a sync job may retry under its attempt budget.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ChunkHashFailure { .. } | Self::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, OdsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let chunk = OdsError::ChunkHashFailure {
            index: 1,
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert!(chunk.is_transient());
        assert!(OdsError::Transport("connection reset".to_string()).is_transient());
        assert!(!OdsError::Authentication("bad token".to_string()).is_transient());
        assert!(
            !OdsError::PackageHashFailure {
                filename: "a.pkg".to_string(),
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            }
            .is_transient()
        );
    }
}
