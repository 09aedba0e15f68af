use thiserror::Error;

pub type Result<T> = std::result::Result<T, ShareError>;

#[derive(Error, Debug)]
pub enum ShareError {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Authentication failure: {0}")]
    AuthenticationFailure(String),

    #[error("Chunk integrity failure: {file_id}#{index}")]
    ChunkIntegrityFailure { file_id: String, index: u32 },

    #[error("No candidate peer holds {file_id}#{index}")]
    NoCandidatePeer { file_id: String, index: u32 },

    #[error("Download timed out: {0}")]
    DownloadTimeout(String),

    #[error("Incomplete file {file_id}: missing chunk {missing}")]
    IncompleteFile { file_id: String, missing: u32 },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Invalid session transition: {0}")]
    InvalidTransition(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ShareError {
    /// Errors that end a download and are reported to the application.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ShareError::DownloadTimeout(_)
                | ShareError::FileNotFound(_)
                | ShareError::IncompleteFile { .. }
        )
    }
}

impl From<std::io::Error> for ShareError {
    fn from(err: std::io::Error) -> Self {
        ShareError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for ShareError {
    fn from(err: serde_json::Error) -> Self {
        ShareError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_download_ending_errors_are_terminal() {
        assert!(ShareError::DownloadTimeout("f".into()).is_terminal());
        assert!(ShareError::FileNotFound("f".into()).is_terminal());
        assert!(ShareError::IncompleteFile {
            file_id: "f".into(),
            missing: 2
        }
        .is_terminal());

        assert!(!ShareError::NetworkError("unreachable".into()).is_terminal());
        assert!(!ShareError::NoCandidatePeer {
            file_id: "f".into(),
            index: 0
        }
        .is_terminal());
    }

    #[test]
    fn test_io_errors_convert() {
        let err: ShareError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();
        assert!(matches!(err, ShareError::IoError(ref msg) if msg.contains("disk full")));
    }
}
