use thiserror::Error;

/// All errors produced by counsel-core.
#[derive(Debug, Error)]
pub enum CounselError {
    /// No microphone, permission denied, or the device refused the stream.
    #[error("audio input device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("no API key configured")]
    CredentialMissing,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Corrupt transport data (bad base64, odd PCM byte count).
    #[error("malformed input: {0}")]
    MalformedInput(String),

    /// Mid-session failure reported by the remote service.
    #[error("remote error: {0}")]
    RemoteError(String),

    #[error("audio output error: {0}")]
    Output(String),

    #[error("session is already active")]
    AlreadyActive,

    #[error("chat request failed: {0}")]
    Chat(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CounselError {
    /// Errors the user can recover from by pressing start again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CounselError::DeviceUnavailable(_)
                | CounselError::ConnectionFailed(_)
                | CounselError::CredentialMissing
                | CounselError::RemoteError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CounselError>;
