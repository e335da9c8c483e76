#![forbid(unsafe_code)]

//! Error taxonomy shared by the job manager, the metadata resolver and the
//! HTTP layer.

use std::io;

use serde::Serialize;
use thiserror::Error;

/// Coarse classification used for status codes and client-facing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    ServerBusy,
    UpstreamUnavailable,
    Timeout,
    ProcessFailure,
    Filesystem,
}

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("{0}")]
    InvalidInput(String),

    #[error("Server busy")]
    ServerBusy,

    #[error("media unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("timed out after {0}s")]
    Timeout(u64),

    #[error("download failed: {0}")]
    ProcessFailure(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::ServerBusy => ErrorKind::ServerBusy,
            Self::UpstreamUnavailable(_) => ErrorKind::UpstreamUnavailable,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::ProcessFailure(_) => ErrorKind::ProcessFailure,
            Self::Filesystem(_) => ErrorKind::Filesystem,
        }
    }

    /// Message shown to end users. Process failures hide the raw tool output.
    pub fn user_message(&self) -> String {
        match self {
            Self::InvalidInput(message) => message.clone(),
            Self::ServerBusy => "Server busy".to_string(),
            Self::UpstreamUnavailable(_) => {
                "This video is unavailable (private, removed or restricted)".to_string()
            }
            Self::Timeout(_) => "Download timed out".to_string(),
            Self::ProcessFailure(_) => "Failed to download media".to_string(),
            Self::Filesystem(_) => "Internal server error".to_string(),
        }
    }

    /// Permanent failures are never worth retrying.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::UpstreamUnavailable(_) | Self::ServerBusy
        )
    }
}

impl From<io::Error> for FetchError {
    fn from(err: io::Error) -> Self {
        Self::Filesystem(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
