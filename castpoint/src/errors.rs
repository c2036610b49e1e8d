use thiserror::Error;

use castwire::{ApiOutbound, DeviceId, ErrorCode};

#[derive(Error, Debug)]
pub enum CastError {
    #[error("Cannot open a channel to {0}")]
    ConnectionError(DeviceId),
    #[error("Channel to {0} dropped with requests in flight")]
    ConnectionLost(DeviceId),
    #[error("Application launch was not confirmed in time")]
    LaunchTimeout,
    #[error("Session is not confirmed yet")]
    SessionNotReady,
    #[error("Content context is missing tab or frame identifiers")]
    InvalidContext,
    #[error("Instance {0} is not allowed to send '{1}'")]
    Forbidden(u64, String),
    #[error("Device {0} is not in the directory")]
    DeviceUnavailable(DeviceId),
    #[error("No session with id {0}")]
    InvalidSession(String),
    #[error("Instance has no attached session")]
    NoSession,
    #[error("Selection dialog closed without a choice")]
    SelectionCancelled,
    #[error("Collaborator channel is closed")]
    ChannelClosed,
}

impl CastError {
    pub fn forbidden(instance_id: u64, kind: &str) -> Self {
        CastError::Forbidden(instance_id, kind.to_string())
    }

    /// Wire error code this error surfaces as.
    pub fn code(&self) -> ErrorCode {
        match self {
            CastError::ConnectionError(_) => ErrorCode::SessionError,
            CastError::ConnectionLost(_) => ErrorCode::ChannelError,
            CastError::LaunchTimeout => ErrorCode::Timeout,
            CastError::SessionNotReady => ErrorCode::SessionError,
            CastError::InvalidContext => ErrorCode::InvalidParameter,
            CastError::Forbidden(_, _) => ErrorCode::Forbidden,
            CastError::DeviceUnavailable(_) => ErrorCode::ReceiverUnavailable,
            CastError::InvalidSession(_) => ErrorCode::SessionError,
            CastError::NoSession => ErrorCode::SessionError,
            CastError::SelectionCancelled => ErrorCode::Cancel,
            CastError::ChannelClosed => ErrorCode::ChannelError,
        }
    }

    /// Frame form of this error, for the instance that caused it.
    pub fn into_frame(self) -> ApiOutbound {
        ApiOutbound::Error {
            code: self.code(),
            description: Some(self.to_string()),
        }
    }
}
