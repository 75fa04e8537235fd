use shared::{
    domain::CallStatus,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

use crate::transport::TransportError;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("access denied: {0}")]
    AccessDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("both transports failed: {0}")]
    Transport(String),
    #[error("illegal call transition {from} -> {to}")]
    IllegalTransition { from: CallStatus, to: CallStatus },
    #[error("{0} is not loaded")]
    NotLoaded(String),
}

impl EngineError {
    /// Text suitable for showing to the user. Never includes transport details.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(reason) => format!("{reason}. Please check and try again."),
            Self::AccessDenied(_) => {
                "You don't have access to that anymore. Refresh and try again.".into()
            }
            Self::NotFound(_) => "That no longer exists. Refresh and try again.".into(),
            Self::Transport(_) => {
                "Couldn't reach the server. Check your connection and try again.".into()
            }
            Self::IllegalTransition { .. } => {
                "That call has already moved on. Refresh and try again.".into()
            }
            Self::NotLoaded(_) => "That isn't loaded yet. Refresh and try again.".into(),
        }
    }
}

impl From<ApiError> for EngineError {
    fn from(err: ApiError) -> Self {
        match err.code {
            ErrorCode::Validation | ErrorCode::Conflict => Self::Validation(err.message),
            ErrorCode::Forbidden | ErrorCode::Unauthorized => Self::AccessDenied(err.message),
            ErrorCode::NotFound => Self::NotFound(err.message),
            ErrorCode::RateLimited | ErrorCode::Internal => Self::Transport(err.message),
        }
    }
}

impl From<TransportError> for EngineError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Unavailable(reason) => Self::Transport(reason),
            TransportError::Api(api) => api.into(),
        }
    }
}
