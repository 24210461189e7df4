//! Errors of the viewer request path
//!
//! Every variant aborts the request before a relay task does any work and
//! maps to one HTTP status and payload.

use thiserror::Error;

use crate::registry::RegistryError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Invalid ICE server configuration")]
    MalformedConfig(#[source] serde_json::Error),

    #[error("stream not found")]
    ChannelNotFound,

    #[error("Unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    NegotiationFailed(#[from] TransportError),

    #[error("answer was not delivered to the viewer")]
    AnswerWriteFailed,
}

impl SessionError {
    pub fn status_code(&self) -> u16 {
        match self {
            SessionError::MalformedConfig(_)
            | SessionError::NegotiationFailed(_)
            | SessionError::AnswerWriteFailed => 400,
            SessionError::Unauthorized => 401,
            SessionError::ChannelNotFound | SessionError::Registry(_) => 500,
        }
    }

    /// The operation that failed, as reported in logs.
    pub fn call(&self) -> &'static str {
        match self {
            SessionError::MalformedConfig(_) => "Unmarshal",
            SessionError::ChannelNotFound => "StreamChannelExist",
            SessionError::Unauthorized => "RemoteAuthorization",
            SessionError::Registry(_) => "StreamCodecs",
            SessionError::NegotiationFailed(_) => "WriteHeader",
            SessionError::AnswerWriteFailed => "Write",
        }
    }
}
