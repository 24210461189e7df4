use thiserror::Error;

use super::ChannelIdentity;

#[derive(Debug, Clone, Error)]
pub enum RegistryError {
    #[error("stream not found")]
    StreamNotFound(ChannelIdentity),

    #[error("stream channel codec not ready, possible stream offline")]
    CodecNotReady(ChannelIdentity),
}
