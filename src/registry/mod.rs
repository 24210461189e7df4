//! Stream registry seen from the viewer side
//!
//! The registry owns streams, their channels and the live packet feed of
//! each channel. Viewers only ever talk to it through [`StreamRegistry`], so
//! the endpoint can run against the in-process [`MemoryRegistry`] or any
//! other implementation.
//!
//! ```text
//!      ingestion ──publish()──► broadcast::Sender<MediaPacket>
//!                                   │
//!              ┌────────────────────┼────────────────────┐
//!              ▼                    ▼                    ▼
//!        [RelayLoop]          [RelayLoop]          [RelayLoop]
//!        feed.recv()          feed.recv()          feed.recv()
//! ```

pub mod error;
pub mod memory;

use std::fmt;
use std::ops::{Deref, RangeInclusive};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::model::packet::{CodecSet, MediaPacket};

pub use error::RegistryError;
pub use memory::MemoryRegistry;

/// A channel of a stream, as addressed by the viewer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelIdentity {
    pub stream_id: String,
    pub channel_id: String,
}

impl ChannelIdentity {
    pub fn new(stream_id: impl Into<String>, channel_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            channel_id: channel_id.into(),
        }
    }
}

impl fmt::Display for ChannelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.channel_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    pub fn new(id: u64) -> Self {
        ClientId(id)
    }
}

impl Deref for ClientId {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Delivery protocol of a feed consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProtocol {
    WebRtc,
}

/// A registered feed consumer.
#[derive(Debug)]
pub struct Subscription {
    pub client_id: ClientId,
    pub feed: broadcast::Receiver<MediaPacket>,
}

pub trait StreamRegistry: Send + Sync {
    fn channel_exists(&self, channel: &ChannelIdentity) -> bool;

    /// Make sure ingestion of the channel is running. Idempotent.
    fn channel_run(&self, channel: &ChannelIdentity);

    fn channel_codecs(&self, channel: &ChannelIdentity) -> Result<CodecSet, RegistryError>;

    /// UDP ports the WebRTC transport may bind. `0..=0` means any port.
    fn webrtc_port_range(&self) -> RangeInclusive<u16>;

    fn client_add(
        &self,
        channel: &ChannelIdentity,
        protocol: ClientProtocol,
    ) -> Result<Subscription, RegistryError>;

    fn client_delete(&self, channel: &ChannelIdentity, client_id: ClientId);
}

/// Unregisters a feed consumer when dropped.
///
/// Every exit path of a relay task drops its guard exactly once, so the
/// registry never keeps a consumer slot for a finished session.
pub struct ConsumerGuard {
    registry: Arc<dyn StreamRegistry>,
    channel: ChannelIdentity,
    client_id: ClientId,
}

impl ConsumerGuard {
    /// Register a consumer and split off its feed.
    pub fn register(
        registry: Arc<dyn StreamRegistry>,
        channel: ChannelIdentity,
        protocol: ClientProtocol,
    ) -> Result<(ConsumerGuard, broadcast::Receiver<MediaPacket>), RegistryError> {
        let Subscription { client_id, feed } = registry.client_add(&channel, protocol)?;
        let guard = ConsumerGuard {
            registry,
            channel,
            client_id,
        };
        Ok((guard, feed))
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }
}

impl Drop for ConsumerGuard {
    fn drop(&mut self) {
        debug!(
            stream = %self.channel.stream_id,
            channel = %self.channel.channel_id,
            client_id = *self.client_id,
            "Releasing feed consumer"
        );
        self.registry.client_delete(&self.channel, self.client_id);
    }
}
