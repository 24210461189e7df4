//! In-process stream registry
//!
//! Channels come from the configuration. Ingestion is expected to push codecs
//! and packets through [`MemoryRegistry::set_codecs`] and
//! [`MemoryRegistry::publish`].

use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tracing::{debug, info};

use super::{
    ChannelIdentity, ClientId, ClientProtocol, RegistryError, StreamRegistry, Subscription,
};
use crate::config::Config;
use crate::model::packet::{CodecSet, CodecData, MediaPacket};

/// Packets buffered per consumer before it starts lagging
const FEED_CAPACITY: usize = 1024;

const CODEC_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ChannelEntry {
    codecs: Option<CodecSet>,
    running: bool,
    tx: broadcast::Sender<MediaPacket>,
    clients: HashSet<ClientId>,
}

impl ChannelEntry {
    fn new(codecs: Option<CodecSet>) -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            codecs,
            running: false,
            tx,
            clients: HashSet::new(),
        }
    }
}

pub struct MemoryRegistry {
    channels: Mutex<HashMap<ChannelIdentity, ChannelEntry>>,
    port_range: RangeInclusive<u16>,
    codec_wait: Duration,
    next_client_id: AtomicU64,
}

impl MemoryRegistry {
    pub fn new(port_range: RangeInclusive<u16>) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            port_range,
            codec_wait: Duration::from_secs(5),
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let registry = Self::new(config.server.webrtc_port_min..=config.server.webrtc_port_max);
        for (stream_id, stream) in &config.streams {
            for (channel_id, channel) in &stream.channels {
                let codecs = (!channel.codecs.is_empty())
                    .then(|| channel.codecs.iter().copied().map(CodecData::new).collect());
                registry.add_channel(ChannelIdentity::new(stream_id, channel_id), codecs);
            }
        }
        registry
    }

    /// How long `channel_codecs` waits for ingestion to report codecs.
    pub fn with_codec_wait(mut self, wait: Duration) -> Self {
        self.codec_wait = wait;
        self
    }

    pub fn add_channel(&self, channel: ChannelIdentity, codecs: Option<CodecSet>) {
        info!(stream = %channel.stream_id, channel = %channel.channel_id, "Channel added");
        self.lock().insert(channel, ChannelEntry::new(codecs));
    }

    pub fn set_codecs(&self, channel: &ChannelIdentity, codecs: CodecSet) {
        if let Some(entry) = self.lock().get_mut(channel) {
            entry.codecs = Some(codecs);
        }
    }

    /// Fan a packet out to every consumer of the channel.
    ///
    /// Returns the number of consumers that received it.
    pub fn publish(&self, channel: &ChannelIdentity, packet: MediaPacket) -> usize {
        let channels = self.lock();
        let Some(entry) = channels.get(channel) else {
            return 0;
        };
        // An error only means there is no consumer right now.
        entry.tx.send(packet).unwrap_or(0)
    }

    pub fn is_running(&self, channel: &ChannelIdentity) -> bool {
        self.lock().get(channel).map(|e| e.running).unwrap_or(false)
    }

    pub fn client_count(&self, channel: &ChannelIdentity) -> usize {
        self.lock().get(channel).map(|e| e.clients.len()).unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ChannelIdentity, ChannelEntry>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StreamRegistry for MemoryRegistry {
    fn channel_exists(&self, channel: &ChannelIdentity) -> bool {
        self.lock().contains_key(channel)
    }

    fn channel_run(&self, channel: &ChannelIdentity) {
        if let Some(entry) = self.lock().get_mut(channel) {
            if !entry.running {
                entry.running = true;
                info!(stream = %channel.stream_id, channel = %channel.channel_id, "Ingestion started");
            }
        }
    }

    fn channel_codecs(&self, channel: &ChannelIdentity) -> Result<CodecSet, RegistryError> {
        let deadline = Instant::now() + self.codec_wait;
        loop {
            match self.lock().get(channel) {
                None => return Err(RegistryError::StreamNotFound(channel.clone())),
                Some(ChannelEntry {
                    codecs: Some(codecs),
                    ..
                }) if !codecs.is_empty() => return Ok(codecs.clone()),
                Some(_) => {}
            }

            if Instant::now() >= deadline {
                return Err(RegistryError::CodecNotReady(channel.clone()));
            }
            thread::sleep(CODEC_POLL_INTERVAL);
        }
    }

    fn webrtc_port_range(&self) -> RangeInclusive<u16> {
        self.port_range.clone()
    }

    fn client_add(
        &self,
        channel: &ChannelIdentity,
        protocol: ClientProtocol,
    ) -> Result<Subscription, RegistryError> {
        let mut channels = self.lock();
        let entry = channels
            .get_mut(channel)
            .ok_or_else(|| RegistryError::StreamNotFound(channel.clone()))?;

        let client_id = ClientId::new(self.next_client_id.fetch_add(1, Ordering::Relaxed));
        entry.clients.insert(client_id);

        info!(
            stream = %channel.stream_id,
            channel = %channel.channel_id,
            client_id = *client_id,
            protocol = ?protocol,
            clients = entry.clients.len(),
            "Client added"
        );

        Ok(Subscription {
            client_id,
            feed: entry.tx.subscribe(),
        })
    }

    fn client_delete(&self, channel: &ChannelIdentity, client_id: ClientId) {
        if let Some(entry) = self.lock().get_mut(channel) {
            if entry.clients.remove(&client_id) {
                debug!(
                    stream = %channel.stream_id,
                    channel = %channel.channel_id,
                    client_id = *client_id,
                    clients = entry.clients.len(),
                    "Client removed"
                );
            }
        }
    }
}
