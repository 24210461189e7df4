//! Fakes for the collaborators of a viewer session.

use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::auth::{AuthRequest, Authorizer};
use crate::model::packet::{CodecData, CodecKind, CodecSet, MediaPacket};
use crate::registry::{
    ChannelIdentity, ClientId, ClientProtocol, RegistryError, StreamRegistry, Subscription,
};
use crate::transport::{MuxerOptions, Negotiated, Negotiator, PacketWriter, TransportError};

/// Records the sequence number carried in each written payload.
#[derive(Clone, Default)]
pub struct RecordingWriter {
    written: Arc<Mutex<Vec<u64>>>,
    fail_after: Option<usize>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_after(writes: usize) -> Self {
        Self {
            written: Arc::default(),
            fail_after: Some(writes),
        }
    }

    pub fn sequence(&self) -> Vec<u64> {
        self.written.lock().unwrap().clone()
    }
}

impl PacketWriter for RecordingWriter {
    fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), TransportError> {
        let mut written = self.written.lock().unwrap();
        if self.fail_after.is_some_and(|n| written.len() >= n) {
            return Err(TransportError::Offline);
        }
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&packet.payload[..8]);
        written.push(u64::from_be_bytes(seq));
        Ok(())
    }
}

#[derive(Default)]
pub struct Calls {
    pub channel_exists: AtomicUsize,
    pub channel_run: AtomicUsize,
    pub channel_codecs: AtomicUsize,
    pub client_add: AtomicUsize,
    pub client_delete: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct FakeRegistry {
    pub calls: Calls,
    exists: bool,
    codecs: Option<CodecSet>,
    pub feed: broadcast::Sender<MediaPacket>,
    next_client_id: AtomicU64,
}

impl FakeRegistry {
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(64);
        Self {
            calls: Calls::default(),
            exists: true,
            codecs: Some(vec![CodecData::new(CodecKind::H264)]),
            feed,
            next_client_id: AtomicU64::new(1),
        }
    }

    pub fn missing_channel() -> Self {
        Self {
            exists: false,
            ..Self::new()
        }
    }

    pub fn without_codecs() -> Self {
        Self {
            codecs: None,
            ..Self::new()
        }
    }

    /// Registry mutations and lookups past the existence check.
    pub fn touched(&self) -> usize {
        Calls::get(&self.calls.channel_run)
            + Calls::get(&self.calls.channel_codecs)
            + Calls::get(&self.calls.client_add)
            + Calls::get(&self.calls.client_delete)
    }
}

impl StreamRegistry for FakeRegistry {
    fn channel_exists(&self, _channel: &ChannelIdentity) -> bool {
        self.calls.channel_exists.fetch_add(1, Ordering::SeqCst);
        self.exists
    }

    fn channel_run(&self, _channel: &ChannelIdentity) {
        self.calls.channel_run.fetch_add(1, Ordering::SeqCst);
    }

    fn channel_codecs(&self, channel: &ChannelIdentity) -> Result<CodecSet, RegistryError> {
        self.calls.channel_codecs.fetch_add(1, Ordering::SeqCst);
        self.codecs
            .clone()
            .ok_or_else(|| RegistryError::CodecNotReady(channel.clone()))
    }

    fn webrtc_port_range(&self) -> RangeInclusive<u16> {
        50000..=50100
    }

    fn client_add(
        &self,
        _channel: &ChannelIdentity,
        _protocol: ClientProtocol,
    ) -> Result<Subscription, RegistryError> {
        self.calls.client_add.fetch_add(1, Ordering::SeqCst);
        Ok(Subscription {
            client_id: ClientId::new(self.next_client_id.fetch_add(1, Ordering::SeqCst)),
            feed: self.feed.subscribe(),
        })
    }

    fn client_delete(&self, _channel: &ChannelIdentity, _client_id: ClientId) {
        self.calls.client_delete.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeAuthorizer {
    allow: bool,
    pub calls: AtomicUsize,
    pub last_token: Mutex<Option<String>>,
}

impl FakeAuthorizer {
    pub fn allowing(allow: bool) -> Self {
        Self {
            allow,
            calls: AtomicUsize::new(0),
            last_token: Mutex::new(None),
        }
    }
}

impl Authorizer for FakeAuthorizer {
    fn authorize(&self, request: &AuthRequest<'_>) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_token.lock().unwrap() = Some(request.token.to_string());
        self.allow
    }
}

pub struct FakeNegotiator {
    fail: bool,
    pub writer: RecordingWriter,
    pub calls: AtomicUsize,
    pub last_options: Mutex<Option<MuxerOptions>>,
}

impl FakeNegotiator {
    pub fn new(writer: RecordingWriter) -> Self {
        Self {
            fail: false,
            writer,
            calls: AtomicUsize::new(0),
            last_options: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new(RecordingWriter::new())
        }
    }
}

impl Negotiator for FakeNegotiator {
    fn negotiate(
        &self,
        options: &MuxerOptions,
        _codecs: &CodecSet,
        offer: &str,
    ) -> Result<Negotiated, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_options.lock().unwrap() = Some(options.clone());
        if self.fail {
            return Err(TransportError::NoCodecInCommon);
        }
        Ok(Negotiated {
            answer: format!("answer-for-{offer}"),
            writer: Box::new(self.writer.clone()),
        })
    }
}
