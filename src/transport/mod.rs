//! WebRTC transport
//!
//! The session code only sees two capabilities: a [`Negotiator`] that turns
//! a viewer's offer into an answer, and the [`PacketWriter`] it hands back
//! for the media of that session. [`Str0mNegotiator`] implements both on top
//! of `str0m`, with one UDP socket and driver thread per session.

pub mod driver;
pub mod peer;
pub mod sdp;

use std::io;
use std::net::{IpAddr, UdpSocket};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use str0m::change::SdpOffer;
use str0m::{Candidate, Rtc, RtcConfig};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::ice::ResolvedIce;
use crate::model::packet::{CodecKind, CodecSet, MediaPacket};
use crate::util::{bind_in_range, select_host_address};

use self::driver::Driver;
use self::peer::Peer;
use self::sdp::{retain_answered, select_tracks, TrackPlan};

/// Media queued towards a driver thread before packets get dropped
const MEDIA_QUEUE: usize = 256;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebRTC offer is not valid base64: {0}")]
    OfferEncoding(#[from] base64::DecodeError),

    #[error("WebRTC offer is not a valid SDP: {0}")]
    InvalidOffer(String),

    #[error("WebRTC codec not found, no codec of the stream is offered by the viewer")]
    NoCodecInCommon,

    #[error("invalid ICE server url {0:?}")]
    InvalidIceServer(String),

    #[error("no free UDP port in range {0}-{1}")]
    NoFreePort(u16, u16),

    #[error("no usable network interface for host candidates")]
    NoHostAddress,

    #[error("WebRTC negotiation failed: {0}")]
    Rtc(String),

    #[error("WebRTC client offline")]
    Offline,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Everything a transport is built with, besides codecs and offer.
///
/// The ICE credentials are carried for transports that gather through a
/// TURN server. [`Str0mNegotiator`] runs ICE-lite and only checks the URLs.
#[derive(Debug, Clone)]
pub struct MuxerOptions {
    pub ice: ResolvedIce,
    pub port_range: RangeInclusive<u16>,
}

/// Sink for the media of one negotiated session.
pub trait PacketWriter: Send {
    fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), TransportError>;
}

pub struct Negotiated {
    /// Answer payload, returned to the viewer as is
    pub answer: String,
    pub writer: Box<dyn PacketWriter>,
}

pub trait Negotiator: Send + Sync {
    fn negotiate(
        &self,
        options: &MuxerOptions,
        codecs: &CodecSet,
        offer: &str,
    ) -> Result<Negotiated, TransportError>;
}

/// Checks the ICE servers handed to a transport.
pub fn validate_ice_servers(ice: &ResolvedIce) -> Result<(), TransportError> {
    for url in &ice.servers {
        let valid = ["stun:", "turn:", "turns:"]
            .iter()
            .any(|scheme| url.len() > scheme.len() && url.starts_with(scheme));
        if !valid {
            return Err(TransportError::InvalidIceServer(url.clone()));
        }
    }
    Ok(())
}

/// Answers offers with an ICE-lite `str0m` peer.
///
/// The server only advertises a host candidate. The ICE servers picked by the
/// viewer matter on the viewer's side, where they are used for gathering;
/// here they are only checked.
pub struct Str0mNegotiator {
    host: Option<IpAddr>,
    connect_timeout: Duration,
}

impl Str0mNegotiator {
    pub fn new() -> Self {
        Self {
            host: None,
            connect_timeout: Duration::from_secs(30),
        }
    }

    /// Advertise this address instead of the first routable interface.
    pub fn with_host(mut self, host: IpAddr) -> Self {
        self.host = Some(host);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    fn bind(&self, range: &RangeInclusive<u16>) -> Result<UdpSocket, TransportError> {
        let host = match self.host {
            Some(host) => host,
            None => select_host_address().ok_or(TransportError::NoHostAddress)?,
        };
        bind_in_range(host, range.clone())
            .ok_or_else(|| TransportError::NoFreePort(*range.start(), *range.end()))
    }
}

impl Default for Str0mNegotiator {
    fn default() -> Self {
        Self::new()
    }
}

impl Negotiator for Str0mNegotiator {
    fn negotiate(
        &self,
        options: &MuxerOptions,
        codecs: &CodecSet,
        offer: &str,
    ) -> Result<Negotiated, TransportError> {
        validate_ice_servers(&options.ice)?;

        let sdp = BASE64.decode(offer.trim())?;
        let sdp = String::from_utf8(sdp)
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;

        let plan = select_tracks(codecs, &sdp);
        if plan.is_empty() {
            return Err(TransportError::NoCodecInCommon);
        }

        let offer = SdpOffer::from_sdp_string(&sdp)
            .map_err(|e| TransportError::InvalidOffer(e.to_string()))?;

        let socket = self.bind(&options.port_range)?;
        let addr = socket.local_addr()?;

        let mut rtc = rtc_config(&plan).build();
        let candidate =
            Candidate::host(addr, "udp").map_err(|e| TransportError::Rtc(e.to_string()))?;
        rtc.add_local_candidate(candidate);

        let answer = rtc
            .sdp_api()
            .accept_offer(offer)
            .map_err(|e| TransportError::Rtc(e.to_string()))?;
        let answer = answer.to_sdp_string();

        let plan = retain_answered(plan, &answer);
        if plan.is_empty() {
            return Err(TransportError::NoCodecInCommon);
        }

        debug!(servers = ?options.ice.servers, tracks = ?plan, "Offer accepted");

        let (tx, rx) = mpsc::sync_channel(MEDIA_QUEUE);
        let alive = Arc::new(AtomicBool::new(true));

        let driver = Driver {
            peer: Peer::new(rtc, plan),
            socket,
            media: rx,
            alive: alive.clone(),
            connect_timeout: self.connect_timeout,
        };
        thread::Builder::new()
            .name(format!("webrtc-{}", addr.port()))
            .spawn(move || driver.run())?;

        info!("WebRTC session bound to {}", addr);

        Ok(Negotiated {
            answer: BASE64.encode(answer),
            writer: Box::new(DriverWriter { tx, alive }),
        })
    }
}

/// An ICE-lite configuration offering exactly the planned codecs.
fn rtc_config(plan: &[TrackPlan]) -> RtcConfig {
    let mut config = Rtc::builder().set_ice_lite(true).clear_codecs();
    for track in plan {
        config = match track.codec {
            CodecKind::H264 => config.enable_h264(true),
            CodecKind::Vp8 => config.enable_vp8(true),
            CodecKind::Vp9 => config.enable_vp9(true),
            CodecKind::Opus => config.enable_opus(true),
            CodecKind::Pcmu => config.enable_pcmu(true),
            CodecKind::Pcma => config.enable_pcma(true),
            CodecKind::H265 | CodecKind::Aac => config,
        };
    }
    config
}

/// Queues media for a session's driver thread.
struct DriverWriter {
    tx: SyncSender<MediaPacket>,
    alive: Arc<AtomicBool>,
}

impl PacketWriter for DriverWriter {
    fn write_packet(&mut self, packet: &MediaPacket) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Offline);
        }

        match self.tx.try_send(packet.clone()) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                debug!("Media queue full, dropping packet");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Offline),
        }
    }
}
