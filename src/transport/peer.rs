use std::net::UdpSocket;
use std::time::Instant;

use str0m::format::Codec;
use str0m::media::{MediaKind, MediaTime, Mid};
use str0m::{Event, IceConnectionState, Input, Output, Rtc};
use tracing::{debug, info, warn};

use crate::model::packet::{CodecKind, MediaPacket};
use crate::transport::sdp::TrackPlan;

/// An outgoing track, once the viewer's offer has been applied.
#[derive(Debug, Clone, Copy)]
struct TrackOut {
    kind: MediaKind,
    mid: Mid,
}

/// One viewer's peer connection.
///
/// Wraps the sans-io `Rtc` instance: the driver feeds it network input and
/// media, and transmits whatever it outputs.
pub struct Peer {
    pub rtc: Rtc,
    plan: Vec<TrackPlan>,
    tracks_out: Vec<TrackOut>,
    connected: bool,
    started: Instant,
}

/// What a poll of the peer yielded, besides transmitted datagrams.
pub enum Polled {
    Timeout(Instant),
    Continue,
}

impl Peer {
    pub fn new(rtc: Rtc, plan: Vec<TrackPlan>) -> Peer {
        Peer {
            rtc,
            plan,
            tracks_out: vec![],
            connected: false,
            started: Instant::now(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.rtc.is_alive()
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn disconnect(&mut self) {
        self.rtc.disconnect();
    }

    pub fn accepts(&self, input: &Input) -> bool {
        self.rtc.accepts(input)
    }

    pub fn handle_input(&mut self, input: Input) {
        if !self.rtc.is_alive() {
            return;
        }

        if let Err(e) = self.rtc.handle_input(input) {
            warn!("Peer disconnected: {:?}", e);
            self.rtc.disconnect();
        }
    }

    /// Poll output until the peer asks to be woken up again.
    pub fn poll_until_timeout(&mut self, socket: &UdpSocket) -> Instant {
        loop {
            if !self.rtc.is_alive() {
                return Instant::now();
            }

            if let Polled::Timeout(t) = self.poll_output(socket) {
                return t;
            }
        }
    }

    fn poll_output(&mut self, socket: &UdpSocket) -> Polled {
        match self.rtc.poll_output() {
            Ok(output) => self.handle_output(output, socket),
            Err(e) => {
                warn!("Peer poll_output failed: {:?}", e);
                self.rtc.disconnect();
                Polled::Timeout(Instant::now())
            }
        }
    }

    fn handle_output(&mut self, output: Output, socket: &UdpSocket) -> Polled {
        match output {
            Output::Transmit(transmit) => {
                if let Err(e) = socket.send_to(&transmit.contents, transmit.destination) {
                    debug!("Sending UDP data to {} failed: {}", transmit.destination, e);
                }
                Polled::Continue
            }
            Output::Timeout(t) => Polled::Timeout(t),
            Output::Event(e) => {
                match e {
                    Event::IceConnectionStateChange(state) => {
                        info!("ICE state = {:?}", state);
                        match state {
                            IceConnectionState::Connected | IceConnectionState::Completed => {
                                self.connected = true;
                            }
                            IceConnectionState::Disconnected => {
                                // No ICE restarts, a viewer that goes away is done.
                                self.rtc.disconnect();
                            }
                            _ => {}
                        }
                    }
                    Event::MediaAdded(added) => {
                        debug!("Media added: {:?} {:?}", added.mid, added.kind);
                        self.tracks_out.push(TrackOut {
                            kind: added.kind,
                            mid: added.mid,
                        });
                    }
                    Event::KeyframeRequest(req) => {
                        // Keyframes follow the ingest GOP, there is no encoder to ask.
                        debug!("Ignoring keyframe request for {:?}", req.mid);
                    }
                    _ => {}
                }
                Polled::Continue
            }
        }
    }

    /// Packetize one media packet onto the matching outgoing track.
    ///
    /// Packets for codecs that are not part of the session, or that arrive
    /// before the track exists, are dropped.
    pub fn write_packet(&mut self, packet: &MediaPacket) {
        let Some(plan) = self.plan.iter().find(|p| p.idx == packet.idx) else {
            return;
        };
        let kind = if plan.codec.is_video() {
            MediaKind::Video
        } else {
            MediaKind::Audio
        };

        let Some(track) = self.tracks_out.iter().find(|t| t.kind == kind) else {
            return;
        };

        let Some(writer) = self.rtc.writer(track.mid) else {
            return;
        };

        let Some(wanted) = rtp_codec(plan.codec) else {
            return;
        };
        let Some((pt, clock_rate)) = writer
            .payload_params()
            .find(|p| p.spec().codec == wanted)
            .map(|p| (p.pt(), p.spec().clock_rate))
        else {
            return;
        };

        let ticks = packet.time.as_nanos() * u128::from(clock_rate.get()) / 1_000_000_000;
        let rtp_time = MediaTime::new(ticks as u64, clock_rate);

        if let Err(e) = writer.write(pt, Instant::now(), rtp_time, packet.payload.to_vec()) {
            warn!("Writing {} packet failed: {:?}", plan.codec, e);
            self.rtc.disconnect();
        }
    }
}

fn rtp_codec(codec: CodecKind) -> Option<Codec> {
    match codec {
        CodecKind::H264 => Some(Codec::H264),
        CodecKind::Vp8 => Some(Codec::Vp8),
        CodecKind::Vp9 => Some(Codec::Vp9),
        CodecKind::Opus => Some(Codec::Opus),
        CodecKind::Pcmu => Some(Codec::PCMU),
        CodecKind::Pcma => Some(Codec::PCMA),
        CodecKind::H265 | CodecKind::Aac => None,
    }
}
