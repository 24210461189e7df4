//! Codec selection against a viewer's offer
//!
//! A session carries at most one video and one audio track. The first codec
//! of each kind in the channel's codec set that the transport can packetize
//! and the viewer offers is used, anything else is left out of the session.

use tracing::warn;

use crate::model::packet::{CodecKind, CodecSet};

/// A channel codec that ends up as a track of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackPlan {
    /// Index of the codec in the channel's codec set
    pub idx: usize,
    pub codec: CodecKind,
}

/// Codecs the transport can packetize.
pub fn is_supported(codec: CodecKind) -> bool {
    !matches!(codec, CodecKind::H265 | CodecKind::Aac)
}

/// Encoding names of every `a=rtpmap` line in an SDP.
pub fn offered_encodings(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter_map(|line| line.trim().strip_prefix("a=rtpmap:"))
        .filter_map(|rest| rest.split_whitespace().nth(1))
        .filter_map(|encoding| encoding.split('/').next())
        .map(|name| name.to_ascii_uppercase())
        .collect()
}

pub fn select_tracks(codecs: &CodecSet, offer_sdp: &str) -> Vec<TrackPlan> {
    let offered = offered_encodings(offer_sdp);
    let mut video: Option<TrackPlan> = None;
    let mut audio: Option<TrackPlan> = None;

    for (idx, codec) in codecs.iter().enumerate() {
        let codec = codec.kind;
        if !is_supported(codec) {
            warn!(codec = %codec, "Codec not supported by WebRTC, skipping");
            continue;
        }

        let slot = if codec.is_video() { &mut video } else { &mut audio };
        if slot.is_some() {
            continue;
        }

        let name = codec.encoding_name().to_ascii_uppercase();
        if offered.iter().any(|o| *o == name) {
            *slot = Some(TrackPlan { idx, codec });
        }
    }

    video.into_iter().chain(audio).collect()
}

/// The planned tracks whose codec made it into the answer.
pub fn retain_answered(plan: Vec<TrackPlan>, answer_sdp: &str) -> Vec<TrackPlan> {
    let answered = offered_encodings(answer_sdp);
    plan.into_iter()
        .filter(|track| {
            let name = track.codec.encoding_name().to_ascii_uppercase();
            let kept = answered.iter().any(|a| *a == name);
            if !kept {
                warn!(codec = %track.codec, "Codec dropped from the answer");
            }
            kept
        })
        .collect()
}
