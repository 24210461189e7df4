//! Media packets and codec descriptors
//!
//! Packets are produced by the ingestion side of a channel and fanned out to
//! every viewer through the registry's broadcast feed. Beyond the keyframe
//! flag, the codec index and the presentation time they are opaque here.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// The codecs a channel can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecKind {
    H264,
    H265,
    Vp8,
    Vp9,
    Opus,
    Pcmu,
    Pcma,
    Aac,
}

impl CodecKind {
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            CodecKind::H264 | CodecKind::H265 | CodecKind::Vp8 | CodecKind::Vp9
        )
    }

    /// The encoding name used in SDP `a=rtpmap` lines.
    pub fn encoding_name(&self) -> &'static str {
        match self {
            CodecKind::H264 => "H264",
            CodecKind::H265 => "H265",
            CodecKind::Vp8 => "VP8",
            CodecKind::Vp9 => "VP9",
            CodecKind::Opus => "opus",
            CodecKind::Pcmu => "PCMU",
            CodecKind::Pcma => "PCMA",
            CodecKind::Aac => "MPEG4-GENERIC",
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encoding_name())
    }
}

/// One elementary stream of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecData {
    pub kind: CodecKind,
}

impl CodecData {
    pub fn new(kind: CodecKind) -> Self {
        Self { kind }
    }
}

/// The ordered codec list of a channel. A packet's `idx` points into it.
pub type CodecSet = Vec<CodecData>;

/// A unit of media as delivered by the live feed.
///
/// Cloning is cheap: the payload is reference counted, so every viewer of a
/// channel shares the same allocation.
#[derive(Debug, Clone)]
pub struct MediaPacket {
    /// Index into the channel's [`CodecSet`]
    pub idx: usize,
    /// Whether the packet can be decoded without any prior packet
    pub is_keyframe: bool,
    /// Presentation time relative to the start of the stream
    pub time: Duration,
    pub payload: Bytes,
}

impl MediaPacket {
    pub fn new(idx: usize, is_keyframe: bool, time: Duration, payload: Bytes) -> Self {
        Self {
            idx,
            is_keyframe,
            time,
            payload,
        }
    }
}
