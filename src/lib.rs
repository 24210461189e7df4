//! WebRTC viewer endpoint for live streams
//!
//! Viewers post an offer for a channel of an ingested stream and get an
//! answer back. Each session then relays the channel's live packets to the
//! viewer, starting at a keyframe, until the viewer goes away or the channel
//! stops delivering video.

pub mod auth;
pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod server;
pub mod session;
pub mod transport;

#[cfg(test)]
mod testing;
mod util;
