//! Data models for viewer sessions
//!
//! ICE settings posted by viewers, the media packets and codecs of a channel,
//! and the JSON body of error replies.

pub mod ice;
pub mod message;
pub mod packet;
