//! Keyframe-gated packet relay
//!
//! A relay starts out waiting for a keyframe: inter frames before it cannot
//! be decoded by the viewer and are discarded. From the first keyframe on
//! every packet is forwarded. A watchdog, re-armed by each keyframe, ends
//! sessions whose channel stopped delivering video.

use std::fmt;
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, warn};

use crate::model::packet::MediaPacket;
use crate::transport::{PacketWriter, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    AwaitingKeyframe,
    Relaying,
    Terminated,
}

/// What to do with one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Discard,
    Forward,
}

impl RelayState {
    pub fn on_packet(self, is_keyframe: bool) -> (RelayState, Action) {
        match (self, is_keyframe) {
            (RelayState::Terminated, _) => (RelayState::Terminated, Action::Discard),
            (_, true) => (RelayState::Relaying, Action::Forward),
            (RelayState::Relaying, false) => (RelayState::Relaying, Action::Forward),
            (RelayState::AwaitingKeyframe, false) => (RelayState::AwaitingKeyframe, Action::Discard),
        }
    }

    /// Packets were lost, what follows needs a fresh keyframe.
    pub fn on_lag(self) -> RelayState {
        match self {
            RelayState::Terminated => RelayState::Terminated,
            _ => RelayState::AwaitingKeyframe,
        }
    }
}

/// Why a relay stopped.
#[derive(Debug)]
pub enum Termination {
    /// No keyframe within the watchdog timeout
    NoVideoTimeout,
    WriteFailed(TransportError),
    /// The channel's producer went away
    FeedClosed,
    Shutdown,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::NoVideoTimeout => write!(f, "stream no video"),
            Termination::WriteFailed(e) => write!(f, "write failed: {}", e),
            Termination::FeedClosed => write!(f, "feed closed"),
            Termination::Shutdown => write!(f, "server shutdown"),
        }
    }
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub termination: Termination,
    pub forwarded: u64,
    pub discarded: u64,
}

pub struct RelayLoop {
    feed: broadcast::Receiver<MediaPacket>,
    writer: Box<dyn PacketWriter>,
    no_video_timeout: Duration,
    shutdown: watch::Receiver<bool>,
    state: RelayState,
    forwarded: u64,
    discarded: u64,
}

impl RelayLoop {
    pub fn new(
        feed: broadcast::Receiver<MediaPacket>,
        writer: Box<dyn PacketWriter>,
        no_video_timeout: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            feed,
            writer,
            no_video_timeout,
            shutdown,
            state: RelayState::AwaitingKeyframe,
            forwarded: 0,
            discarded: 0,
        }
    }

    pub async fn run(mut self) -> RelayOutcome {
        let termination = self.relay().await;
        self.state = RelayState::Terminated;
        RelayOutcome {
            termination,
            forwarded: self.forwarded,
            discarded: self.discarded,
        }
    }

    async fn relay(&mut self) -> Termination {
        if *self.shutdown.borrow() {
            return Termination::Shutdown;
        }

        let watchdog = time::sleep(self.no_video_timeout);
        tokio::pin!(watchdog);

        loop {
            tokio::select! {
                _ = &mut watchdog => {
                    return Termination::NoVideoTimeout;
                }
                // A dropped sender means the server is gone as well.
                _ = self.shutdown.changed() => {
                    return Termination::Shutdown;
                }
                received = self.feed.recv() => match received {
                    Ok(packet) => {
                        if packet.is_keyframe {
                            watchdog.as_mut().reset(Instant::now() + self.no_video_timeout);
                        }
                        if let Err(e) = self.handle_packet(&packet) {
                            return Termination::WriteFailed(e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Viewer fell behind the feed, waiting for next keyframe");
                        self.state = self.state.on_lag();
                    }
                    Err(RecvError::Closed) => {
                        return Termination::FeedClosed;
                    }
                },
            }
        }
    }

    fn handle_packet(&mut self, packet: &MediaPacket) -> Result<(), TransportError> {
        let (next, action) = self.state.on_packet(packet.is_keyframe);
        if self.state == RelayState::AwaitingKeyframe && next == RelayState::Relaying {
            debug!(idx = packet.idx, "First keyframe, relay started");
        }
        self.state = next;

        match action {
            Action::Discard => {
                self.discarded += 1;
                Ok(())
            }
            Action::Forward => {
                self.writer.write_packet(packet)?;
                self.forwarded += 1;
                Ok(())
            }
        }
    }
}
