//! Viewer session lifecycle
//!
//! A request goes through ICE selection, the channel and authorization
//! gates and the offer/answer exchange on the request thread. Only a
//! successfully negotiated session gets a relay task, and that task does not
//! register with the channel's feed before the answer reached the viewer.

pub mod relay;

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument, Span};

use crate::auth::{AuthRequest, Authorizer};
use crate::error::SessionError;
use crate::model::ice::IceConfig;
use crate::registry::{ChannelIdentity, ClientProtocol, ConsumerGuard, StreamRegistry};
use crate::transport::{MuxerOptions, Negotiator, PacketWriter};

use self::relay::{RelayLoop, RelayOutcome};

/// Protocol name reported to the authorizer
pub const PROTOCOL: &str = "WebRTC";

/// A viewer asking to watch a channel.
#[derive(Debug, Clone)]
pub struct ViewerRequest {
    pub channel: ChannelIdentity,
    pub token: String,
    pub client_addr: String,
    /// JSON encoded ICE configuration
    pub ice_data: String,
    /// The viewer's offer
    pub offer: String,
}

/// A negotiated session whose answer still has to reach the viewer.
pub struct PendingSession {
    pub channel: ChannelIdentity,
    pub answer: String,
    writer: Box<dyn PacketWriter>,
}

/// Collaborators and settings shared by every session.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<dyn StreamRegistry>,
    pub authorizer: Arc<dyn Authorizer>,
    pub negotiator: Arc<dyn Negotiator>,
    pub runtime: Handle,
    pub shutdown: watch::Receiver<bool>,
    pub no_video_timeout: Duration,
}

impl SessionContext {
    /// Run a request up to the negotiated answer.
    pub fn negotiate(&self, request: &ViewerRequest) -> Result<PendingSession, SessionError> {
        let ice = IceConfig::parse(&request.ice_data)?.resolve();

        self.guard(request)?;

        let codecs = self.registry.channel_codecs(&request.channel)?;
        let options = MuxerOptions {
            ice,
            port_range: self.registry.webrtc_port_range(),
        };
        let negotiated = self
            .negotiator
            .negotiate(&options, &codecs, &request.offer)?;

        Ok(PendingSession {
            channel: request.channel.clone(),
            answer: negotiated.answer,
            writer: negotiated.writer,
        })
    }

    /// Channel existence, then authorization. Ingestion is only started once
    /// both passed.
    pub fn guard(&self, request: &ViewerRequest) -> Result<(), SessionError> {
        let channel = &request.channel;
        if !self.registry.channel_exists(channel) {
            return Err(SessionError::ChannelNotFound);
        }

        let auth = AuthRequest {
            proto: PROTOCOL,
            stream: &channel.stream_id,
            channel: &channel.channel_id,
            token: &request.token,
            ip: &request.client_addr,
        };
        if !self.authorizer.authorize(&auth) {
            return Err(SessionError::Unauthorized);
        }

        self.registry.channel_run(channel);
        Ok(())
    }

    /// Spawn the relay of a negotiated session.
    ///
    /// The relay waits for `delivered` before registering with the feed. If
    /// the sender is dropped instead, the answer never reached the viewer and
    /// the session ends without touching the registry.
    pub fn spawn_relay(
        &self,
        session: PendingSession,
        delivered: oneshot::Receiver<()>,
        span: Span,
    ) -> JoinHandle<Option<RelayOutcome>> {
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        let timeout = self.no_video_timeout;

        let task = async move {
            let PendingSession {
                channel, writer, ..
            } = session;

            if delivered.await.is_err() {
                error!(call = "Write", "{}", SessionError::AnswerWriteFailed);
                return None;
            }

            let (consumer, feed) =
                match ConsumerGuard::register(registry, channel, ClientProtocol::WebRtc) {
                    Ok(registered) => registered,
                    Err(e) => {
                        error!(call = "ClientAdd", "{}", e);
                        return None;
                    }
                };
            let client_id = consumer.client_id();
            info!(client_id = *client_id, "Viewer relay started");

            let outcome = RelayLoop::new(feed, writer, timeout, shutdown).run().await;
            match &outcome.termination {
                relay::Termination::NoVideoTimeout => {
                    error!(call = "ErrorStreamNoVideo", client_id = *client_id, "{}", outcome.termination)
                }
                relay::Termination::WriteFailed(_) => {
                    error!(call = "WritePacket", client_id = *client_id, "{}", outcome.termination)
                }
                relay::Termination::FeedClosed | relay::Termination::Shutdown => {
                    info!(client_id = *client_id, "Viewer relay ended: {}", outcome.termination)
                }
            }
            info!(
                client_id = *client_id,
                forwarded = outcome.forwarded,
                discarded = outcome.discarded,
                "Viewer session closed"
            );

            drop(consumer);
            Some(outcome)
        };

        self.runtime.spawn(task.instrument(span))
    }
}

#[cfg(test)]
mod tests {
    use super::relay::Termination;
    use super::*;
    use crate::model::packet::MediaPacket;
    use crate::testing::{Calls, FakeAuthorizer, FakeNegotiator, FakeRegistry, RecordingWriter};
    use crate::transport::TransportError;
    use bytes::Bytes;

    struct Fixture {
        registry: Arc<FakeRegistry>,
        authorizer: Arc<FakeAuthorizer>,
        negotiator: Arc<FakeNegotiator>,
        shutdown: watch::Sender<bool>,
        context: SessionContext,
    }

    fn fixture(registry: FakeRegistry, allow: bool, negotiator: FakeNegotiator) -> Fixture {
        let registry = Arc::new(registry);
        let authorizer = Arc::new(FakeAuthorizer::allowing(allow));
        let negotiator = Arc::new(negotiator);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let context = SessionContext {
            registry: registry.clone(),
            authorizer: authorizer.clone(),
            negotiator: negotiator.clone(),
            runtime: Handle::current(),
            shutdown: shutdown_rx,
            no_video_timeout: Duration::from_secs(10),
        };
        Fixture {
            registry,
            authorizer,
            negotiator,
            shutdown,
            context,
        }
    }

    fn request(ice_data: &str) -> ViewerRequest {
        ViewerRequest {
            channel: ChannelIdentity::new("demo", "0"),
            token: "t0ken".to_string(),
            client_addr: "10.0.0.7".to_string(),
            ice_data: ice_data.to_string(),
            offer: "offer".to_string(),
        }
    }

    const STUN: &str = r#"{"stunUrl":"stun:stun.example.org:3478"}"#;

    fn packet(seq: u64, is_keyframe: bool) -> MediaPacket {
        MediaPacket::new(0, is_keyframe, Duration::ZERO, Bytes::from(seq.to_be_bytes().to_vec()))
    }

    #[tokio::test]
    async fn malformed_ice_leaves_registry_alone() {
        let f = fixture(FakeRegistry::new(), true, FakeNegotiator::new(RecordingWriter::new()));

        let err = f.context.negotiate(&request("{oops")).err().unwrap();
        assert!(matches!(err, SessionError::MalformedConfig(_)));
        assert_eq!(Calls::get(&f.registry.calls.channel_exists), 0);
        assert_eq!(f.registry.touched(), 0);
    }

    #[tokio::test]
    async fn missing_channel_skips_authorization() {
        let f = fixture(
            FakeRegistry::missing_channel(),
            true,
            FakeNegotiator::new(RecordingWriter::new()),
        );

        let err = f.context.negotiate(&request(STUN)).err().unwrap();
        assert!(matches!(err, SessionError::ChannelNotFound));
        assert_eq!(Calls::get(&f.authorizer.calls), 0);
        assert_eq!(f.registry.touched(), 0);
    }

    #[tokio::test]
    async fn denied_request_starts_nothing() {
        let f = fixture(FakeRegistry::new(), false, FakeNegotiator::new(RecordingWriter::new()));

        let err = f.context.negotiate(&request(STUN)).err().unwrap();
        assert!(matches!(err, SessionError::Unauthorized));
        assert_eq!(f.authorizer.last_token.lock().unwrap().as_deref(), Some("t0ken"));
        assert_eq!(Calls::get(&f.registry.calls.channel_run), 0);
        assert_eq!(Calls::get(&f.registry.calls.channel_codecs), 0);
        assert_eq!(Calls::get(&f.negotiator.calls), 0);
    }

    #[tokio::test]
    async fn codec_failure_is_a_registry_error() {
        let f = fixture(
            FakeRegistry::without_codecs(),
            true,
            FakeNegotiator::new(RecordingWriter::new()),
        );

        let err = f.context.negotiate(&request(STUN)).err().unwrap();
        assert!(matches!(err, SessionError::Registry(_)));
        assert_eq!(err.status_code(), 500);
        assert_eq!(Calls::get(&f.negotiator.calls), 0);
    }

    #[tokio::test]
    async fn negotiation_failure_registers_no_consumer() {
        let f = fixture(FakeRegistry::new(), true, FakeNegotiator::failing());

        let err = f.context.negotiate(&request(STUN)).err().unwrap();
        assert!(matches!(
            err,
            SessionError::NegotiationFailed(TransportError::NoCodecInCommon)
        ));
        assert_eq!(Calls::get(&f.registry.calls.channel_run), 1);
        assert_eq!(Calls::get(&f.registry.calls.client_add), 0);
    }

    #[tokio::test]
    async fn negotiation_gets_resolved_ice_and_port_range() {
        let f = fixture(FakeRegistry::new(), true, FakeNegotiator::new(RecordingWriter::new()));

        let ice = r#"{"stunUrl":"","turn_url":"turn:turn.example.org","turn_username":"u","turn_password":"p"}"#;
        let session = f.context.negotiate(&request(ice)).unwrap();
        assert_eq!(session.answer, "answer-for-offer");

        let options = f.negotiator.last_options.lock().unwrap().clone().unwrap();
        assert_eq!(options.ice.servers, vec!["turn:turn.example.org".to_string()]);
        assert_eq!(options.ice.username.as_deref(), Some("u"));
        assert_eq!(options.ice.credential.as_deref(), Some("p"));
        assert_eq!(options.port_range, 50000..=50100);
    }

    #[tokio::test]
    async fn undelivered_answer_never_registers() {
        let f = fixture(FakeRegistry::new(), true, FakeNegotiator::new(RecordingWriter::new()));
        let session = f.context.negotiate(&request(STUN)).unwrap();

        let (delivered, delivered_rx) = oneshot::channel();
        drop(delivered);

        let outcome = f
            .context
            .spawn_relay(session, delivered_rx, Span::none())
            .await
            .unwrap();
        assert!(outcome.is_none());
        assert_eq!(Calls::get(&f.registry.calls.client_add), 0);
        assert_eq!(Calls::get(&f.registry.calls.client_delete), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_unregisters_once() {
        let f = fixture(FakeRegistry::new(), true, FakeNegotiator::new(RecordingWriter::new()));
        let session = f.context.negotiate(&request(STUN)).unwrap();

        let (delivered, delivered_rx) = oneshot::channel();
        let task = f.context.spawn_relay(session, delivered_rx, Span::none());
        delivered.send(()).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome.termination, Termination::NoVideoTimeout));
        assert_eq!(Calls::get(&f.registry.calls.client_add), 1);
        assert_eq!(Calls::get(&f.registry.calls.client_delete), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn write_failure_unregisters_once() {
        let writer = RecordingWriter::failing_after(1);
        let f = fixture(FakeRegistry::new(), true, FakeNegotiator::new(writer.clone()));
        let session = f.context.negotiate(&request(STUN)).unwrap();

        let (delivered, delivered_rx) = oneshot::channel();
        let task = f.context.spawn_relay(session, delivered_rx, Span::none());
        delivered.send(()).unwrap();

        // Wait for the relay to subscribe before publishing.
        while Calls::get(&f.registry.calls.client_add) == 0 {
            tokio::task::yield_now().await;
        }
        f.registry.feed.send(packet(0, true)).unwrap();
        f.registry.feed.send(packet(1, false)).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome.termination, Termination::WriteFailed(_)));
        assert_eq!(writer.sequence(), vec![0]);
        assert_eq!(Calls::get(&f.registry.calls.client_delete), 1);
    }

    #[tokio::test]
    async fn shutdown_unregisters_once() {
        let f = fixture(FakeRegistry::new(), true, FakeNegotiator::new(RecordingWriter::new()));
        let session = f.context.negotiate(&request(STUN)).unwrap();

        let (delivered, delivered_rx) = oneshot::channel();
        let task = f.context.spawn_relay(session, delivered_rx, Span::none());
        delivered.send(()).unwrap();

        while Calls::get(&f.registry.calls.client_add) == 0 {
            tokio::task::yield_now().await;
        }
        f.shutdown.send(true).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(matches!(outcome.termination, Termination::Shutdown));
        assert_eq!(Calls::get(&f.registry.calls.client_delete), 1);
        assert_eq!(f.registry.touched(), 4);
    }
}
