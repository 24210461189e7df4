use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use rouille::{router, Request, Response, ResponseBody, Server};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, info_span};

use crate::auth::RemoteAuthorizer;
use crate::config::Config;
use crate::registry::{ChannelIdentity, MemoryRegistry};
use crate::session::{SessionContext, ViewerRequest};
use crate::transport::Str0mNegotiator;

fn init_log() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn main(config_path: &str) -> Result<()> {
    init_log();

    let config = Config::load(config_path)?;
    run(config)
}

/// Serve viewers until Ctrl-C.
pub fn run(config: Config) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;

    let registry = Arc::new(MemoryRegistry::from_config(&config));
    let authorizer = Arc::new(RemoteAuthorizer::new(&config.server.token)?);
    let mut negotiator =
        Str0mNegotiator::new().with_connect_timeout(config.server.webrtc_connect_timeout());
    if let Some(host) = config.server.webrtc_host {
        negotiator = negotiator.with_host(host);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let context = SessionContext {
        registry,
        authorizer,
        negotiator: Arc::new(negotiator),
        runtime: runtime.handle().clone(),
        shutdown: shutdown_rx,
        no_video_timeout: config.server.no_video_timeout(),
    };

    let server = Server::new(config.server.http_addr.as_str(), move |request| {
        web_request(request, &context)
    })
    .map_err(|e| anyhow!("starting the web server on {}: {}", config.server.http_addr, e))?;

    info!("Listening on http://{}", server.server_addr());
    let (handle, stop) = server.stoppable();

    runtime.block_on(tokio::signal::ctrl_c())?;
    info!("Shutting down");

    // Relay tasks see the flag and release their consumers.
    let _ = shutdown_tx.send(true);
    let _ = stop.send(());
    if handle.join().is_err() {
        error!("HTTP server thread panicked");
    }
    runtime.shutdown_timeout(Duration::from_secs(1));

    Ok(())
}

pub fn web_request(request: &Request, context: &SessionContext) -> Response {
    router!(request,
        (POST) (/stream/{uuid: String}/channel/{channel: String}/webrtc) => {
            stream_webrtc(request, context, ChannelIdentity::new(uuid, channel))
        },
        _ => Response::empty_404()
    )
}

/// Exchange a viewer's offer for an answer and start relaying the channel.
fn stream_webrtc(request: &Request, context: &SessionContext, channel: ChannelIdentity) -> Response {
    let span = info_span!(
        "http_webrtc",
        stream = %channel.stream_id,
        channel = %channel.channel_id,
        func = "HTTPAPIServerStreamWebRTC"
    );
    let _entered = span.enter();

    let mut form = form_fields(request);
    let viewer = ViewerRequest {
        channel,
        token: request.get_param("token").unwrap_or_default(),
        client_addr: client_ip(request),
        ice_data: form.remove("ice_data").unwrap_or_default(),
        offer: form.remove("data").unwrap_or_default(),
    };

    match context.negotiate(&viewer) {
        Ok(mut session) => {
            let answer = std::mem::take(&mut session.answer);
            let (body, delivered) = AnswerBody::new(answer);
            context.spawn_relay(session, delivered, span.clone());
            body.into_response()
        }
        Err(e) => {
            error!(call = e.call(), "{}", e);
            Response::from(&e)
        }
    }
}

/// Url-encoded form fields of the request. A missing or unreadable body has
/// no fields.
fn form_fields(request: &Request) -> HashMap<String, String> {
    match rouille::input::post::raw_urlencoded_post_input(request) {
        Ok(fields) => fields.into_iter().collect(),
        Err(e) => {
            debug!("No form input: {}", e);
            HashMap::new()
        }
    }
}

/// The viewer's address, honouring proxy headers.
fn client_ip(request: &Request) -> String {
    let forwarded = request
        .header("X-Forwarded-For")
        .and_then(|h| h.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty());
    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    if let Some(ip) = request.header("X-Real-Ip").map(str::trim).filter(|ip| !ip.is_empty()) {
        return ip.to_string();
    }

    request.remote_addr().ip().to_string()
}

/// Answer payload that reports when it was written out in full.
///
/// If the response is dropped before that, for instance because the viewer
/// hung up, the delivery sender is dropped with it.
struct AnswerBody {
    data: Cursor<Vec<u8>>,
    delivered: Option<oneshot::Sender<()>>,
}

impl AnswerBody {
    fn new(answer: String) -> (AnswerBody, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let mut body = AnswerBody {
            data: Cursor::new(answer.into_bytes()),
            delivered: Some(tx),
        };
        body.check_delivered();
        (body, rx)
    }

    fn len(&self) -> usize {
        self.data.get_ref().len()
    }

    fn check_delivered(&mut self) {
        if self.data.position() as usize >= self.len() {
            if let Some(tx) = self.delivered.take() {
                let _ = tx.send(());
            }
        }
    }

    fn into_response(self) -> Response {
        let len = self.len();
        let mut response = Response::text("");
        response.data = ResponseBody::from_reader_and_size(self, len);
        response
    }
}

impl Read for AnswerBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.data.read(buf)?;
        self.check_delivered();
        Ok(n)
    }
}
