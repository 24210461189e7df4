//! Server configuration
//!
//! Loaded from a JSON file. Every field has a default, so an empty object is
//! a valid configuration.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::model::packet::CodecKind;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub streams: HashMap<String, StreamConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the HTTP endpoint listens on
    pub http_addr: String,

    /// Lowest UDP port a WebRTC session may bind (0 = any)
    pub webrtc_port_min: u16,

    /// Highest UDP port a WebRTC session may bind (0 = any)
    pub webrtc_port_max: u16,

    /// Address advertised in host candidates, instead of the first
    /// routable interface
    pub webrtc_host: Option<IpAddr>,

    /// Sessions without a keyframe for this long are closed
    pub no_video_timeout_secs: u64,

    /// Negotiated sessions whose viewer has not connected by then are dropped
    pub webrtc_connect_timeout_secs: u64,

    pub token: TokenConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8083".to_string(),
            webrtc_port_min: 0,
            webrtc_port_max: 0,
            webrtc_host: None,
            no_video_timeout_secs: 10,
            webrtc_connect_timeout_secs: 30,
            token: TokenConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn no_video_timeout(&self) -> Duration {
        Duration::from_secs(self.no_video_timeout_secs)
    }

    pub fn webrtc_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.webrtc_connect_timeout_secs)
    }
}

/// Remote token authorization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub enable: bool,
    pub backend: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub name: String,
    pub channels: HashMap<String, ChannelConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub name: String,
    pub url: String,

    /// Codecs known up front. When empty the ingestion side reports them.
    pub codecs: Vec<CodecKind>,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config = Config::parse(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Config> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let server = &self.server;
        if server.webrtc_port_min > server.webrtc_port_max {
            bail!(
                "webrtc_port_min ({}) is greater than webrtc_port_max ({})",
                server.webrtc_port_min,
                server.webrtc_port_max
            );
        }
        if server.token.enable && server.token.backend.is_empty() {
            bail!("token authorization is enabled but no backend is set");
        }
        if server.no_video_timeout_secs == 0 {
            bail!("no_video_timeout_secs must be positive");
        }
        if server.webrtc_connect_timeout_secs == 0 {
            bail!("webrtc_connect_timeout_secs must be positive");
        }
        Ok(())
    }
}
