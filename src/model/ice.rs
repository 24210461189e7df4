//! ICE server selection
//!
//! Viewers send their ICE server settings along with the offer. Exactly one
//! server is used per session: a STUN url wins over a TURN url, and TURN
//! credentials only apply when the TURN server is the one picked.

use serde::Deserialize;

use crate::error::SessionError;

/// ICE server settings as posted by the viewer in the `ice_data` form field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    #[serde(rename = "stunUrl")]
    pub stun_url: String,
    pub turn_url: String,
    pub turn_username: String,
    pub turn_password: String,
}

/// The ICE parameters a transport is built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIce {
    pub servers: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceConfig {
    /// Parse the JSON text of the `ice_data` form field.
    pub fn parse(raw: &str) -> Result<IceConfig, SessionError> {
        serde_json::from_str(raw).map_err(SessionError::MalformedConfig)
    }

    /// Pick the single ICE server of the session.
    ///
    /// Urls are not validated here, the transport rejects what it cannot use.
    pub fn resolve(&self) -> ResolvedIce {
        if !self.stun_url.is_empty() {
            return ResolvedIce {
                servers: vec![self.stun_url.clone()],
                username: None,
                credential: None,
            };
        }

        ResolvedIce {
            servers: vec![self.turn_url.clone()],
            username: non_empty(&self.turn_username),
            credential: non_empty(&self.turn_password),
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}
