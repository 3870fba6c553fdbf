//! ICE configuration wire types.
//!
//! Returned by the server's ICE config service and consumed opaquely by the
//! client before it joins a voice channel.

use serde::{Deserialize, Serialize};

/// One STUN or TURN server entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, utoipa::ToSchema)]
pub struct IceServer {
    /// Server URLs (e.g. "stun:stun.l.google.com:19302", "turn:host:3478").
    pub urls: Vec<String>,
    /// Username for TURN servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Credential for TURN servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// A STUN-only entry without credentials.
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Response of the ICE config service.
#[derive(Debug, Clone, Serialize, Deserialize, utoipa::ToSchema)]
pub struct IceConfigResponse {
    /// ICE servers to use for NAT traversal, in preference order.
    pub servers: Vec<IceServer>,
}
