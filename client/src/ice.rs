//! ICE config resolver.
//!
//! Fetches the STUN/TURN list from the coordination server right before
//! joining; credentials are ephemeral and opaque, so no caching.

use concord_signal::IceConfigResponse;
use thiserror::Error;
use webrtc::ice_transport::ice_server::RTCIceServer;

/// ICE config errors
#[derive(Error, Debug)]
pub enum IceConfigError {
    #[error("ICE config request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("ICE config request rejected with status {0}")]
    Status(u16),
}

/// Fetch the ICE configuration from the server.
pub async fn fetch_ice_config(
    base_url: &str,
    token: &str,
) -> Result<IceConfigResponse, IceConfigError> {
    let url = format!("{}/api/voice/ice-servers", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .get(url)
        .bearer_auth(token)
        .send()
        .await?;

    if !response.status().is_success() {
        return Err(IceConfigError::Status(response.status().as_u16()));
    }
    Ok(response.json().await?)
}

/// Convert the wire response into the media stack's server list.
#[must_use]
pub fn to_rtc_ice_servers(config: &IceConfigResponse) -> Vec<RTCIceServer> {
    config
        .servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}
