//! ICE Config Service
//!
//! Issues STUN servers and, when a TURN secret is configured, ephemeral
//! TURN credentials (TURN REST scheme: `username = expiry:userID`,
//! `credential = base64(HMAC-SHA1(secret, username))`). Clients refetch
//! before every join; the credentials are opaque to them.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use concord_signal::{IceConfigResponse, IceServer};
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::api::AppState;
use crate::config::Config;

type HmacSha1 = Hmac<Sha1>;

/// Public relay fallback used when no TURN is configured. Production
/// deployments should supply their own TURN host and secret.
const PUBLIC_RELAY_URL: &str = "turn:openrelay.metered.ca:80";
const PUBLIC_RELAY_USERNAME: &str = "openrelayproject";
const PUBLIC_RELAY_CREDENTIAL: &str = "openrelayproject";

/// Get ICE server configuration.
///
/// GET /api/voice/ice-servers
///
/// Returns STUN and TURN server configuration for WebRTC connections.
/// Clients should use these servers for NAT traversal.
#[utoipa::path(
    get,
    path = "/api/voice/ice-servers",
    tag = "voice",
    responses(
        (status = 200, description = "ICE server configuration", body = IceConfigResponse),
        (status = 401, description = "Missing or invalid credentials"),
    ),
    security(("bearer_auth" = [])),
)]
pub async fn get_ice_servers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<IceConfigResponse>, StatusCode> {
    let user_id = authenticate(&state, &headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let request_host = host_header(&headers);
    Ok(Json(ice_config(
        &state.config,
        &user_id,
        request_host.as_deref(),
        Utc::now().timestamp(),
    )))
}

/// Build the ICE configuration for one user.
///
/// Exposed for tests; `now_unix` pins the credential expiry.
#[must_use]
pub fn ice_config(
    config: &Config,
    user_id: &str,
    request_host: Option<&str>,
    now_unix: i64,
) -> IceConfigResponse {
    let mut servers: Vec<IceServer> = config
        .stun_servers
        .iter()
        .map(IceServer::stun)
        .collect();

    match turn_host(config, request_host) {
        Some((host, secret)) => {
            let expiry = now_unix + config.turn_ttl_secs;
            let username = format!("{expiry}:{user_id}");
            let credential = mint_credential(secret, &username);
            servers.push(IceServer {
                urls: vec![format!("turn:{host}:3478"), format!("turns:{host}:5349")],
                username: Some(username),
                credential: Some(credential),
            });
        }
        None => {
            servers.push(IceServer {
                urls: vec![PUBLIC_RELAY_URL.to_string()],
                username: Some(PUBLIC_RELAY_USERNAME.to_string()),
                credential: Some(PUBLIC_RELAY_CREDENTIAL.to_string()),
            });
        }
    }

    IceConfigResponse { servers }
}

/// TURN host to mint for: configured host, falling back to the request
/// host when only the secret is set.
fn turn_host<'a>(config: &'a Config, request_host: Option<&'a str>) -> Option<(&'a str, &'a str)> {
    let secret = config.turn_secret.as_deref()?;
    config
        .turn_host
        .as_deref()
        .or(request_host)
        .map(|host| (host, secret))
}

fn mint_credential(secret: &str, username: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(username.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let token = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    state.auth.validate(token)
}

fn host_header(headers: &HeaderMap) -> Option<String> {
    let host = headers.get(header::HOST)?.to_str().ok()?;
    // Strip a port, keep the hostname.
    Some(host.rsplit_once(':').map_or(host, |(h, _)| h).to_string())
}
