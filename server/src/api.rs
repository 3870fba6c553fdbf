//! Application state and router.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use concord_signal::{EventSink, PeerMeta, RoomKey};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::auth::TokenValidator;
use crate::config::Config;
use crate::ice;
use crate::permissions::VoiceGate;
use crate::presence::PresenceSink;
use crate::rooms::RoomRegistry;
use crate::ws;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<RoomRegistry>,
    pub auth: Arc<dyn TokenValidator>,
}

impl AppState {
    #[must_use]
    pub fn new(
        config: Config,
        auth: Arc<dyn TokenValidator>,
        gate: Arc<dyn VoiceGate>,
        presence: Arc<dyn PresenceSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(RoomRegistry::new(config.clone(), gate, presence, events));
        Self {
            config,
            registry,
            auth,
        }
    }
}

/// Create the signaling router.
///
/// `/ws` carries all voice signaling; the HTTP surface is limited to ICE
/// configuration and a read-only room snapshot for the platform's API.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::handler))
        .route("/api/voice/ice-servers", get(ice::get_ice_servers))
        .route(
            "/api/voice/rooms/{server_id}/{channel_id}",
            get(room_snapshot),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Read-only membership snapshot, consumed by the non-core HTTP surface.
async fn room_snapshot(
    State(state): State<AppState>,
    Path((server_id, channel_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Vec<PeerMeta>>, StatusCode> {
    authenticate(&state, &headers).ok_or(StatusCode::UNAUTHORIZED)?;
    let key = RoomKey::new(server_id, channel_id);
    Ok(Json(state.registry.snapshot_room(&key).await))
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Option<String> {
    let token = headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")?;
    state.auth.validate(token)
}
