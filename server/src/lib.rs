//! Concord Coordination Server
//!
//! Real-time voice session fabric: signaling transport, authoritative room
//! registry, and the ICE configuration service. Media flows peer-to-peer;
//! this process only shuttles small JSON envelopes.

pub mod api;
pub mod auth;
pub mod config;
pub mod ice;
pub mod permissions;
pub mod presence;
pub mod rooms;
pub mod ws;
