//! Room Registry
//!
//! Authoritative membership, routing and event fan-out for voice rooms.
//! The registry is the process-wide source of truth for "who is in this
//! voice channel"; media never flows through it, only signaling envelopes.

mod error;
mod peer;
mod registry;
mod room;

pub use error::RegistryError;
pub use peer::{CloseReason, PeerReceiver, PeerSender, RoomPeer, SendFailure};
pub use registry::{LeaveReason, Registration, RoomRegistry};
pub use room::Room;
