//! Permission seam.
//!
//! The platform's permission resolver decides whether a user may connect to
//! a given voice channel; the room registry consults it on every join.

use concord_signal::RoomKey;

/// `MayJoinVoice(userID, serverID, channelID)`.
pub trait VoiceGate: Send + Sync {
    fn may_join_voice(&self, user_id: &str, room: &RoomKey) -> bool;
}

/// Grants everything. Development and test deployments only.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl VoiceGate for AllowAll {
    fn may_join_voice(&self, _user_id: &str, _room: &RoomKey) -> bool {
        true
    }
}

/// Denies everything. Used in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAll;

impl VoiceGate for DenyAll {
    fn may_join_voice(&self, _user_id: &str, _room: &RoomKey) -> bool {
        false
    }
}
