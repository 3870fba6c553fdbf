//! Room registry errors.

use thiserror::Error;

/// Errors surfaced to a peer as an `error` envelope.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Voice channel is at capacity.
    #[error("voice channel is full (max: {max})")]
    RoomFull {
        /// Maximum allowed participants.
        max: usize,
    },

    /// Permission resolver rejected the join, or the requested peer ID
    /// belongs to someone else.
    #[error("not authorized to join this voice channel")]
    Denied,

    /// Routed envelope from a peer that is not registered anywhere.
    #[error("not a member of any voice channel")]
    NotAMember,

    /// Envelope payload did not decode.
    #[error("malformed {0} payload")]
    Malformed(&'static str),
}

impl RegistryError {
    /// Stable wire code carried in the `error` envelope.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::RoomFull { .. } => "room_full",
            Self::Denied => "denied",
            Self::NotAMember => "not_a_member",
            Self::Malformed(_) => "malformed",
        }
    }
}
