//! Presence seam.
//!
//! Joining or leaving voice opportunistically refreshes the user's presence
//! in the platform's tracker. Failures are the tracker's problem, never the
//! registry's, so the call is fire-and-forget.

/// `PresenceTouch(userID)`.
pub trait PresenceSink: Send + Sync {
    fn touch(&self, user_id: &str);
}

/// No-op presence sink.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPresence;

impl PresenceSink for NoopPresence {
    fn touch(&self, _user_id: &str) {}
}
