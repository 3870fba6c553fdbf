//! Session diagnostics ring.
//!
//! Every notable anomaly is recorded with a stable code so a post-mortem
//! can be pulled from a live session. The ring is bounded; old entries
//! fall off the front.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

/// Maximum retained entries.
pub const RING_CAPACITY: usize = 120;

/// Severity of a diagnostics entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Info,
    Warn,
    Error,
}

/// One diagnostics entry.
#[derive(Debug, Clone)]
pub struct DiagEvent {
    pub ts: DateTime<Utc>,
    pub level: DiagLevel,
    /// Stable code, e.g. `ice:restart`, `sdp:answer:drop`, `ws:reconnect`.
    pub code: &'static str,
    pub message: String,
}

/// Bounded, append-only diagnostics buffer.
#[derive(Debug, Default)]
pub struct DiagnosticsRing {
    entries: VecDeque<DiagEvent>,
}

impl DiagnosticsRing {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: VecDeque::with_capacity(RING_CAPACITY),
        }
    }

    pub fn push(&mut self, level: DiagLevel, code: &'static str, message: impl Into<String>) {
        if self.entries.len() == RING_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(DiagEvent {
            ts: Utc::now(),
            level,
            code,
            message: message.into(),
        });
    }

    /// Copy of the current entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<DiagEvent> {
        self.entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_is_bounded() {
        let mut ring = DiagnosticsRing::new();
        for i in 0..(RING_CAPACITY + 30) {
            ring.push(DiagLevel::Info, "ws:reconnect", format!("attempt {i}"));
        }
        assert_eq!(ring.len(), RING_CAPACITY);
        // Oldest entries dropped.
        assert_eq!(ring.snapshot()[0].message, "attempt 30");
    }

    #[test]
    fn snapshot_preserves_order() {
        let mut ring = DiagnosticsRing::new();
        ring.push(DiagLevel::Warn, "sdp:answer:drop", "a");
        ring.push(DiagLevel::Error, "ice:restart", "b");
        let snap = ring.snapshot();
        assert_eq!(snap[0].message, "a");
        assert_eq!(snap[1].message, "b");
    }
}
