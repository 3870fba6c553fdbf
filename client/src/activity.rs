//! Voice activity and dominant-speaker estimation.
//!
//! The audio playback pipeline reports an RMS level per inbound stream
//! roughly every 120 ms; the meter turns those into speaking flags and a
//! dominant-speaker tag. Advisory UI state only, never sent on the wire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// RMS above which a peer counts as speaking.
pub const SPEAKING_THRESHOLD: f32 = 0.02;
/// RMS a peer must exceed to be tagged dominant.
pub const DOMINANT_THRESHOLD: f32 = 0.03;
/// Sampling cadence the pipeline is expected to follow.
pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(120);

/// A level report goes stale after missing a few sample windows.
const STALE_AFTER: Duration = Duration::from_millis(400);

#[derive(Debug, Clone, Copy)]
struct PeerLevel {
    rms: f32,
    silenced: bool,
    reported_at: Instant,
    /// When the current speaking stretch began; tie-breaker for dominance.
    speaking_since: Option<Instant>,
}

/// Current advisory speaking state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SpeakerState {
    /// Peers currently speaking, unordered.
    pub speaking: Vec<String>,
    /// Loudest speaking peer above the dominance threshold.
    pub dominant: Option<String>,
}

/// Tracks per-peer audio levels and derives speaking state.
#[derive(Debug, Default)]
pub struct VoiceActivityMeter {
    levels: HashMap<String, PeerLevel>,
}

impl VoiceActivityMeter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one RMS sample. `silenced` covers both muted and deafened
    /// peers; they never count as speaking.
    pub fn report(&mut self, peer_id: &str, rms: f32, silenced: bool, now: Instant) {
        let entry = self.levels.entry(peer_id.to_string()).or_insert(PeerLevel {
            rms: 0.0,
            silenced,
            reported_at: now,
            speaking_since: None,
        });
        entry.rms = rms;
        entry.silenced = silenced;
        entry.reported_at = now;

        let speaking = rms > SPEAKING_THRESHOLD && !silenced;
        if speaking {
            entry.speaking_since.get_or_insert(now);
        } else {
            entry.speaking_since = None;
        }
    }

    pub fn remove(&mut self, peer_id: &str) {
        self.levels.remove(peer_id);
    }

    /// Compute the current state. Stale levels read as silence.
    #[must_use]
    pub fn tick(&mut self, now: Instant) -> SpeakerState {
        let mut speaking = Vec::new();
        let mut dominant: Option<(&String, PeerLevel)> = None;

        for (peer_id, level) in &self.levels {
            let fresh = now.duration_since(level.reported_at) < STALE_AFTER;
            let is_speaking =
                fresh && !level.silenced && level.rms > SPEAKING_THRESHOLD;
            if !is_speaking {
                continue;
            }
            speaking.push(peer_id.clone());

            if level.rms > DOMINANT_THRESHOLD {
                let louder = match &dominant {
                    None => true,
                    Some((_, current)) => {
                        level.rms > current.rms
                            || (level.rms == current.rms
                                && level.speaking_since < current.speaking_since)
                    }
                };
                if louder {
                    dominant = Some((peer_id, *level));
                }
            }
        }

        SpeakerState {
            speaking,
            dominant: dominant.map(|(id, _)| id.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_peer_is_not_speaking() {
        let now = Instant::now();
        let mut meter = VoiceActivityMeter::new();
        meter.report("a", 0.01, false, now);
        assert!(meter.tick(now).speaking.is_empty());
    }

    #[test]
    fn muted_peer_never_speaks() {
        let now = Instant::now();
        let mut meter = VoiceActivityMeter::new();
        meter.report("a", 0.5, true, now);
        let state = meter.tick(now);
        assert!(state.speaking.is_empty());
        assert!(state.dominant.is_none());
    }

    #[test]
    fn loudest_peer_is_dominant() {
        let now = Instant::now();
        let mut meter = VoiceActivityMeter::new();
        meter.report("a", 0.05, false, now);
        meter.report("b", 0.20, false, now);
        let state = meter.tick(now);
        assert_eq!(state.speaking.len(), 2);
        assert_eq!(state.dominant.as_deref(), Some("b"));
    }

    #[test]
    fn dominance_tie_goes_to_earliest_onset() {
        let start = Instant::now();
        let later = start + Duration::from_millis(120);
        let mut meter = VoiceActivityMeter::new();
        meter.report("early", 0.10, false, start);
        meter.report("late", 0.10, false, later);
        let state = meter.tick(later);
        assert_eq!(state.dominant.as_deref(), Some("early"));
    }

    #[test]
    fn speaking_above_threshold_but_below_dominance() {
        let now = Instant::now();
        let mut meter = VoiceActivityMeter::new();
        meter.report("a", 0.025, false, now);
        let state = meter.tick(now);
        assert_eq!(state.speaking, vec!["a".to_string()]);
        assert!(state.dominant.is_none());
    }

    #[test]
    fn stale_levels_read_as_silence() {
        let start = Instant::now();
        let mut meter = VoiceActivityMeter::new();
        meter.report("a", 0.5, false, start);
        let state = meter.tick(start + Duration::from_secs(1));
        assert!(state.speaking.is_empty());
    }
}
