//! Connection quality scoring and adaptive screen-share QoS.
//!
//! A periodic stats sweep produces a [`QualitySnapshot`] per peer; while
//! screen-sharing, the [`ScreenQosController`] maps the worst observed
//! quality onto a capture profile. Profile changes apply through track
//! constraints and never renegotiate a connection.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Loss ratio at which a connection is considered poor outright,
/// regardless of the blended score.
const SEVERE_LOSS_RATIO: f64 = 0.10;

/// Quality classification of one peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTag {
    Good,
    Fair,
    Poor,
    Unknown,
}

/// Latest quality measurement for one peer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySnapshot {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    pub loss_ratio: f64,
    /// Blended 0-100 score.
    pub score: u8,
    pub tag: QualityTag,
}

impl QualitySnapshot {
    /// Placeholder before the first stats sweep completes.
    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            rtt_ms: 0.0,
            jitter_ms: 0.0,
            loss_ratio: 0.0,
            score: 0,
            tag: QualityTag::Unknown,
        }
    }

    /// Score the raw measurements.
    ///
    /// Starts at 100, penalized by RTT (up to 35), jitter (up to 25) and
    /// loss (up to 40). Severe loss forces the `poor` tag even when the
    /// blended score stays above the threshold.
    #[must_use]
    pub fn compute(rtt_ms: f64, jitter_ms: f64, loss_ratio: f64) -> Self {
        let rtt_penalty = 35.0 * (rtt_ms / 400.0).clamp(0.0, 1.0);
        let jitter_penalty = 25.0 * (jitter_ms / 100.0).clamp(0.0, 1.0);
        let loss_penalty = 40.0 * (loss_ratio / SEVERE_LOSS_RATIO).clamp(0.0, 1.0);

        let score = (100.0 - rtt_penalty - jitter_penalty - loss_penalty).clamp(0.0, 100.0) as u8;

        let tag = if loss_ratio >= SEVERE_LOSS_RATIO {
            QualityTag::Poor
        } else if score >= 70 {
            QualityTag::Good
        } else if score >= 40 {
            QualityTag::Fair
        } else {
            QualityTag::Poor
        };

        Self {
            rtt_ms,
            jitter_ms,
            loss_ratio,
            score,
            tag,
        }
    }
}

/// Screen-share capture profile: frame rate and resolution caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScreenQosProfile {
    /// 1920x1080 @ 30fps - healthy mesh.
    #[default]
    High,
    /// 1600x900 @ 18fps - at least one fair or unmeasured peer.
    Balanced,
    /// 1280x720 @ 12fps - at least one poor peer.
    Low,
}

impl ScreenQosProfile {
    /// Maximum capture width in pixels for this profile.
    #[must_use]
    pub const fn max_width(self) -> u32 {
        match self {
            Self::High => 1920,
            Self::Balanced => 1600,
            Self::Low => 1280,
        }
    }

    /// Maximum capture height in pixels for this profile.
    #[must_use]
    pub const fn max_height(self) -> u32 {
        match self {
            Self::High => 1080,
            Self::Balanced => 900,
            Self::Low => 720,
        }
    }

    /// Maximum frames per second for this profile.
    #[must_use]
    pub const fn max_fps(self) -> u32 {
        match self {
            Self::High => 30,
            Self::Balanced => 18,
            Self::Low => 12,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Balanced => "balanced",
            Self::Low => "low",
        }
    }
}

/// Pick the profile for the current mesh quality.
#[must_use]
pub fn select_profile(peers: &[QualitySnapshot]) -> ScreenQosProfile {
    if peers.is_empty() {
        return ScreenQosProfile::High;
    }
    let lowest = peers.iter().map(|q| q.score).min().unwrap_or(100);
    if peers.iter().any(|q| q.tag == QualityTag::Poor) || lowest <= 35 {
        ScreenQosProfile::Low
    } else if peers
        .iter()
        .any(|q| matches!(q.tag, QualityTag::Fair | QualityTag::Unknown))
        || lowest <= 65
    {
        ScreenQosProfile::Balanced
    } else {
        ScreenQosProfile::High
    }
}

/// Applies profile selection with an anti-thrash cooldown.
#[derive(Debug)]
pub struct ScreenQosController {
    current: ScreenQosProfile,
    last_change: Option<Instant>,
    cooldown: Duration,
}

impl Default for ScreenQosController {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ScreenQosController {
    #[must_use]
    pub fn new(cooldown: Duration) -> Self {
        Self {
            current: ScreenQosProfile::High,
            last_change: None,
            cooldown,
        }
    }

    /// Reset for a fresh share. Sharing starts at `high`; the cooldown
    /// clock starts immediately so the first sweep cannot thrash.
    pub fn begin(&mut self, now: Instant) {
        self.current = ScreenQosProfile::High;
        self.last_change = Some(now);
    }

    #[must_use]
    pub const fn current(&self) -> ScreenQosProfile {
        self.current
    }

    /// Re-evaluate against the latest sweep. Returns the new profile only
    /// when it changed and the cooldown has elapsed.
    pub fn evaluate(
        &mut self,
        peers: &[QualitySnapshot],
        now: Instant,
    ) -> Option<ScreenQosProfile> {
        if let Some(last) = self.last_change {
            if now.duration_since(last) < self.cooldown {
                return None;
            }
        }
        let target = select_profile(peers);
        if target == self.current {
            return None;
        }
        self.current = target;
        self.last_change = Some(now);
        Some(target)
    }
}
