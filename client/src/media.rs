//! Local media tracks.
//!
//! The session owns one replaceable Opus audio track plus optional VP9
//! screen-share tracks. The embedding application packetizes captured
//! audio/video into RTP and feeds it through the writers; mute is an
//! enable flag the audio writer observes, so it never renegotiates.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;

use crate::qos::ScreenQosProfile;

/// Audio configuration constants
pub const SAMPLE_RATE: u32 = 48000;
pub const CHANNELS: u16 = 2;
pub const FRAME_SIZE_MS: usize = 20;
pub const FRAME_SIZE: usize = (SAMPLE_RATE as usize * FRAME_SIZE_MS) / 1000;

/// Media errors
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Track error: {0}")]
    Track(String),
    #[error("Screen share is not active")]
    ScreenShareInactive,
    #[error("Screen share is already active")]
    ScreenShareActive,
}

/// Opus capability shared by every audio track in the mesh.
#[must_use]
pub fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: SAMPLE_RATE,
        channels: CHANNELS,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// VP9 capability for screen-share video.
#[must_use]
pub fn vp9_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/VP9".to_string(),
        clock_rate: 90000,
        channels: 0,
        sdp_fmtp_line: "profile-id=0".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Write handle for captured, packetized audio.
///
/// Mute drops frames here instead of detaching the sender, which keeps
/// the m-line stable and avoids renegotiation.
#[derive(Clone)]
pub struct AudioWriter {
    track: Arc<TrackLocalStaticRTP>,
    enabled: Arc<AtomicBool>,
}

impl AudioWriter {
    /// Write one RTP packet of Opus audio. Silently dropped while muted.
    pub async fn write(&self, rtp: &[u8]) -> Result<(), MediaError> {
        if !self.enabled.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.track
            .write(rtp)
            .await
            .map(|_| ())
            .map_err(|e| MediaError::Track(e.to_string()))
    }
}

/// Active screen-share track pair.
#[derive(Clone)]
pub struct ScreenTracks {
    pub video: Arc<TrackLocalStaticRTP>,
    pub audio: Option<Arc<TrackLocalStaticRTP>>,
}

/// The session's local track set.
pub struct LocalMedia {
    audio_track: Arc<TrackLocalStaticRTP>,
    audio_enabled: Arc<AtomicBool>,
    deafened_tx: watch::Sender<bool>,
    qos_tx: watch::Sender<ScreenQosProfile>,
    screen: Option<ScreenTracks>,
}

impl LocalMedia {
    #[must_use]
    pub fn new() -> Self {
        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            "audio".to_string(),
            "concord-voice".to_string(),
        ));
        let (deafened_tx, _) = watch::channel(false);
        let (qos_tx, _) = watch::channel(ScreenQosProfile::High);
        Self {
            audio_track,
            audio_enabled: Arc::new(AtomicBool::new(true)),
            deafened_tx,
            qos_tx,
            screen: None,
        }
    }

    #[must_use]
    pub fn audio_track(&self) -> Arc<TrackLocalStaticRTP> {
        self.audio_track.clone()
    }

    /// Writer for the capture pipeline.
    #[must_use]
    pub fn audio_writer(&self) -> AudioWriter {
        AudioWriter {
            track: self.audio_track.clone(),
            enabled: self.audio_enabled.clone(),
        }
    }

    /// Swap in a new audio track (e.g. microphone switch). The caller
    /// re-points every peer's sender at it; no renegotiation happens.
    pub fn replace_audio_track(&mut self) -> Arc<TrackLocalStaticRTP> {
        self.audio_track = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            "audio".to_string(),
            "concord-voice".to_string(),
        ));
        self.audio_track.clone()
    }

    pub fn set_muted(&self, muted: bool) {
        self.audio_enabled.store(!muted, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        !self.audio_enabled.load(Ordering::Relaxed)
    }

    /// Observed by the embedder's playback pipeline: `true` silences all
    /// inbound audio elements locally.
    #[must_use]
    pub fn deafened_watch(&self) -> watch::Receiver<bool> {
        self.deafened_tx.subscribe()
    }

    pub fn set_deafened(&self, deafened: bool) {
        let _ = self.deafened_tx.send(deafened);
        if deafened {
            // Deafen forces mute.
            self.set_muted(true);
        }
    }

    /// Observed by the capture pipeline: fps/resolution caps for the
    /// outbound screen track. Changing the profile never renegotiates.
    #[must_use]
    pub fn screen_qos_watch(&self) -> watch::Receiver<ScreenQosProfile> {
        self.qos_tx.subscribe()
    }

    pub fn apply_screen_profile(&self, profile: ScreenQosProfile) {
        let _ = self.qos_tx.send(profile);
    }

    /// Create the screen-share tracks.
    pub fn start_screen(&mut self, system_audio: bool) -> Result<(), MediaError> {
        if self.screen.is_some() {
            return Err(MediaError::ScreenShareActive);
        }
        let video = Arc::new(TrackLocalStaticRTP::new(
            vp9_capability(),
            "screen-video".to_string(),
            "concord-screen".to_string(),
        ));
        let audio = system_audio.then(|| {
            Arc::new(TrackLocalStaticRTP::new(
                opus_capability(),
                "screen-audio".to_string(),
                "concord-screen".to_string(),
            ))
        });
        self.screen = Some(ScreenTracks { video, audio });
        Ok(())
    }

    pub fn stop_screen(&mut self) -> Result<(), MediaError> {
        self.screen
            .take()
            .map(|_| ())
            .ok_or(MediaError::ScreenShareInactive)
    }

    #[must_use]
    pub fn screen(&self) -> Option<&ScreenTracks> {
        self.screen.as_ref()
    }

    #[must_use]
    pub fn is_screen_sharing(&self) -> bool {
        self.screen.is_some()
    }
}

impl Default for LocalMedia {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mute_toggles_round_trip() {
        let media = LocalMedia::new();
        assert!(!media.is_muted());
        media.set_muted(true);
        assert!(media.is_muted());
        media.set_muted(false);
        assert!(!media.is_muted());
    }

    #[test]
    fn deafen_forces_mute() {
        let media = LocalMedia::new();
        media.set_deafened(true);
        assert!(media.is_muted());
        assert!(*media.deafened_watch().borrow());

        // Undeafen does not silently unmute.
        media.set_deafened(false);
        assert!(media.is_muted());
    }

    #[test]
    fn screen_share_lifecycle() {
        let mut media = LocalMedia::new();
        assert!(!media.is_screen_sharing());
        assert!(media.start_screen(true).is_ok());
        assert!(media.screen().unwrap().audio.is_some());
        assert!(matches!(
            media.start_screen(false),
            Err(MediaError::ScreenShareActive)
        ));
        assert!(media.stop_screen().is_ok());
        assert!(matches!(
            media.stop_screen(),
            Err(MediaError::ScreenShareInactive)
        ));
    }

    #[test]
    fn frame_size_matches_20ms_at_48khz() {
        assert_eq!(FRAME_SIZE, 960);
    }
}
