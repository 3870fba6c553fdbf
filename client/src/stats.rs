//! Per-peer statistics sweep.
//!
//! Pulls RTT, jitter and loss out of the peer connection's stats report:
//! RTT from the nominated candidate pair (falling back to remote-inbound
//! RTCP), jitter and fraction-lost from the remote-inbound RTP reports.

use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

use crate::qos::QualitySnapshot;

/// Collect a quality snapshot for one peer connection.
///
/// Before any RTCP has flowed the report carries nothing useful and the
/// snapshot stays `unknown`.
pub async fn collect_quality(pc: &RTCPeerConnection) -> QualitySnapshot {
    let report = pc.get_stats().await;

    let mut rtt_ms: Option<f64> = None;
    let mut jitter_ms: f64 = 0.0;
    let mut loss_ratio: f64 = 0.0;
    let mut measured = false;

    for stat in report.reports.values() {
        match stat {
            StatsReportType::CandidatePair(pair) => {
                if pair.nominated && pair.current_round_trip_time > 0.0 {
                    rtt_ms.get_or_insert(pair.current_round_trip_time * 1000.0);
                    measured = true;
                }
            }
            StatsReportType::RemoteInboundRTP(remote) => {
                measured = true;
                // Worst stream wins; screen video and audio share the pipe.
                jitter_ms = jitter_ms.max(remote.jitter * 1000.0);
                loss_ratio = loss_ratio.max(remote.fraction_lost);
                if rtt_ms.is_none() {
                    if let Some(rtt) = remote.round_trip_time {
                        if rtt > 0.0 {
                            rtt_ms = Some(rtt * 1000.0);
                        }
                    }
                }
            }
            _ => {}
        }
    }

    if !measured {
        return QualitySnapshot::unknown();
    }
    QualitySnapshot::compute(rtt_ms.unwrap_or(0.0), jitter_ms, loss_ratio.clamp(0.0, 1.0))
}
