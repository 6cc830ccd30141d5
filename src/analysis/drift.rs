use serde::Serialize;

use super::order::{TimestampOrder, TimestampStep};
use crate::config::DriftConfig;
use crate::packet::{PacketId, PacketRecord, StreamKind};

#[derive(Debug, Clone, Serialize)]
pub struct DriftSample {
    pub stream_kind: StreamKind,
    pub sequence_index: u64,
    pub packet: PacketId,
    pub timestamp_ms: f64,
    pub expected_offset_ms: f64,
    pub observed_offset_ms: f64,
    /// Positive when the packet arrived later than its presentation time implies.
    pub drift_ms: f64,
    pub step: TimestampStep,
    pub discontinuity: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscontinuityKind {
    Backward,
    ForwardJump,
}

#[derive(Debug, Clone, Serialize)]
pub struct Discontinuity {
    pub stream_kind: StreamKind,
    pub sequence_index: u64,
    pub packet: PacketId,
    /// Decode time when the packets carry a DTS, presentation time otherwise.
    pub previous_ms: f64,
    pub timestamp_ms: f64,
    pub kind: DiscontinuityKind,
}

#[derive(Debug, Clone, Copy)]
struct Baseline {
    origin_arrival_ms: f64,
    anchor_ms: f64,
    anchor_expected_ms: f64,
}

/// Running comparison of media time against arrival time for one stream kind.
/// Media time is the decode timestamp when present, since packets arrive in
/// decode order.
#[derive(Debug)]
pub struct DriftTracker {
    stream_kind: StreamKind,
    order: TimestampOrder,
    baseline: Option<Baseline>,
    next_index: u64,
}

impl DriftTracker {
    pub fn new(stream_kind: StreamKind, config: &DriftConfig) -> Self {
        Self {
            stream_kind,
            order: TimestampOrder::new(config),
            baseline: None,
            next_index: 0,
        }
    }

    pub fn observe(&mut self, record: &PacketRecord) -> (DriftSample, Option<Discontinuity>) {
        let media_ms = record.decode_ms();
        let arrival_ms = record.arrival_ms();
        let sequence_index = self.next_index;
        self.next_index += 1;

        let (step, previous_ms) = self.order.observe(record);
        let baseline = self.baseline.get_or_insert(Baseline {
            origin_arrival_ms: arrival_ms,
            anchor_ms: media_ms,
            anchor_expected_ms: 0.0,
        });
        let observed_offset_ms = arrival_ms - baseline.origin_arrival_ms;

        let kind = match step {
            TimestampStep::Backward => Some(DiscontinuityKind::Backward),
            TimestampStep::ForwardJump => Some(DiscontinuityKind::ForwardJump),
            TimestampStep::First | TimestampStep::Advance | TimestampStep::Reordered => None,
        };

        let discontinuity = kind.map(|kind| {
            baseline.anchor_ms = media_ms;
            baseline.anchor_expected_ms = observed_offset_ms;
            tracing::debug!(
                stream = %self.stream_kind,
                packet = record.id.0,
                previous_ms,
                timestamp_ms = media_ms,
                ?kind,
                "timestamp discontinuity, drift baseline reset"
            );
            Discontinuity {
                stream_kind: self.stream_kind,
                sequence_index,
                packet: record.id,
                previous_ms,
                timestamp_ms: media_ms,
                kind,
            }
        });

        let expected_offset_ms = baseline.anchor_expected_ms + (media_ms - baseline.anchor_ms);
        let sample = DriftSample {
            stream_kind: self.stream_kind,
            sequence_index,
            packet: record.id,
            timestamp_ms: record.timestamp_ms(),
            expected_offset_ms,
            observed_offset_ms,
            drift_ms: observed_offset_ms - expected_offset_ms,
            step,
            discontinuity: step.is_discontinuity(),
        };

        (sample, discontinuity)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;
    use crate::packet::Codec;

    fn video(id: u64, pts_ms: i64, arrival_ms: u64) -> PacketRecord {
        PacketRecord {
            id: PacketId(id),
            stream_kind: StreamKind::Video,
            codec: Codec::H264,
            payload: Bytes::new(),
            pts: pts_ms * 90,
            dts: None,
            clock_rate: 90_000,
            arrival: Duration::from_millis(arrival_ms),
            declared_keyframe: None,
            stream_offset: 0,
        }
    }

    fn run(tracker: &mut DriftTracker, packets: &[(i64, u64)]) -> Vec<DriftSample> {
        packets
            .iter()
            .enumerate()
            .map(|(i, &(pts, arrival))| tracker.observe(&video(i as u64, pts, arrival)).0)
            .collect()
    }

    #[test]
    fn test_drift_scenario() {
        let mut tracker = DriftTracker::new(StreamKind::Video, &DriftConfig::default());
        let samples = run(
            &mut tracker,
            &[(0, 0), (40, 45), (80, 80), (120, 130), (160, 165)],
        );
        let drift: Vec<f64> = samples.iter().map(|s| s.drift_ms).collect();
        assert_eq!(drift, vec![0.0, 5.0, 0.0, 10.0, 5.0]);
        let indices: Vec<u64> = samples.iter().map(|s| s.sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_baseline_uses_first_packet() {
        let mut tracker = DriftTracker::new(StreamKind::Video, &DriftConfig::default());
        let samples = run(&mut tracker, &[(5_000, 1_000), (5_040, 1_040), (5_080, 1_080)]);
        assert!(samples.iter().all(|s| s.drift_ms.abs() < 1e-9));
    }

    #[test]
    fn test_backward_timestamp_resets_baseline() {
        let mut tracker = DriftTracker::new(StreamKind::Video, &DriftConfig::default());
        let packets = [(1_000, 0), (1_040, 50), (1_080, 100), (0, 150), (40, 190)];
        let mut discontinuities = Vec::new();
        let mut samples = Vec::new();
        for (i, &(pts, arrival)) in packets.iter().enumerate() {
            let (sample, discontinuity) = tracker.observe(&video(i as u64, pts, arrival));
            samples.push(sample);
            discontinuities.extend(discontinuity);
        }

        assert_eq!(discontinuities.len(), 1);
        assert_eq!(discontinuities[0].kind, DiscontinuityKind::Backward);
        assert_eq!(discontinuities[0].sequence_index, 3);
        assert!(samples[3].discontinuity);
        assert_eq!(samples[2].drift_ms, 20.0);
        assert_eq!(samples[3].drift_ms, 0.0);
        assert_eq!(samples[4].drift_ms, 0.0);
        assert_eq!(samples[4].observed_offset_ms, 190.0);
    }

    #[test]
    fn test_forward_jump_beyond_tolerance() {
        let config = DriftConfig {
            discontinuity_tolerance_ms: 500.0,
            ..DriftConfig::default()
        };
        let mut tracker = DriftTracker::new(StreamKind::Video, &config);
        let (_, first) = tracker.observe(&video(0, 0, 0));
        let (_, within) = tracker.observe(&video(1, 400, 40));
        let (sample, jump) = tracker.observe(&video(2, 10_400, 80));

        assert!(first.is_none());
        assert!(within.is_none());
        assert_eq!(jump.map(|d| d.kind), Some(DiscontinuityKind::ForwardJump));
        assert_eq!(sample.drift_ms, 0.0);
    }

    #[test]
    fn test_constant_cadence_has_no_drift() {
        let mut tracker = DriftTracker::new(StreamKind::Video, &DriftConfig::default());
        let packets: Vec<(i64, u64)> = (0..300).map(|i| (i * 33, i as u64 * 33)).collect();
        let samples = run(&mut tracker, &packets);
        assert!(samples.iter().skip(1).all(|s| s.drift_ms.abs() < 1e-6));
    }

    #[test]
    fn test_reordered_b_frames_keep_baseline() {
        let mut tracker = DriftTracker::new(StreamKind::Video, &DriftConfig::default());
        // I P B B P B B in decode order, one packet every 40 ms
        let gop = [(0, -40), (120, 0), (40, 40), (80, 80), (240, 120), (160, 160), (200, 200)];
        let mut samples = Vec::new();
        for (i, &(pts, dts)) in gop.iter().enumerate() {
            let mut rec = video(i as u64, pts, i as u64 * 40);
            rec.dts = Some(dts * 90);
            let (sample, discontinuity) = tracker.observe(&rec);
            assert!(discontinuity.is_none(), "packet {i}");
            samples.push(sample);
        }
        assert!(samples.iter().all(|s| s.drift_ms.abs() < 1e-9));
        assert_eq!(samples[2].timestamp_ms, 40.0);

        // without a DTS the reordered frames still do not reset anything
        let mut tracker = DriftTracker::new(StreamKind::Video, &DriftConfig::default());
        for (i, &(pts, _)) in gop.iter().enumerate() {
            let (_, discontinuity) = tracker.observe(&video(i as u64, pts, i as u64 * 40));
            assert!(discontinuity.is_none(), "packet {i}");
        }
    }

    #[test]
    fn test_late_arrivals_never_decrease_drift() {
        let mut tracker = DriftTracker::new(StreamKind::Video, &DriftConfig::default());
        let mut arrival = 0;
        let mut packets = Vec::new();
        for i in 0..120i64 {
            packets.push((i * 40, arrival));
            arrival += if i % 5 == 4 { 80 } else { 40 };
        }
        let samples = run(&mut tracker, &packets);
        assert!(samples.windows(2).all(|w| w[1].drift_ms >= w[0].drift_ms));
        assert!(samples.last().unwrap().drift_ms > 0.0);
        assert!(samples.iter().all(|s| !s.discontinuity));
    }
}
