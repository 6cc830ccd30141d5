use std::sync::Arc;

use crate::analysis::StreamAnalyzer;
use crate::config::AnalysisConfig;
use crate::packet::{Normalizer, PerKind, RawPacket, StreamKind};
use crate::session::{Aggregator, AnalysisSession, FinishReason, SessionError};

/// Runs every stage inline on the caller's thread.
///
/// ```
/// use std::time::Duration;
///
/// use bytes::Bytes;
/// use streamripper::{AnalysisConfig, Analyzer, FinishReason, RawPacket, StreamKind};
///
/// let mut analyzer = Analyzer::new(AnalysisConfig::with_duration(Duration::from_secs(10)));
/// analyzer
///     .submit(RawPacket {
///         stream_kind: StreamKind::Video,
///         codec: "h264".into(),
///         payload: Bytes::from_static(&[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21]),
///         pts: Some(0),
///         dts: None,
///         clock_rate: 90_000,
///         arrival: Duration::ZERO,
///         keyframe: Some(true),
///     })
///     .unwrap();
/// let session = analyzer.finish(FinishReason::SourceEnded);
/// assert_eq!(session.stats.video.frame_types().i, 1);
/// ```
#[derive(Debug)]
pub struct Analyzer {
    normalizer: Normalizer,
    streams: PerKind<StreamAnalyzer>,
    aggregator: Aggregator,
}

impl Analyzer {
    pub fn new(config: AnalysisConfig) -> Self {
        Self {
            normalizer: Normalizer::new(),
            streams: PerKind {
                video: StreamAnalyzer::new(StreamKind::Video, &config),
                audio: StreamAnalyzer::new(StreamKind::Audio, &config),
            },
            aggregator: Aggregator::new(&config),
        }
    }

    /// Analyzes one packet. Packets without a timestamp are counted and
    /// skipped rather than rejected.
    pub fn submit(&mut self, raw: RawPacket) -> Result<(), SessionError> {
        if self.aggregator.is_closed() {
            return Err(SessionError::Closed);
        }

        let record = match self.normalizer.normalize(raw) {
            Ok(record) => record,
            Err(e) => {
                tracing::debug!("dropping packet: {}", e);
                return self.aggregator.record_dropped(1);
            }
        };

        let analysis = self.streams.get_mut(record.stream_kind).analyze(record);
        self.aggregator.record(analysis)
    }

    pub fn session(&self) -> &AnalysisSession {
        self.aggregator.session()
    }

    pub fn is_closed(&self) -> bool {
        self.aggregator.is_closed()
    }

    pub fn finish(&mut self, reason: FinishReason) -> Arc<AnalysisSession> {
        self.aggregator.finalize(reason)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use proptest::prelude::*;

    use super::*;
    use crate::analysis::audio::adts_frame;
    use crate::analysis::classifier::tests::{annex_b, B_SLICE, IDR_SLICE, P_SLICE, PPS, SPS};
    use crate::analysis::FrameType;

    fn raw(kind: StreamKind, codec: &str, payload: Vec<u8>, pts_ms: i64, arrival_ms: u64) -> RawPacket {
        RawPacket {
            stream_kind: kind,
            codec: codec.to_string(),
            payload: Bytes::from(payload),
            pts: Some(pts_ms * 90),
            dts: None,
            clock_rate: 90_000,
            arrival: Duration::from_millis(arrival_ms),
            keyframe: None,
        }
    }

    fn analyzer() -> Analyzer {
        Analyzer::new(AnalysisConfig::with_duration(Duration::from_secs(60)))
    }

    #[test]
    fn test_idr_at_offset_four_in_large_payload() {
        let mut payload = annex_b(&[&IDR_SLICE]);
        payload.resize(200, 0x5A);

        let mut analyzer = analyzer();
        analyzer
            .submit(raw(StreamKind::Video, "H264", payload, 0, 0))
            .unwrap();
        let session = analyzer.finish(FinishReason::SourceEnded);

        assert_eq!(session.classifications[0].frame_type, FrameType::I);
        assert_eq!(session.classifications[0].size_bytes, 200);
        assert!(session.corruption.is_empty());
    }

    #[test]
    fn test_drift_series_from_raw_packets() {
        let mut analyzer = analyzer();
        let pts = [0, 40, 80, 120, 160];
        let arrivals = [0, 45, 80, 130, 165];
        for (i, (&pts, &arrival)) in pts.iter().zip(&arrivals).enumerate() {
            let unit: &[u8] = if i == 0 { &IDR_SLICE } else { &P_SLICE };
            analyzer
                .submit(raw(StreamKind::Video, "h264", annex_b(&[unit]), pts, arrival))
                .unwrap();
        }

        let drift: Vec<f64> = analyzer
            .session()
            .drift
            .video
            .iter()
            .map(|s| s.drift_ms)
            .collect();
        assert_eq!(drift, vec![0.0, 5.0, 0.0, 10.0, 5.0]);
    }

    #[test]
    fn test_gop_with_audio_interleaved() {
        let mut analyzer = analyzer();
        let gop: [&[u8]; 4] = [&IDR_SLICE, &B_SLICE, &P_SLICE, &B_SLICE];
        for (i, unit) in gop.iter().enumerate() {
            let i = i as i64;
            let payload = if i == 0 {
                annex_b(&[&SPS, &PPS, unit])
            } else {
                annex_b(&[unit])
            };
            analyzer
                .submit(raw(StreamKind::Video, "h264", payload, i * 40, i as u64 * 40))
                .unwrap();
            analyzer
                .submit(raw(StreamKind::Audio, "aac", adts_frame(64), i * 21, i as u64 * 21))
                .unwrap();
        }

        let session = analyzer.finish(FinishReason::SourceEnded);
        let video = session.stats.video.frame_types();
        assert_eq!((video.i, video.p, video.b), (1, 1, 2));
        assert_eq!(session.stats.audio.frame_types().audio, 4);
        assert!(session.corruption.is_empty());
        let ids: Vec<u64> = session.classifications.iter().map(|c| c.packet.0).collect();
        assert_eq!(ids, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_b_frames_in_decode_order() {
        // I P B B P B B as transmitted, 25 fps
        let units: [&[u8]; 7] = [&IDR_SLICE, &P_SLICE, &B_SLICE, &B_SLICE, &P_SLICE, &B_SLICE, &B_SLICE];
        let pts = [0, 120, 40, 80, 240, 160, 200];

        for with_dts in [false, true] {
            let mut analyzer = analyzer();
            for (i, (unit, &pts)) in units.iter().zip(&pts).enumerate() {
                let payload = if i == 0 {
                    annex_b(&[&SPS, &PPS, unit])
                } else {
                    annex_b(&[unit])
                };
                let mut packet = raw(StreamKind::Video, "h264", payload, pts, i as u64 * 40);
                if with_dts {
                    packet.dts = Some((i as i64 * 40 - 40) * 90);
                }
                analyzer.submit(packet).unwrap();
            }

            let session = analyzer.finish(FinishReason::SourceEnded);
            let video = session.stats.video.frame_types();
            assert_eq!((video.i, video.p, video.b), (1, 2, 4));
            assert!(session.corruption.is_empty(), "{:?}", session.corruption);
            assert!(session.discontinuities.is_empty());
            assert_eq!(session.stats.video.summary().non_monotonic_timestamps, 0);
            if with_dts {
                assert!(session.drift.video.iter().all(|s| s.drift_ms == 0.0));
            }
        }
    }

    #[test]
    fn test_untimed_packets_are_counted_not_analyzed() {
        let mut analyzer = analyzer();
        let mut untimed = raw(StreamKind::Video, "h264", annex_b(&[&IDR_SLICE]), 0, 0);
        untimed.pts = None;
        analyzer.submit(untimed).unwrap();
        analyzer
            .submit(raw(StreamKind::Video, "h264", annex_b(&[&IDR_SLICE]), 0, 0))
            .unwrap();

        let session = analyzer.finish(FinishReason::SourceEnded);
        assert_eq!(session.dropped_untimed, 1);
        assert_eq!(session.classifications.len(), 1);
        assert_eq!(session.classifications[0].packet.0, 0);
    }

    #[test]
    fn test_truncated_payload_is_reported() {
        let mut analyzer = analyzer();
        analyzer
            .submit(raw(StreamKind::Video, "h264", vec![0, 0], 0, 0))
            .unwrap();
        let session = analyzer.finish(FinishReason::SourceEnded);
        assert_eq!(session.corruption.len(), 1);
        assert_eq!(session.corruption[0].reason.label(), "truncated-payload");
    }

    #[test]
    fn test_duration_bound_closes_session() {
        let mut analyzer = Analyzer::new(AnalysisConfig::with_duration(Duration::from_millis(50)));
        analyzer
            .submit(raw(StreamKind::Video, "h264", annex_b(&[&IDR_SLICE]), 0, 0))
            .unwrap();
        let err = analyzer
            .submit(raw(StreamKind::Video, "h264", annex_b(&[&P_SLICE]), 80, 80))
            .unwrap_err();
        assert!(matches!(err, SessionError::DurationElapsed { .. }));
        assert!(analyzer.is_closed());

        let err = analyzer
            .submit(raw(StreamKind::Video, "h264", annex_b(&[&P_SLICE]), 120, 120))
            .unwrap_err();
        assert_eq!(err, SessionError::Closed);
        assert_eq!(analyzer.session().total_packets(), 1);
    }

    proptest! {
        #[test]
        fn prop_counts_sum_to_packets(kinds in proptest::collection::vec(any::<bool>(), 0..200)) {
            let mut analyzer = analyzer();
            let mut per_kind = PerKind::<i64>::default();
            for (i, &is_video) in kinds.iter().enumerate() {
                let (kind, codec, payload) = if is_video {
                    (StreamKind::Video, "h264", annex_b(&[&P_SLICE]))
                } else {
                    (StreamKind::Audio, "aac", adts_frame(32))
                };
                let n = per_kind.get_mut(kind);
                analyzer.submit(raw(kind, codec, payload, *n * 20, i as u64)).unwrap();
                *n += 1;
            }

            let session = analyzer.finish(FinishReason::SourceEnded);
            prop_assert_eq!(session.total_packets(), kinds.len() as u64);
            prop_assert_eq!(session.classifications.len(), kinds.len());
            for kind in StreamKind::ALL {
                let stats = session.stats.get(kind);
                prop_assert_eq!(stats.frame_types().total(), stats.packets());
                prop_assert_eq!(stats.drift_samples(), stats.packets());
                prop_assert_eq!(stats.packets(), *per_kind.get(kind) as u64);
            }
        }
    }
}
