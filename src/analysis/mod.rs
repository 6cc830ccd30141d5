pub(crate) mod audio;
pub mod classifier;
pub mod corruption;
pub mod drift;
pub mod nal;
pub mod order;

use bytes::Bytes;

pub use classifier::{keyframe_hint_mismatch, FrameClassification, FrameClassifier, FrameType};
pub use corruption::{CorruptionDetector, CorruptionEvent, CorruptionReason};
pub use drift::{Discontinuity, DriftSample, DriftTracker};
pub use order::{TimestampOrder, TimestampStep};

use crate::config::AnalysisConfig;
use crate::packet::{Codec, PacketRecord, StreamKind};

/// Everything the analysis stages produced for one packet.
#[derive(Debug, Clone)]
pub struct PacketAnalysis {
    pub classification: FrameClassification,
    pub drift: DriftSample,
    pub discontinuity: Option<Discontinuity>,
    pub corruption: Vec<CorruptionEvent>,
    pub hint_mismatch: bool,
    pub unknown_codec: bool,
    /// Slices in this packet counted as P because their header was unreadable.
    pub unresolved_slices: u64,
    /// Payload kept for forensic dumps when the packet raised corruption events.
    pub corrupted_payload: Option<Bytes>,
}

/// The three analysis stages for a single stream kind. Packets of that kind
/// must be fed in arrival order.
#[derive(Debug)]
pub struct StreamAnalyzer {
    stream_kind: StreamKind,
    classifier: FrameClassifier,
    drift: DriftTracker,
    detector: CorruptionDetector,
    retain_payloads: bool,
}

impl StreamAnalyzer {
    pub fn new(stream_kind: StreamKind, config: &AnalysisConfig) -> Self {
        Self {
            stream_kind,
            classifier: FrameClassifier::new(config.codecs.clone()),
            drift: DriftTracker::new(stream_kind, &config.drift),
            detector: CorruptionDetector::new(stream_kind, config),
            retain_payloads: config.corruption.retain_payloads,
        }
    }

    pub fn stream_kind(&self) -> StreamKind {
        self.stream_kind
    }

    pub fn analyze(&mut self, record: PacketRecord) -> PacketAnalysis {
        debug_assert_eq!(record.stream_kind, self.stream_kind);

        let unresolved_before = self.classifier.unresolved_slices();
        let classification = self.classifier.classify(&record);
        let unresolved_slices = self.classifier.unresolved_slices() - unresolved_before;
        let (drift, discontinuity) = self.drift.observe(&record);
        let corruption = self.detector.inspect(&record, &classification);

        let hint_mismatch =
            keyframe_hint_mismatch(record.declared_keyframe, classification.frame_type);
        if hint_mismatch {
            tracing::trace!(
                stream = %self.stream_kind,
                packet = record.id.0,
                hint = ?record.declared_keyframe,
                frame_type = %classification.frame_type,
                "keyframe hint disagrees with payload"
            );
        }

        let corrupted_payload = (self.retain_payloads && !corruption.is_empty())
            .then(|| record.payload.clone());

        PacketAnalysis {
            classification,
            drift,
            discontinuity,
            corruption,
            hint_mismatch,
            unknown_codec: matches!(record.codec, Codec::Unknown(_)),
            unresolved_slices,
            corrupted_payload,
        }
    }
}
