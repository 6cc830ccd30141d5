use serde::Serialize;

use super::audio::{has_adts_sync, has_mpeg_audio_sync, AdtsHeader};
use super::classifier::{FrameClassification, FrameType};
use super::nal::{split_units, ScanError, VideoCodec};
use super::order::{TimestampOrder, TimestampStep};
use crate::config::{AnalysisConfig, CodecTables, CorruptionConfig};
use crate::packet::{AudioCodec, Codec, PacketId, PacketRecord, StreamKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MarkerFault {
    MissingStartCode,
    MalformedUnitHeader,
    MissingSync,
    InvalidLayer,
    InvalidFrameLength,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceCause {
    StreamReset,
    PriorCorruption,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "kebab-case")]
pub enum CorruptionReason {
    TruncatedPayload {
        declared: Option<usize>,
        available: usize,
    },
    BadStartMarker {
        fault: MarkerFault,
    },
    SliceCountMismatch {
        observed: u32,
        min: u32,
        max: u32,
    },
    ReferenceViolation {
        cause: ReferenceCause,
    },
}

impl CorruptionReason {
    pub fn label(&self) -> &'static str {
        match self {
            CorruptionReason::TruncatedPayload { .. } => "truncated-payload",
            CorruptionReason::BadStartMarker { .. } => "bad-start-marker",
            CorruptionReason::SliceCountMismatch { .. } => "slice-count-mismatch",
            CorruptionReason::ReferenceViolation { .. } => "reference-violation",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CorruptionReason::TruncatedPayload {
                declared: Some(declared),
                available,
            } => format!("unit declares {declared} bytes, {available} available"),
            CorruptionReason::TruncatedPayload {
                declared: None,
                available,
            } => format!("only {available} bytes, below the minimum viable unit"),
            CorruptionReason::BadStartMarker { fault } => format!("start marker fault: {fault:?}"),
            CorruptionReason::SliceCountMismatch { observed, min, max } => {
                format!("{observed} slices, plausible range {min}..={max}")
            }
            CorruptionReason::ReferenceViolation { cause } => {
                format!("inter frame without an intervening I frame after {cause:?}")
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorruptionEvent {
    pub packet: PacketId,
    pub stream_kind: StreamKind,
    pub frame_type: FrameType,
    #[serde(flatten)]
    pub reason: CorruptionReason,
    pub offset_in_payload: Option<usize>,
    pub timestamp_ms: f64,
}

type Fault = (CorruptionReason, Option<usize>);

/// Structural integrity checks for one stream kind, with the decode order
/// and outcome of earlier packets as context.
#[derive(Debug)]
pub struct CorruptionDetector {
    stream_kind: StreamKind,
    config: CorruptionConfig,
    tables: CodecTables,
    order: TimestampOrder,
    awaiting_intra: Option<ReferenceCause>,
}

impl CorruptionDetector {
    pub fn new(stream_kind: StreamKind, config: &AnalysisConfig) -> Self {
        Self {
            stream_kind,
            config: config.corruption.clone(),
            tables: config.codecs.clone(),
            order: TimestampOrder::new(&config.drift),
            awaiting_intra: None,
        }
    }

    pub fn inspect(
        &mut self,
        record: &PacketRecord,
        classification: &FrameClassification,
    ) -> Vec<CorruptionEvent> {
        let pts_ms = record.timestamp_ms();
        if self.order.observe(record).0 == TimestampStep::Backward {
            self.awaiting_intra.get_or_insert(ReferenceCause::StreamReset);
        }

        let frame_type = classification.frame_type;
        let fault = match self.check_structure(record) {
            Some(fault) => {
                self.awaiting_intra = Some(ReferenceCause::PriorCorruption);
                Some(fault)
            }
            None if frame_type == FrameType::I => {
                self.awaiting_intra = None;
                None
            }
            None if frame_type.is_inter() => self
                .awaiting_intra
                .map(|cause| (CorruptionReason::ReferenceViolation { cause }, None)),
            None => None,
        };

        let Some((reason, offset_in_payload)) = fault else {
            return Vec::new();
        };

        tracing::debug!(
            stream = %self.stream_kind,
            packet = record.id.0,
            frame_type = %frame_type,
            reason = reason.label(),
            offset = ?offset_in_payload,
            "corruption detected"
        );

        vec![CorruptionEvent {
            packet: record.id,
            stream_kind: self.stream_kind,
            frame_type,
            reason,
            offset_in_payload,
            timestamp_ms: pts_ms,
        }]
    }

    fn check_structure(&self, record: &PacketRecord) -> Option<Fault> {
        match &record.codec {
            Codec::H264 => self.check_video(VideoCodec::H264, &record.payload),
            Codec::H265 => self.check_video(VideoCodec::H265, &record.payload),
            Codec::Audio(codec) => self.check_audio(codec, &record.payload),
            Codec::Unknown(_) => None,
        }
    }

    fn check_video(&self, codec: VideoCodec, payload: &[u8]) -> Option<Fault> {
        let min_size = match codec {
            VideoCodec::H264 => self.config.min_h264_unit_size,
            VideoCodec::H265 => self.config.min_h265_unit_size,
        };
        if payload.len() < min_size {
            return Some(truncated(None, payload.len(), None));
        }

        let units = match split_units(payload) {
            Ok((_, units)) => units,
            Err(ScanError::NoStartCode) => {
                return Some((
                    CorruptionReason::BadStartMarker {
                        fault: MarkerFault::MissingStartCode,
                    },
                    Some(0),
                ))
            }
            Err(ScanError::LengthOverrun {
                offset,
                declared,
                available,
            }) => return Some(truncated(Some(declared), available, Some(offset))),
        };

        let header_len = codec.header_len();
        let table = codec.table(&self.tables);
        let mut slices = 0u32;
        for unit in &units {
            let Some(header) = codec.parse_header(unit.data) else {
                return Some(truncated(None, unit.data.len(), Some(unit.offset)));
            };
            if header.malformed {
                return Some((
                    CorruptionReason::BadStartMarker {
                        fault: MarkerFault::MalformedUnitHeader,
                    },
                    Some(unit.offset),
                ));
            }
            if table.class_of(header.unit_type).is_slice() {
                if unit.data.len() <= header_len {
                    return Some(truncated(None, unit.data.len(), Some(unit.offset)));
                }
                slices += 1;
            }
        }

        if slices == 0 {
            return None;
        }
        let min = self.config.min_slices;
        let size_cap = 1 + payload.len() / self.config.min_bytes_per_slice.max(1);
        let max = self
            .config
            .max_slices
            .min(u32::try_from(size_cap).unwrap_or(u32::MAX))
            .max(min);
        if slices < min || slices > max {
            return Some((
                CorruptionReason::SliceCountMismatch {
                    observed: slices,
                    min,
                    max,
                },
                None,
            ));
        }
        None
    }

    fn check_audio(&self, codec: &AudioCodec, payload: &[u8]) -> Option<Fault> {
        if payload.len() < self.config.min_audio_unit_size {
            return Some(truncated(None, payload.len(), None));
        }
        match codec {
            AudioCodec::Aac if has_adts_sync(payload) => check_adts(payload),
            AudioCodec::Mpeg if !has_mpeg_audio_sync(payload) => Some((
                CorruptionReason::BadStartMarker {
                    fault: MarkerFault::MissingSync,
                },
                Some(0),
            )),
            _ => None,
        }
    }
}

/// Walks concatenated ADTS frames, checking each header against the bytes left.
fn check_adts(payload: &[u8]) -> Option<Fault> {
    let mut pos = 0;
    while pos < payload.len() {
        let rest = &payload[pos..];
        if !has_adts_sync(rest) {
            return Some(marker(MarkerFault::MissingSync, pos));
        }
        let Some(header) = AdtsHeader::parse(rest) else {
            return Some(truncated(Some(AdtsHeader::MIN_LEN), rest.len(), Some(pos)));
        };
        if header.layer != 0 {
            return Some(marker(MarkerFault::InvalidLayer, pos));
        }
        if header.frame_length < header.header_len() {
            return Some(marker(MarkerFault::InvalidFrameLength, pos));
        }
        if header.frame_length > rest.len() {
            return Some(truncated(Some(header.frame_length), rest.len(), Some(pos)));
        }
        pos += header.frame_length;
    }
    None
}

fn truncated(declared: Option<usize>, available: usize, offset: Option<usize>) -> Fault {
    (
        CorruptionReason::TruncatedPayload {
            declared,
            available,
        },
        offset,
    )
}

fn marker(fault: MarkerFault, offset: usize) -> Fault {
    (CorruptionReason::BadStartMarker { fault }, Some(offset))
}
