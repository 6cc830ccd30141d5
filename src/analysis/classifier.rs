use std::collections::HashMap;
use std::fmt;

use h264_reader::rbsp::RbspBitReader;
use serde::Serialize;

use super::audio::{has_adts_sync, has_mpeg_audio_sync, AdtsHeader};
use super::nal::{scan_units, unescape_rbsp, BitReader, VideoCodec};
use crate::config::{CodecTables, UnitClass};
use crate::packet::{AudioCodec, Codec, PacketId, PacketRecord, StreamKind};

/// Bytes of slice header read when resolving a slice type.
const SLICE_HEADER_PEEK: usize = 32;

const HEVC_PPS_NUT: u8 = 34;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FrameType {
    I,
    P,
    B,
    Audio,
    Unknown,
}

impl FrameType {
    pub const ALL: [FrameType; 5] = [
        FrameType::I,
        FrameType::P,
        FrameType::B,
        FrameType::Audio,
        FrameType::Unknown,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            FrameType::I => "I",
            FrameType::P => "P",
            FrameType::B => "B",
            FrameType::Audio => "A",
            FrameType::Unknown => "UNKNOWN",
        }
    }

    pub fn is_inter(self) -> bool {
        matches!(self, FrameType::P | FrameType::B)
    }

    fn rank(self) -> u8 {
        match self {
            FrameType::I => 3,
            FrameType::P => 2,
            FrameType::B => 1,
            FrameType::Audio | FrameType::Unknown => 0,
        }
    }

    /// Picks the stronger of two video frame types, I > P > B.
    pub fn strongest(self, other: FrameType) -> FrameType {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameClassification {
    pub packet: PacketId,
    pub stream_kind: StreamKind,
    pub frame_type: FrameType,
    pub size_bytes: usize,
    pub timestamp_ms: f64,
    /// Equal to `timestamp_ms` unless the packet carried a DTS.
    pub decode_ms: f64,
    pub arrival_ms: f64,
    pub stream_offset: u64,
}

/// True when an upstream keyframe hint disagrees with the structural result.
pub fn keyframe_hint_mismatch(hint: Option<bool>, frame_type: FrameType) -> bool {
    match hint {
        Some(true) => frame_type != FrameType::I,
        Some(false) => frame_type == FrameType::I,
        None => false,
    }
}

/// Assigns frame types from payload structure. Keeps the H.265 picture
/// parameter sets seen on its stream, since they shape the slice header.
#[derive(Debug)]
pub struct FrameClassifier {
    tables: CodecTables,
    hevc_extra_header_bits: HashMap<u32, u32>,
    unresolved_slices: u64,
}

impl FrameClassifier {
    pub fn new(tables: CodecTables) -> Self {
        Self {
            tables,
            hevc_extra_header_bits: HashMap::new(),
            unresolved_slices: 0,
        }
    }

    /// Slices whose type could not be read and were counted as P.
    pub fn unresolved_slices(&self) -> u64 {
        self.unresolved_slices
    }

    pub fn classify(&mut self, record: &PacketRecord) -> FrameClassification {
        let frame_type = match &record.codec {
            Codec::H264 => self.classify_video(VideoCodec::H264, &record.payload),
            Codec::H265 => self.classify_video(VideoCodec::H265, &record.payload),
            Codec::Audio(codec) => classify_audio(codec, &record.payload),
            Codec::Unknown(_) => FrameType::Unknown,
        };

        tracing::trace!(
            stream = %record.stream_kind,
            packet = record.id.0,
            frame_type = %frame_type,
            size = record.size(),
            "classified packet"
        );

        FrameClassification {
            packet: record.id,
            stream_kind: record.stream_kind,
            frame_type,
            size_bytes: record.size(),
            timestamp_ms: record.timestamp_ms(),
            decode_ms: record.decode_ms(),
            arrival_ms: record.arrival_ms(),
            stream_offset: record.stream_offset,
        }
    }

    fn classify_video(&mut self, codec: VideoCodec, payload: &[u8]) -> FrameType {
        let mut result = FrameType::Unknown;

        for unit in scan_units(payload) {
            let Some(header) = codec.parse_header(unit.data) else {
                continue;
            };
            if header.malformed {
                continue;
            }
            if codec == VideoCodec::H265 && header.unit_type == HEVC_PPS_NUT {
                self.remember_hevc_pps(&unit.data[2..]);
                continue;
            }

            let unit_type = match codec.table(&self.tables).class_of(header.unit_type) {
                UnitClass::I => FrameType::I,
                UnitClass::P => FrameType::P,
                UnitClass::B => FrameType::B,
                UnitClass::SliceHeader => {
                    let body = &unit.data[codec.header_len().min(unit.data.len())..];
                    let resolved = match codec {
                        VideoCodec::H264 => h264_slice_type(body),
                        VideoCodec::H265 => self.h265_slice_type(header.unit_type, body),
                    };
                    resolved.unwrap_or_else(|| {
                        self.unresolved_slices += 1;
                        FrameType::P
                    })
                }
                UnitClass::Ignore => continue,
            };

            result = if result == FrameType::Unknown {
                unit_type
            } else {
                result.strongest(unit_type)
            };
            if result == FrameType::I {
                break;
            }
        }

        result
    }

    fn remember_hevc_pps(&mut self, body: &[u8]) {
        if let Some((pps_id, extra_bits)) = hevc_pps_extra_bits(body) {
            self.hevc_extra_header_bits.insert(pps_id, extra_bits);
        }
    }

    fn h265_slice_type(&self, unit_type: u8, body: &[u8]) -> Option<FrameType> {
        let rbsp = unescape_rbsp(body, SLICE_HEADER_PEEK);
        let mut reader = BitReader::new(&rbsp);

        let first_slice_segment = reader.read_bit()? == 1;
        if (16..=23).contains(&unit_type) {
            reader.skip_bits(1)?;
        }
        let pps_id = reader.read_ue()?;
        if !first_slice_segment {
            // slice_segment_address needs the SPS picture size
            return None;
        }
        let extra_bits = self.hevc_extra_header_bits.get(&pps_id).copied().unwrap_or(0);
        reader.skip_bits(extra_bits)?;

        match reader.read_ue()? {
            0 => Some(FrameType::B),
            1 => Some(FrameType::P),
            2 => Some(FrameType::I),
            _ => None,
        }
    }
}

/// Reads `pps_pic_parameter_set_id` and `num_extra_slice_header_bits`.
fn hevc_pps_extra_bits(body: &[u8]) -> Option<(u32, u32)> {
    let rbsp = unescape_rbsp(body, SLICE_HEADER_PEEK);
    let mut reader = BitReader::new(&rbsp);
    let pps_id = reader.read_ue()?;
    let _sps_id = reader.read_ue()?;
    // dependent_slice_segments_enabled_flag, output_flag_present_flag
    reader.skip_bits(2)?;
    let extra_bits = reader.read_bits(3)?;
    Some((pps_id, extra_bits))
}

fn h264_slice_type(body: &[u8]) -> Option<FrameType> {
    let rbsp = unescape_rbsp(body, SLICE_HEADER_PEEK);
    let mut reader = RbspBitReader::new(&rbsp);
    let _first_mb_in_slice = reader.read_ue_named("first_mb_in_slice").ok()?;
    match reader.read_ue_named("slice_type").ok()? % 5 {
        0 | 3 => Some(FrameType::P),
        1 => Some(FrameType::B),
        2 | 4 => Some(FrameType::I),
        _ => None,
    }
}

fn classify_audio(codec: &AudioCodec, payload: &[u8]) -> FrameType {
    if payload.is_empty() {
        return FrameType::Unknown;
    }
    match codec {
        AudioCodec::Aac if has_adts_sync(payload) => match AdtsHeader::parse(payload) {
            Some(header) if header.layer == 0 => FrameType::Audio,
            _ => FrameType::Unknown,
        },
        AudioCodec::Mpeg if !has_mpeg_audio_sync(payload) => FrameType::Unknown,
        _ => FrameType::Audio,
    }
}
