use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub const ALL: [StreamKind; 2] = [StreamKind::Video, StreamKind::Audio];

    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value kept once per stream kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerKind<T> {
    pub video: T,
    pub audio: T,
}

impl<T> PerKind<T> {
    pub fn get(&self, kind: StreamKind) -> &T {
        match kind {
            StreamKind::Video => &self.video,
            StreamKind::Audio => &self.audio,
        }
    }

    pub fn get_mut(&mut self, kind: StreamKind) -> &mut T {
        match kind {
            StreamKind::Video => &mut self.video,
            StreamKind::Audio => &mut self.audio,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioCodec {
    Aac,
    Opus,
    Pcmu,
    Pcma,
    Mpeg,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Codec {
    H264,
    H265,
    Audio(AudioCodec),
    Unknown(String),
}

impl Codec {
    /// Maps an upstream codec tag (ffmpeg names and common fourccs) for the given stream kind.
    pub fn from_tag(kind: StreamKind, tag: &str) -> Self {
        let tag = tag.trim().to_ascii_lowercase();
        match kind {
            StreamKind::Video => match tag.as_str() {
                "h264" | "avc" | "avc1" => Codec::H264,
                "h265" | "hevc" | "hvc1" | "hev1" => Codec::H265,
                _ => Codec::Unknown(tag),
            },
            StreamKind::Audio => {
                let codec = match tag.as_str() {
                    "aac" | "mp4a" => AudioCodec::Aac,
                    "opus" => AudioCodec::Opus,
                    "pcm_mulaw" | "pcmu" | "g711u" => AudioCodec::Pcmu,
                    "pcm_alaw" | "pcma" | "g711a" => AudioCodec::Pcma,
                    "mp2" | "mp3" | "mpeg" => AudioCodec::Mpeg,
                    "" => return Codec::Unknown(tag),
                    _ => AudioCodec::Other(tag),
                };
                Codec::Audio(codec)
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Codec::H264 => "h264",
            Codec::H265 => "h265",
            Codec::Audio(AudioCodec::Aac) => "aac",
            Codec::Audio(AudioCodec::Opus) => "opus",
            Codec::Audio(AudioCodec::Pcmu) => "pcm_mulaw",
            Codec::Audio(AudioCodec::Pcma) => "pcm_alaw",
            Codec::Audio(AudioCodec::Mpeg) => "mpeg",
            Codec::Audio(AudioCodec::Other(tag)) | Codec::Unknown(tag) => tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct PacketId(pub u64);

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Packet as delivered by an upstream source, before normalization.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub stream_kind: StreamKind,
    pub codec: String,
    pub payload: Bytes,
    pub pts: Option<i64>,
    /// Decode timestamp, when it differs from `pts` (reordered B-frames).
    pub dts: Option<i64>,
    /// Ticks per second of `pts` and `dts`.
    pub clock_rate: u32,
    /// Monotonic arrival offset from the source epoch.
    pub arrival: Duration,
    pub keyframe: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct PacketRecord {
    pub id: PacketId,
    pub stream_kind: StreamKind,
    pub codec: Codec,
    pub payload: Bytes,
    pub pts: i64,
    pub dts: Option<i64>,
    pub clock_rate: u32,
    pub arrival: Duration,
    pub declared_keyframe: Option<bool>,
    /// Byte offset of this payload within its elementary stream.
    pub stream_offset: u64,
}

impl PacketRecord {
    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn timestamp_ms(&self) -> f64 {
        self.ticks_ms(self.pts)
    }

    /// Decode time in ms; presentation time when no DTS was carried.
    pub fn decode_ms(&self) -> f64 {
        self.ticks_ms(self.dts.unwrap_or(self.pts))
    }

    fn ticks_ms(&self, ticks: i64) -> f64 {
        ticks as f64 * 1000.0 / self.clock_rate as f64
    }

    pub fn arrival_ms(&self) -> f64 {
        duration_ms(self.arrival)
    }
}

pub(crate) fn duration_ms(d: Duration) -> f64 {
    d.as_micros() as f64 / 1000.0
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("{kind} packet has no presentation timestamp")]
    MissingTimestamp { kind: StreamKind },
    #[error("{kind} packet declares a zero clock rate")]
    ZeroClockRate { kind: StreamKind },
}

/// Turns upstream packets into `PacketRecord`s, assigning session-wide ids
/// and per-kind elementary stream offsets.
#[derive(Debug, Default)]
pub struct Normalizer {
    next_id: u64,
    stream_offsets: PerKind<u64>,
}

impl Normalizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize(&mut self, raw: RawPacket) -> Result<PacketRecord, NormalizeError> {
        let kind = raw.stream_kind;
        let pts = raw.pts.ok_or(NormalizeError::MissingTimestamp { kind })?;
        if raw.clock_rate == 0 {
            return Err(NormalizeError::ZeroClockRate { kind });
        }

        let id = PacketId(self.next_id);
        self.next_id += 1;

        let offset = self.stream_offsets.get_mut(kind);
        let stream_offset = *offset;
        *offset += raw.payload.len() as u64;

        Ok(PacketRecord {
            id,
            stream_kind: kind,
            codec: Codec::from_tag(kind, &raw.codec),
            payload: raw.payload,
            pts,
            dts: raw.dts,
            clock_rate: raw.clock_rate,
            arrival: raw.arrival,
            declared_keyframe: raw.keyframe,
            stream_offset,
        })
    }

    pub fn packets_normalized(&self) -> u64 {
        self.next_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(kind: StreamKind, codec: &str, len: usize, pts: Option<i64>) -> RawPacket {
        RawPacket {
            stream_kind: kind,
            codec: codec.to_string(),
            payload: Bytes::from(vec![0xAB; len]),
            pts,
            dts: None,
            clock_rate: 90_000,
            arrival: Duration::from_millis(10),
            keyframe: None,
        }
    }

    #[test]
    fn test_codec_tags() {
        assert_eq!(Codec::from_tag(StreamKind::Video, "H264"), Codec::H264);
        assert_eq!(Codec::from_tag(StreamKind::Video, "hevc"), Codec::H265);
        assert_eq!(
            Codec::from_tag(StreamKind::Video, "mjpeg"),
            Codec::Unknown("mjpeg".to_string())
        );
        assert_eq!(
            Codec::from_tag(StreamKind::Audio, "aac"),
            Codec::Audio(AudioCodec::Aac)
        );
        assert_eq!(
            Codec::from_tag(StreamKind::Audio, "pcm_alaw"),
            Codec::Audio(AudioCodec::Pcma)
        );
    }

    #[test]
    fn test_ids_and_offsets_per_kind() {
        let mut normalizer = Normalizer::new();
        let a = normalizer.normalize(raw(StreamKind::Video, "h264", 100, Some(0))).unwrap();
        let b = normalizer.normalize(raw(StreamKind::Audio, "aac", 30, Some(0))).unwrap();
        let c = normalizer.normalize(raw(StreamKind::Video, "h264", 50, Some(3600))).unwrap();

        assert_eq!((a.id, b.id, c.id), (PacketId(0), PacketId(1), PacketId(2)));
        assert_eq!(a.stream_offset, 0);
        assert_eq!(b.stream_offset, 0);
        assert_eq!(c.stream_offset, 100);
        assert_eq!(c.timestamp_ms(), 40.0);
        assert_eq!(c.decode_ms(), 40.0);
    }

    #[test]
    fn test_missing_timestamp_is_rejected_without_consuming_an_id() {
        let mut normalizer = Normalizer::new();
        let err = normalizer
            .normalize(raw(StreamKind::Audio, "aac", 10, None))
            .unwrap_err();
        assert_eq!(err, NormalizeError::MissingTimestamp { kind: StreamKind::Audio });

        let ok = normalizer.normalize(raw(StreamKind::Audio, "aac", 10, Some(1))).unwrap();
        assert_eq!(ok.id, PacketId(0));
    }

    #[test]
    fn test_decode_time_prefers_dts() {
        let mut normalizer = Normalizer::new();
        let mut p_frame = raw(StreamKind::Video, "h264", 10, Some(10_800));
        p_frame.dts = Some(3600);
        let record = normalizer.normalize(p_frame).unwrap();
        assert_eq!(record.timestamp_ms(), 120.0);
        assert_eq!(record.decode_ms(), 40.0);
    }

    #[test]
    fn test_zero_length_payload_is_accepted() {
        let mut normalizer = Normalizer::new();
        let record = normalizer.normalize(raw(StreamKind::Video, "h264", 0, Some(0))).unwrap();
        assert_eq!(record.size(), 0);
    }
}
