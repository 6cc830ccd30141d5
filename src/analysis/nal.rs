//! NAL unit framing and header parsing shared by the classifier and the
//! corruption detector.

use std::borrow::Cow;

use h264_reader::nal::NalHeader as AvcNalHeader;

use crate::config::{CodecTables, TypeTable};
use crate::packet::Codec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    H265,
}

impl VideoCodec {
    pub fn from_codec(codec: &Codec) -> Option<Self> {
        match codec {
            Codec::H264 => Some(VideoCodec::H264),
            Codec::H265 => Some(VideoCodec::H265),
            _ => None,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            VideoCodec::H264 => 1,
            VideoCodec::H265 => 2,
        }
    }

    pub fn table(self, tables: &CodecTables) -> &TypeTable {
        match self {
            VideoCodec::H264 => &tables.h264,
            VideoCodec::H265 => &tables.h265,
        }
    }

    /// Parses the NAL header at the start of `data`.
    pub fn parse_header(self, data: &[u8]) -> Option<NalHeader> {
        match self {
            VideoCodec::H264 => {
                let b = *data.first()?;
                Some(match AvcNalHeader::new(b) {
                    Ok(header) => NalHeader {
                        unit_type: header.nal_unit_type().id(),
                        malformed: false,
                    },
                    Err(_) => NalHeader {
                        unit_type: b & 0x1F,
                        malformed: true,
                    },
                })
            }
            VideoCodec::H265 => {
                if data.len() < 2 {
                    return None;
                }
                let temporal_id_plus1 = data[1] & 0x07;
                Some(NalHeader {
                    unit_type: (data[0] >> 1) & 0x3F,
                    malformed: data[0] & 0x80 != 0 || temporal_id_plus1 == 0,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalHeader {
    pub unit_type: u8,
    /// Forbidden bit set, or (H.265) a zero temporal id.
    pub malformed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    AnnexB,
    LengthPrefixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NalUnit<'a> {
    /// Offset of the first header byte within the payload.
    pub offset: usize,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanError {
    /// Neither an Annex-B start code at the head nor a consistent length prefix.
    NoStartCode,
    /// A length prefix points past the end of the payload.
    LengthOverrun {
        offset: usize,
        declared: usize,
        available: usize,
    },
}

const LENGTH_PREFIX: usize = 4;

/// Returns the index of the next `00 00 01` at or after `from`.
pub fn find_start_code(data: &[u8], from: usize) -> Option<usize> {
    let mut i = from;
    while i + 2 < data.len() {
        if data[i + 2] > 1 {
            i += 3;
        } else if data[i + 2] == 1 && data[i] == 0 && data[i + 1] == 0 {
            return Some(i);
        } else {
            i += 1;
        }
    }
    None
}

/// Splits a payload into NAL units, requiring the framing to start at offset 0.
pub fn split_units(payload: &[u8]) -> Result<(Framing, Vec<NalUnit<'_>>), ScanError> {
    if let Some(units) = length_prefixed_lookalike(payload) {
        return Ok((Framing::LengthPrefixed, units));
    }
    let leading_zeros = payload.iter().take_while(|&&b| b == 0).count();
    if leading_zeros >= 2 && payload.get(leading_zeros) == Some(&1) {
        return Ok((Framing::AnnexB, split_annex_b(payload, leading_zeros - 2)));
    }
    split_length_prefixed(payload).map(|units| (Framing::LengthPrefixed, units))
}

/// Best-effort split that searches for the first start code anywhere in the
/// payload and otherwise keeps whatever length-prefixed units parse cleanly.
pub fn scan_units(payload: &[u8]) -> Vec<NalUnit<'_>> {
    if let Some(units) = length_prefixed_lookalike(payload) {
        return units;
    }
    if let Some(start) = find_start_code(payload, 0) {
        return split_annex_b(payload, start);
    }
    let mut units = Vec::new();
    let mut pos = 0;
    while pos + LENGTH_PREFIX < payload.len() {
        let declared = read_length(&payload[pos..]);
        let begin = pos + LENGTH_PREFIX;
        if declared == 0 || begin + declared > payload.len() {
            break;
        }
        units.push(NalUnit {
            offset: begin,
            data: &payload[begin..begin + declared],
        });
        pos = begin + declared;
    }
    units
}

/// A 4-byte length of 0x100..=0x1FF starts with `00 00 01`. Such a payload
/// is taken as length-prefixed when it parses that way end to end with every
/// unit header clean.
fn length_prefixed_lookalike(payload: &[u8]) -> Option<Vec<NalUnit<'_>>> {
    if !payload.starts_with(&[0, 0, 1]) || payload.len() <= LENGTH_PREFIX {
        return None;
    }
    let units = split_length_prefixed(payload).ok()?;
    units
        .iter()
        .all(|unit| unit.data.first().is_some_and(|b| b & 0x80 == 0))
        .then_some(units)
}

fn split_annex_b(payload: &[u8], start: usize) -> Vec<NalUnit<'_>> {
    let mut units = Vec::new();
    let mut next = Some(start);
    while let Some(code) = next {
        let begin = code + 3;
        next = find_start_code(payload, begin);
        let mut end = next.unwrap_or(payload.len());
        while end > begin && payload[end - 1] == 0 {
            end -= 1;
        }
        units.push(NalUnit {
            offset: begin,
            data: &payload[begin..end],
        });
    }
    units
}

fn split_length_prefixed(payload: &[u8]) -> Result<Vec<NalUnit<'_>>, ScanError> {
    let mut units = Vec::new();
    let mut pos = 0;
    while pos < payload.len() {
        let remaining = payload.len() - pos;
        if remaining < LENGTH_PREFIX {
            if units.is_empty() {
                return Err(ScanError::NoStartCode);
            }
            return Err(ScanError::LengthOverrun {
                offset: pos,
                declared: LENGTH_PREFIX,
                available: remaining,
            });
        }
        let declared = read_length(&payload[pos..]);
        let begin = pos + LENGTH_PREFIX;
        if units.is_empty() {
            let plausible = declared > 0 && payload.get(begin).is_some_and(|b| b & 0x80 == 0);
            if !plausible {
                return Err(ScanError::NoStartCode);
            }
        }
        if begin + declared > payload.len() {
            return Err(ScanError::LengthOverrun {
                offset: pos,
                declared,
                available: payload.len() - begin,
            });
        }
        units.push(NalUnit {
            offset: begin,
            data: &payload[begin..begin + declared],
        });
        pos = begin + declared;
    }
    Ok(units)
}

fn read_length(data: &[u8]) -> usize {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize
}

/// Removes emulation prevention bytes from at most `limit` bytes of a unit
/// body (header already stripped).
pub fn unescape_rbsp(body: &[u8], limit: usize) -> Cow<'_, [u8]> {
    h264_reader::rbsp::decode_nal(&body[..limit.min(body.len())])
}

/// MSB-first bit reader with Exp-Golomb support, for H.265 headers.
pub struct BitReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn read_bit(&mut self) -> Option<u32> {
        let byte = *self.data.get(self.pos / 8)?;
        let bit = (byte >> (7 - self.pos % 8)) & 1;
        self.pos += 1;
        Some(bit as u32)
    }

    pub fn read_bits(&mut self, n: u32) -> Option<u32> {
        let mut value = 0;
        for _ in 0..n {
            value = (value << 1) | self.read_bit()?;
        }
        Some(value)
    }

    pub fn skip_bits(&mut self, n: u32) -> Option<()> {
        self.read_bits(n).map(|_| ())
    }

    pub fn read_ue(&mut self) -> Option<u32> {
        let mut leading = 0;
        while self.read_bit()? == 0 {
            leading += 1;
            if leading > 31 {
                return None;
            }
        }
        let suffix = self.read_bits(leading)?;
        Some(((1u64 << leading) - 1 + suffix as u64) as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annex_b_split_with_mixed_start_codes() {
        let payload = [
            0, 0, 0, 1, 0x67, 0x42, 0x00, // SPS
            0, 0, 1, 0x68, 0xCE, // PPS
            0, 0, 0, 1, 0x65, 0x88, 0x84, // IDR
        ];
        let (framing, units) = split_units(&payload).unwrap();
        assert_eq!(framing, Framing::AnnexB);
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].offset, 4);
        // trailing zero of the following 4-byte start code is trimmed
        assert_eq!(units[0].data, &[0x67, 0x42]);
        assert_eq!(units[1].data, &[0x68, 0xCE]);
        assert_eq!(units[2].offset, 16);
        assert_eq!(units[2].data, &[0x65, 0x88, 0x84]);
    }

    #[test]
    fn test_length_prefixed_split() {
        let payload = [0, 0, 0, 2, 0x09, 0xF0, 0, 0, 0, 3, 0x41, 0x9A, 0x02];
        let (framing, units) = split_units(&payload).unwrap();
        assert_eq!(framing, Framing::LengthPrefixed);
        assert_eq!(units.len(), 2);
        assert_eq!(units[1].offset, 10);
    }

    #[test]
    fn test_length_prefix_resembling_start_code() {
        // 0x1A5-byte IDR unit: its length prefix reads `00 00 01 A5`
        let mut payload = vec![0, 0, 1, 0xA5, 0x65, 0x88, 0x84, 0x21];
        payload.resize(4 + 0x1A5, 0x5A);
        let (framing, units) = split_units(&payload).unwrap();
        assert_eq!(framing, Framing::LengthPrefixed);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].offset, 4);
        assert_eq!(units[0].data.len(), 0x1A5);
        assert_eq!(scan_units(&payload), units);

        // a genuine 3-byte start code is still Annex-B
        let (framing, _) = split_units(&[0, 0, 1, 0x65, 0x88, 0x84]).unwrap();
        assert_eq!(framing, Framing::AnnexB);
    }

    #[test]
    fn test_h264_header() {
        let idr = VideoCodec::H264.parse_header(&[0x65]).unwrap();
        assert_eq!(idr.unit_type, 5);
        assert!(!idr.malformed);
        let forbidden = VideoCodec::H264.parse_header(&[0xE5]).unwrap();
        assert!(forbidden.malformed);
        assert_eq!(forbidden.unit_type, 5);
    }

    #[test]
    fn test_length_overrun() {
        let payload = [0, 0, 0, 9, 0x41, 0x9A, 0x02];
        assert_eq!(
            split_units(&payload),
            Err(ScanError::LengthOverrun {
                offset: 0,
                declared: 9,
                available: 3
            })
        );
    }

    #[test]
    fn test_garbage_has_no_start_code() {
        assert_eq!(split_units(&[0xFF, 0xFF, 0xFF, 0xFF, 0xFF]), Err(ScanError::NoStartCode));
        assert_eq!(split_units(&[0x00, 0x00, 0x00, 0x00, 0x80]), Err(ScanError::NoStartCode));
    }

    #[test]
    fn test_scan_finds_start_code_mid_payload() {
        let payload = [0xAA, 0xBB, 0, 0, 1, 0x65, 0x88];
        let units = scan_units(&payload);
        assert_eq!(units.len(), 1);
        assert_eq!(units[0].offset, 5);
    }

    #[test]
    fn test_exp_golomb() {
        // 1 | 010 | 011 | 00100 -> 0, 1, 2, 3
        let data = [0b1010_0110, 0b0100_0000];
        let mut reader = BitReader::new(&data);
        assert_eq!(reader.read_ue(), Some(0));
        assert_eq!(reader.read_ue(), Some(1));
        assert_eq!(reader.read_ue(), Some(2));
        assert_eq!(reader.read_ue(), Some(3));
    }

    #[test]
    fn test_unescape() {
        assert_eq!(&*unescape_rbsp(&[0x88, 0, 0, 3, 1, 0x84], 16), &[0x88, 0, 0, 1, 0x84]);
        assert_eq!(&*unescape_rbsp(&[0x88, 0x84, 0x21], 2), &[0x88, 0x84]);
    }

    #[test]
    fn test_h265_header() {
        let header = VideoCodec::H265.parse_header(&[0x26, 0x01]).unwrap();
        assert_eq!(header.unit_type, 19);
        assert!(!header.malformed);
        assert!(VideoCodec::H265.parse_header(&[0x26, 0x00]).unwrap().malformed);
    }
}
