//! Audio frame markers: ADTS for AAC, frame sync for MPEG audio.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdtsHeader {
    pub layer: u8,
    pub protection_absent: bool,
    /// Length of the whole ADTS frame, header included.
    pub frame_length: usize,
}

impl AdtsHeader {
    pub const MIN_LEN: usize = 7;

    /// Parses a header at the start of `data`; `None` without a sync word or
    /// when fewer than seven bytes are available.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if !has_adts_sync(data) || data.len() < Self::MIN_LEN {
            return None;
        }
        Some(Self {
            layer: (data[1] >> 1) & 0x03,
            protection_absent: data[1] & 0x01 != 0,
            frame_length: ((data[3] as usize & 0x03) << 11)
                | ((data[4] as usize) << 3)
                | (data[5] as usize >> 5),
        })
    }

    pub fn header_len(&self) -> usize {
        if self.protection_absent {
            7
        } else {
            9
        }
    }
}

pub fn has_adts_sync(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] & 0xF0 == 0xF0
}

pub fn has_mpeg_audio_sync(data: &[u8]) -> bool {
    data.len() >= 2 && data[0] == 0xFF && data[1] & 0xE0 == 0xE0
}

#[cfg(test)]
pub(crate) fn adts_frame(payload_len: usize) -> Vec<u8> {
    let frame_length = payload_len + 7;
    let mut frame = vec![
        0xFF,
        0xF1,
        0x50,
        0x80 | ((frame_length >> 11) as u8 & 0x03),
        (frame_length >> 3) as u8,
        ((frame_length as u8 & 0x07) << 5) | 0x1F,
        0xFC,
    ];
    frame.resize(frame_length, 0x21);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_adts() {
        let frame = adts_frame(200);
        let header = AdtsHeader::parse(&frame).unwrap();
        assert_eq!(header.layer, 0);
        assert!(header.protection_absent);
        assert_eq!(header.frame_length, 207);
        assert_eq!(header.header_len(), 7);
    }

    #[test]
    fn test_no_sync() {
        assert!(AdtsHeader::parse(&[0x21, 0x10, 0x05, 0, 0, 0, 0]).is_none());
        assert!(AdtsHeader::parse(&[0xFF, 0xF1, 0x50]).is_none());
        assert!(has_mpeg_audio_sync(&[0xFF, 0xFB, 0x90]));
    }
}
