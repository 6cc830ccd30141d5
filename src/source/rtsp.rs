use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;

use super::{PacketSource, SourceError};
use crate::packet::{RawPacket, StreamKind};

const TS_PACKET_LEN: usize = 188;
const TS_SYNC_BYTE: u8 = 0x47;
const MPEG_TS_CLOCK_RATE: u32 = 90_000;
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct RtspOptions {
    pub url: String,
    pub transport: String,
    /// Directory to write the raw video elementary stream into, if any.
    pub save_stream: Option<PathBuf>,
}

/// Packets read from an RTSP stream by an `ffmpeg` child process remuxing to
/// MPEG-TS on stdout. Parsing runs on a dedicated OS thread.
pub struct FfmpegSource {
    packets: mpsc::Receiver<Result<RawPacket, SourceError>>,
    shutdown: Arc<AtomicBool>,
}

impl FfmpegSource {
    pub fn spawn(options: RtspOptions) -> Result<Self, SourceError> {
        let mut child = spawn_ffmpeg(&options)?;
        let stdout = child.stdout.take().ok_or(SourceError::FfmpegFailed(
            "failed to capture stdout".to_string(),
        ))?;
        if let Some(stderr) = child.stderr.take() {
            forward_stderr(stderr);
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = Reader {
            tx,
            shutdown: Arc::clone(&shutdown),
            tee: options.save_stream.map(StreamTee::new),
        };

        std::thread::Builder::new()
            .name("ffmpeg-reader".to_string())
            .spawn(move || reader.run(child, stdout))?;

        tracing::info!(url = %options.url, transport = %options.transport, "ffmpeg source started");

        Ok(Self {
            packets: rx,
            shutdown,
        })
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl PacketSource for FfmpegSource {
    async fn next_packet(&mut self) -> Result<Option<RawPacket>, SourceError> {
        self.packets.recv().await.transpose()
    }
}

fn spawn_ffmpeg(options: &RtspOptions) -> Result<Child, SourceError> {
    // Remux without re-encoding; MPEG-TS keeps PTS and the random access flag.
    Command::new("ffmpeg")
        .args([
            "-hide_banner",
            "-loglevel",
            "warning",
            "-rtsp_transport",
            &options.transport,
            "-i",
            &options.url,
            "-c",
            "copy",
            "-f",
            "mpegts",
            "-mpegts_copyts",
            "1",
            "-",
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SourceError::FfmpegNotFound
            } else {
                SourceError::Io(e)
            }
        })
}

fn forward_stderr(stderr: ChildStderr) {
    let spawned = std::thread::Builder::new()
        .name("ffmpeg-stderr".to_string())
        .spawn(move || {
            for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                tracing::warn!(target: "streamripper::ffmpeg", "{}", line);
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("failed to spawn ffmpeg stderr reader: {}", e);
    }
}

struct Reader {
    tx: mpsc::Sender<Result<RawPacket, SourceError>>,
    shutdown: Arc<AtomicBool>,
    tee: Option<StreamTee>,
}

impl Reader {
    fn run(mut self, mut child: Child, stdout: impl Read) {
        let result = self.process_stream(stdout);

        let _ = child.kill();
        let status = child.wait();

        let result = result.and_then(|ended| match status {
            Ok(status) if ended && !status.success() && !self.stopping() => Err(
                SourceError::FfmpegFailed(format!("ffmpeg exited with {}", status)),
            ),
            Ok(_) => Ok(()),
            Err(e) => Err(SourceError::Io(e)),
        });

        if let Some(tee) = self.tee.as_mut() {
            tee.flush();
        }
        if let Err(e) = result {
            tracing::warn!("ffmpeg source stopped: {}", e);
            let _ = self.tx.blocking_send(Err(e));
        }
    }

    fn stopping(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed) || self.tx.is_closed()
    }

    /// Returns `true` when the stream reached end of file.
    fn process_stream<R: Read>(&mut self, mut reader: R) -> Result<bool, SourceError> {
        let mut parser = MpegTsParser::new();
        let mut buf = vec![0u8; TS_PACKET_LEN * 64];
        let mut pending = Vec::new();
        let start = Instant::now();

        while !self.stopping() {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                tracing::info!("ffmpeg stream ended");
                for frame in parser.flush() {
                    send_frame(&mut self.tee, &self.tx, frame, start);
                }
                return Ok(true);
            }

            pending.extend_from_slice(&buf[..n]);
            let consumed = parser.parse(&pending, |frame| {
                send_frame(&mut self.tee, &self.tx, frame, start)
            });
            pending.drain(..consumed);
        }

        Ok(false)
    }
}

fn send_frame(
    tee: &mut Option<StreamTee>,
    tx: &mpsc::Sender<Result<RawPacket, SourceError>>,
    frame: ParsedFrame,
    start: Instant,
) {
    let arrival = start.elapsed();
    if frame.stream_kind == StreamKind::Video {
        if let Some(t) = tee.as_mut() {
            t.write(frame.codec, &frame.data);
        }
    }

    let packet = RawPacket {
        stream_kind: frame.stream_kind,
        codec: frame.codec.to_string(),
        payload: Bytes::from(frame.data),
        pts: frame.pts.map(|pts| pts as i64),
        dts: frame.dts.map(|dts| dts as i64),
        clock_rate: MPEG_TS_CLOCK_RATE,
        arrival,
        keyframe: (frame.stream_kind == StreamKind::Video).then_some(frame.random_access),
    };
    tracing::trace!(
        stream = %packet.stream_kind,
        size = packet.payload.len(),
        pts = ?packet.pts,
        dts = ?packet.dts,
        "pes packet"
    );
    // A closed channel means the consumer is gone; the read loop notices on
    // its next iteration.
    let _ = tx.blocking_send(Ok(packet));
}

/// Copies the video elementary stream to `stream.<codec>` in the session directory.
struct StreamTee {
    dir: PathBuf,
    file: Option<BufWriter<File>>,
    failed: bool,
}

impl StreamTee {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            file: None,
            failed: false,
        }
    }

    fn write(&mut self, codec: &str, data: &[u8]) {
        if self.failed {
            return;
        }
        if self.file.is_none() {
            let path = self.dir.join(format!("stream.{}", codec));
            match File::create(&path) {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "saving raw video stream");
                    self.file = Some(BufWriter::new(file));
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "cannot save raw stream: {}", e);
                    self.failed = true;
                    return;
                }
            }
        }
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.write_all(data) {
                tracing::warn!("raw stream write failed: {}", e);
                self.failed = true;
            }
        }
    }

    fn flush(&mut self) {
        if let Some(file) = self.file.as_mut() {
            if let Err(e) = file.flush() {
                tracing::warn!("raw stream flush failed: {}", e);
            }
        }
    }
}

#[derive(Debug)]
struct ParsedFrame {
    stream_kind: StreamKind,
    codec: &'static str,
    data: Vec<u8>,
    pts: Option<u64>,
    dts: Option<u64>,
    random_access: bool,
}

#[derive(Debug)]
struct ElementaryStream {
    stream_kind: StreamKind,
    codec: &'static str,
    buffer: Vec<u8>,
    pts: Option<u64>,
    dts: Option<u64>,
    random_access: bool,
    started: bool,
}

impl ElementaryStream {
    fn new(stream_kind: StreamKind, codec: &'static str) -> Self {
        Self {
            stream_kind,
            codec,
            buffer: Vec::new(),
            pts: None,
            dts: None,
            random_access: false,
            started: false,
        }
    }

    fn take_frame(&mut self) -> Option<ParsedFrame> {
        if !self.started || self.buffer.is_empty() {
            return None;
        }
        Some(ParsedFrame {
            stream_kind: self.stream_kind,
            codec: self.codec,
            data: std::mem::take(&mut self.buffer),
            pts: self.pts.take(),
            dts: self.dts.take(),
            random_access: std::mem::replace(&mut self.random_access, false),
        })
    }
}

fn stream_type_codec(stream_type: u8) -> Option<(StreamKind, &'static str)> {
    match stream_type {
        0x1B => Some((StreamKind::Video, "h264")),
        0x24 => Some((StreamKind::Video, "h265")),
        0x0F => Some((StreamKind::Audio, "aac")),
        0x11 => Some((StreamKind::Audio, "aac_latm")),
        0x03 | 0x04 => Some((StreamKind::Audio, "mpeg")),
        _ => None,
    }
}

/// MPEG-TS demuxer for the first video and first audio stream of the first
/// program. A PES packet is emitted once the next one on its PID begins.
struct MpegTsParser {
    pmt_pid: Option<u16>,
    streams: HashMap<u16, ElementaryStream>,
}

impl MpegTsParser {
    fn new() -> Self {
        Self {
            pmt_pid: None,
            streams: HashMap::new(),
        }
    }

    /// Parses whole TS packets from `data`, returning how many bytes were consumed.
    fn parse(&mut self, data: &[u8], mut on_frame: impl FnMut(ParsedFrame)) -> usize {
        let mut offset = 0;

        while offset + TS_PACKET_LEN <= data.len() {
            if data[offset] != TS_SYNC_BYTE {
                offset += 1;
                continue;
            }

            let packet = &data[offset..offset + TS_PACKET_LEN];
            if let Some(frame) = self.parse_packet(packet) {
                on_frame(frame);
            }
            offset += TS_PACKET_LEN;
        }

        offset
    }

    /// Emits whatever PES data is still buffered.
    fn flush(&mut self) -> Vec<ParsedFrame> {
        let mut pids: Vec<u16> = self.streams.keys().copied().collect();
        pids.sort_unstable();
        pids.into_iter()
            .filter_map(|pid| self.streams.get_mut(&pid).and_then(ElementaryStream::take_frame))
            .collect()
    }

    fn parse_packet(&mut self, packet: &[u8]) -> Option<ParsedFrame> {
        let pid = ((packet[1] as u16 & 0x1F) << 8) | packet[2] as u16;
        let payload_start = (packet[1] & 0x40) != 0;
        let has_adaptation = (packet[3] & 0x20) != 0;
        let has_payload = (packet[3] & 0x10) != 0;

        let mut random_access = false;
        let mut payload_offset = 4;
        if has_adaptation {
            let adaptation_len = (packet[4] as usize).min(183);
            if adaptation_len > 0 {
                random_access = (packet[5] & 0x40) != 0;
            }
            payload_offset = 5 + adaptation_len;
        }

        if !has_payload || payload_offset >= TS_PACKET_LEN {
            return None;
        }
        let payload = &packet[payload_offset..];

        if pid == 0 {
            self.parse_pat(section(payload, payload_start)?);
            return None;
        }
        if Some(pid) == self.pmt_pid {
            self.parse_pmt(section(payload, payload_start)?);
            return None;
        }

        let stream = self.streams.get_mut(&pid)?;
        if !payload_start {
            if stream.started {
                stream.random_access |= random_access;
                stream.buffer.extend_from_slice(payload);
            }
            return None;
        }

        let frame = stream.take_frame();
        stream.random_access = random_access;

        match parse_pes_header(payload) {
            Some(header) => {
                stream.started = true;
                stream.pts = header.pts;
                stream.dts = header.dts;
                stream.buffer.extend_from_slice(&payload[header.data_start..]);
            }
            None => {
                tracing::trace!(pid, "discarding PES without a valid header");
                stream.started = false;
                stream.buffer.clear();
            }
        }

        frame
    }

    fn parse_pat(&mut self, table: &[u8]) {
        let Some(programs) = section_body(table, 0x00, 5) else {
            return;
        };

        for entry in programs.chunks_exact(4) {
            let program_number = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = ((entry[2] as u16 & 0x1F) << 8) | entry[3] as u16;
            if program_number != 0 {
                if self.pmt_pid != Some(pid) {
                    tracing::debug!(pmt_pid = pid, "found PMT PID in PAT");
                    self.pmt_pid = Some(pid);
                }
                return;
            }
        }
    }

    fn parse_pmt(&mut self, table: &[u8]) {
        let Some(body) = section_body(table, 0x02, 5) else {
            return;
        };
        if body.len() < 4 {
            return;
        }
        let program_info_len = ((body[2] as usize & 0x0F) << 8) | body[3] as usize;

        let mut pos = 4 + program_info_len;
        while pos + 5 <= body.len() {
            let stream_type = body[pos];
            let elem_pid = ((body[pos + 1] as u16 & 0x1F) << 8) | body[pos + 2] as u16;
            let es_info_len = ((body[pos + 3] as usize & 0x0F) << 8) | body[pos + 4] as usize;
            pos += 5 + es_info_len;

            let Some((kind, codec)) = stream_type_codec(stream_type) else {
                tracing::trace!(stream_type, pid = elem_pid, "ignoring elementary stream");
                continue;
            };
            if self.streams.contains_key(&elem_pid)
                || self.streams.values().any(|s| s.stream_kind == kind)
            {
                continue;
            }
            tracing::debug!(pid = elem_pid, stream = %kind, codec, "detected elementary stream");
            self.streams.insert(elem_pid, ElementaryStream::new(kind, codec));
        }
    }
}

/// Skips the pointer field of a PSI payload.
fn section(payload: &[u8], payload_start: bool) -> Option<&[u8]> {
    if !payload_start {
        return None;
    }
    let pointer = *payload.first()? as usize;
    payload.get(1 + pointer..)
}

/// Returns the bytes between the fixed section header (`header_len` bytes
/// after `section_length`) and the CRC.
fn section_body(table: &[u8], table_id: u8, header_len: usize) -> Option<&[u8]> {
    if table.len() < 3 || table[0] != table_id {
        return None;
    }
    let section_len = ((table[1] as usize & 0x0F) << 8) | table[2] as usize;
    let end = (3 + section_len).checked_sub(4)?.min(table.len());
    table.get(3 + header_len..end)
}

#[derive(Debug, PartialEq, Eq)]
struct PesHeader {
    pts: Option<u64>,
    /// Only set when the stream signals a DTS separate from the PTS.
    dts: Option<u64>,
    data_start: usize,
}

/// Parses a PES header: its timestamps and where the elementary stream
/// data begins.
fn parse_pes_header(payload: &[u8]) -> Option<PesHeader> {
    if payload.len() < 9 || payload[..3] != [0x00, 0x00, 0x01] {
        return None;
    }
    let pts_dts_flags = (payload[7] >> 6) & 0x03;
    let header_len = payload[8] as usize;
    let data_start = 9 + header_len;
    if data_start > payload.len() {
        return None;
    }
    let pts = (pts_dts_flags >= 2 && header_len >= 5).then(|| parse_pts(&payload[9..14]));
    let dts = (pts_dts_flags == 3 && header_len >= 10).then(|| parse_pts(&payload[14..19]));
    Some(PesHeader {
        pts,
        dts,
        data_start,
    })
}

fn parse_pts(data: &[u8]) -> u64 {
    ((data[0] as u64 >> 1) & 0x07) << 30
        | (data[1] as u64) << 22
        | ((data[2] as u64 >> 1) & 0x7F) << 15
        | (data[3] as u64) << 7
        | ((data[4] as u64 >> 1) & 0x7F)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PMT_PID: u16 = 0x1000;
    const VIDEO_PID: u16 = 0x100;
    const AUDIO_PID: u16 = 0x101;

    fn ts_packet(pid: u16, start: bool, random_access: bool, payload: &[u8]) -> Vec<u8> {
        assert!(payload.len() <= 182);
        let mut packet = vec![
            TS_SYNC_BYTE,
            if start { 0x40 } else { 0x00 } | ((pid >> 8) as u8 & 0x1F),
            pid as u8,
            0x30,
        ];
        let adaptation_len = 183 - payload.len();
        packet.push(adaptation_len as u8);
        packet.push(if random_access { 0x40 } else { 0x00 });
        packet.resize(5 + adaptation_len, 0xFF);
        packet.extend_from_slice(payload);
        assert_eq!(packet.len(), TS_PACKET_LEN);
        packet
    }

    fn pat() -> Vec<u8> {
        let mut section = vec![0x00, 0x00, 0xB0, 13, 0x00, 0x01, 0xC1, 0x00, 0x00];
        section.extend_from_slice(&[0x00, 0x01, 0xE0 | (PMT_PID >> 8) as u8, PMT_PID as u8]);
        section.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        ts_packet(0, true, false, &section)
    }

    fn pmt() -> Vec<u8> {
        let mut section = vec![0x00, 0x02, 0xB0, 28, 0x00, 0x01, 0xC1, 0x00, 0x00, 0xE1, 0x00, 0xF0, 0x00];
        section.extend_from_slice(&[0x1B, 0xE1, 0x00, 0xF0, 0x00]);
        section.extend_from_slice(&[0x0F, 0xE1, 0x01, 0xF0, 0x00]);
        section.extend_from_slice(&[0x06, 0xE1, 0x02, 0xF0, 0x00]);
        section.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        ts_packet(PMT_PID, true, false, &section)
    }

    fn encode_pts(pts: u64) -> [u8; 5] {
        [
            0x21 | ((pts >> 29) & 0x0E) as u8,
            (pts >> 22) as u8,
            (((pts >> 14) & 0xFE) | 1) as u8,
            (pts >> 7) as u8,
            (((pts << 1) & 0xFE) | 1) as u8,
        ]
    }

    fn pes(stream_id: u8, pts: u64, data: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0x80, 5];
        out.extend_from_slice(&encode_pts(pts));
        out.extend_from_slice(data);
        out
    }

    fn pes_with_dts(stream_id: u8, pts: u64, dts: u64, data: &[u8]) -> Vec<u8> {
        let mut out = vec![0x00, 0x00, 0x01, stream_id, 0x00, 0x00, 0x80, 0xC0, 10];
        out.extend_from_slice(&encode_pts(pts));
        out.extend_from_slice(&encode_pts(dts));
        out.extend_from_slice(data);
        out
    }

    fn parse_all(parser: &mut MpegTsParser, packets: &[Vec<u8>]) -> Vec<ParsedFrame> {
        let data = packets.concat();
        let mut frames = Vec::new();
        let consumed = parser.parse(&data, |frame| frames.push(frame));
        assert_eq!(consumed, data.len());
        frames
    }

    #[test]
    fn test_pts_decoding() {
        for pts in [0u64, 1, 90_000, 0x1_2345_6789, (1 << 33) - 1] {
            assert_eq!(parse_pts(&encode_pts(pts)), pts);
        }
    }

    #[test]
    fn test_pes_header_timestamps() {
        let header = parse_pes_header(&pes_with_dts(0xE0, 10_800, 3_600, &[0, 0, 1, 0x41])).unwrap();
        assert_eq!(
            header,
            PesHeader {
                pts: Some(10_800),
                dts: Some(3_600),
                data_start: 19,
            }
        );

        let header = parse_pes_header(&pes(0xE0, 3_600, &[])).unwrap();
        assert_eq!((header.pts, header.dts), (Some(3_600), None));

        // flags claim a DTS but the header is too short to hold one
        let mut short = pes(0xE0, 3_600, &[]);
        short[7] = 0xC0;
        assert_eq!(parse_pes_header(&short).unwrap().dts, None);
    }

    #[test]
    fn test_program_tables() {
        let mut parser = MpegTsParser::new();
        parse_all(&mut parser, &[pat(), pmt()]);
        assert_eq!(parser.pmt_pid, Some(PMT_PID));
        assert_eq!(parser.streams.len(), 2);
        assert_eq!(parser.streams[&VIDEO_PID].codec, "h264");
        assert_eq!(parser.streams[&AUDIO_PID].stream_kind, StreamKind::Audio);
    }

    #[test]
    fn test_pes_reassembly() {
        let mut parser = MpegTsParser::new();
        let first = pes(0xE0, 3_600, &[0, 0, 0, 1, 0x65, 0x88]);
        let second = pes(0xE0, 7_200, &[0, 0, 0, 1, 0x41, 0x9A]);
        let audio = pes(0xC0, 1_800, &[0xFF, 0xF1, 0x50]);

        let frames = parse_all(
            &mut parser,
            &[
                pat(),
                pmt(),
                ts_packet(VIDEO_PID, true, true, &first),
                ts_packet(VIDEO_PID, false, false, &[0x84, 0x21]),
                ts_packet(AUDIO_PID, true, false, &audio),
                ts_packet(VIDEO_PID, true, false, &second),
            ],
        );

        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].stream_kind, StreamKind::Video);
        assert_eq!(frames[0].pts, Some(3_600));
        assert!(frames[0].random_access);
        assert_eq!(frames[0].data, vec![0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21]);

        let rest = parser.flush();
        assert_eq!(rest.len(), 2);
        let video = rest.iter().find(|f| f.stream_kind == StreamKind::Video).unwrap();
        assert_eq!(video.pts, Some(7_200));
        assert!(!video.random_access);
        assert_eq!(video.dts, None);
        let audio = rest.iter().find(|f| f.stream_kind == StreamKind::Audio).unwrap();
        assert_eq!(audio.codec, "aac");
        assert_eq!(audio.data, vec![0xFF, 0xF1, 0x50]);
    }

    #[test]
    fn test_resync_after_garbage() {
        let mut parser = MpegTsParser::new();
        let mut data = vec![0x00, 0x12, 0x34];
        data.extend(pat());
        data.extend(pmt());
        let consumed = parser.parse(&data, |_| {});
        assert_eq!(consumed, data.len());
        assert_eq!(parser.streams.len(), 2);
    }

    #[test]
    fn test_continuation_before_first_start_is_ignored() {
        let mut parser = MpegTsParser::new();
        let frames = parse_all(
            &mut parser,
            &[pat(), pmt(), ts_packet(VIDEO_PID, false, false, &[1, 2, 3])],
        );
        assert!(frames.is_empty());
        assert!(parser.flush().is_empty());
    }
}
