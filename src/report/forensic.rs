use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Local;

use super::ReportError;
use crate::analysis::FrameClassification;
use crate::packet::{PacketId, StreamKind};
use crate::session::{AnalysisSession, RetainedPayload};

pub const CORRUPTION_FILE: &str = "corruption.txt";
pub const DUMP_DIR: &str = "corrupted_frames";

const BYTES_PER_LINE: usize = 16;

/// Writes `corruption.txt` plus a hex and a binary dump of every retained
/// payload. Nothing is written for a clean session.
pub fn write_forensic(
    dir: &Path,
    session: &AnalysisSession,
    url: &str,
) -> Result<Vec<PathBuf>, ReportError> {
    if session.corruption.is_empty() {
        return Ok(Vec::new());
    }

    let mut written = Vec::new();
    let classifications: HashMap<PacketId, &FrameClassification> = session
        .classifications
        .iter()
        .map(|c| (c.packet, c))
        .collect();
    let names = dump_names(&session.retained_payloads);

    if !session.retained_payloads.is_empty() {
        let dump_dir = dir.join(DUMP_DIR);
        fs::create_dir_all(&dump_dir).map_err(ReportError::io(&dump_dir))?;
        for retained in &session.retained_payloads {
            let frame_type = classifications
                .get(&retained.packet)
                .map(|c| c.frame_type.as_str())
                .unwrap_or("UNKNOWN");
            let Some(name) = names.get(&retained.packet) else {
                continue;
            };
            let base = dump_dir.join(name);

            let bin_path = base.with_extension("bin");
            fs::write(&bin_path, &retained.payload).map_err(ReportError::io(&bin_path))?;
            let hex_path = base.with_extension("hex");
            fs::write(&hex_path, hex_file(retained, frame_type))
                .map_err(ReportError::io(&hex_path))?;
            written.push(bin_path);
            written.push(hex_path);
        }
    }

    let mut report = String::new();
    report.push_str("DETAILED CORRUPTION FORENSIC REPORT\n");
    report.push_str(&format!("Generated: {}\n", Local::now().format("%Y-%m-%d %H:%M:%S")));
    report.push_str(&format!("Stream: {}\n", url));
    if session.payloads_not_retained > 0 {
        report.push_str(&format!(
            "Payloads not dumped (retention cap): {}\n",
            session.payloads_not_retained
        ));
    }
    report.push_str(&"=".repeat(60));
    report.push_str("\n\n");

    for (i, event) in session.corruption.iter().enumerate() {
        report.push_str(&format!("Corruption Event #{}\n", i + 1));
        report.push_str(&format!("  Packet Index: {}\n", event.packet));
        report.push_str(&format!("  Stream: {}\n", event.stream_kind));
        if let Some(classification) = classifications.get(&event.packet) {
            let offset = classification.stream_offset;
            report.push_str(&format!("  Stream Offset: 0x{:08x} ({} bytes)\n", offset, offset));
            report.push_str(&format!("  Packet Size: {} bytes\n", classification.size_bytes));
        }
        report.push_str(&format!("  Timestamp (PTS): {:.2} ms\n", event.timestamp_ms));
        report.push_str(&format!("  Frame Type: {}\n", event.frame_type.as_str()));
        report.push_str(&format!("  Error Type: {}\n", event.reason.label()));
        report.push_str(&format!("  Error Description: {}\n", event.reason.describe()));
        if let Some(offset) = event.offset_in_payload {
            report.push_str(&format!("  Offset In Payload: {}\n", offset));
        }
        if let Some(name) = names.get(&event.packet) {
            report.push_str(&format!("  Hex Dump: {}/{}.hex\n", DUMP_DIR, name));
            report.push_str(&format!("  Binary: {}/{}.bin\n", DUMP_DIR, name));
        }
        report.push_str(&"-".repeat(60));
        report.push_str("\n\n");
    }

    let path = dir.join(CORRUPTION_FILE);
    fs::write(&path, report).map_err(ReportError::io(&path))?;
    written.push(path);

    tracing::info!(
        events = session.corruption.len(),
        dumps = session.retained_payloads.len(),
        "forensic output written"
    );
    Ok(written)
}

/// Video dumps are named by stream offset alone; audio offsets count a
/// separate elementary stream and carry a prefix.
fn dump_name(kind: StreamKind, stream_offset: u64) -> String {
    match kind {
        StreamKind::Video => format!("{:08x}", stream_offset),
        StreamKind::Audio => format!("audio_{:08x}", stream_offset),
    }
}

/// File stem per retained packet. An empty payload shares its offset with
/// the packet after it, so colliding names get the packet id appended.
fn dump_names(retained: &[RetainedPayload]) -> HashMap<PacketId, String> {
    let mut uses: HashMap<(StreamKind, u64), usize> = HashMap::new();
    for payload in retained {
        *uses.entry((payload.stream_kind, payload.stream_offset)).or_default() += 1;
    }
    retained
        .iter()
        .map(|payload| {
            let mut name = dump_name(payload.stream_kind, payload.stream_offset);
            let key = (payload.stream_kind, payload.stream_offset);
            if uses.get(&key).is_some_and(|&count| count > 1) {
                name.push_str(&format!("_{}", payload.packet.0));
            }
            (payload.packet, name)
        })
        .collect()
}

fn hex_file(retained: &RetainedPayload, frame_type: &str) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "Stream Offset: 0x{:08x} ({} bytes)\n",
        retained.stream_offset, retained.stream_offset
    ));
    out.push_str(&format!("Stream: {}\n", retained.stream_kind));
    out.push_str(&format!("Packet Index: {}\n", retained.packet));
    out.push_str(&format!("Packet Size: {} bytes\n", retained.payload.len()));
    out.push_str(&format!("Frame Type: {}\n", frame_type));
    out.push_str(&format!("Generated: {}\n", Local::now().to_rfc3339()));
    out.push_str(&"=".repeat(80));
    out.push_str("\n\n");
    out.push_str(&hex_dump(&retained.payload));
    out
}

/// Classic 16-bytes-per-line dump: offset, hex bytes, printable ASCII.
pub fn hex_dump(data: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in data.chunks(BYTES_PER_LINE).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = chunk
            .iter()
            .map(|&b| if (32..127).contains(&b) { b as char } else { '.' })
            .collect();
        out.push_str(&format!(
            "{:08x}  {:<48}  {}\n",
            line * BYTES_PER_LINE,
            hex.join(" "),
            ascii
        ));
    }
    out
}
