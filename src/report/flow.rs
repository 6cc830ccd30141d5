use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::ReportError;
use crate::packet::{PerKind, StreamKind};
use crate::session::AnalysisSession;

pub const FLOW_FILE: &str = "flow.csv";

const HEADER: &str = "Wall Clock Time (ms),Stream,Stream Offset (hex),Stream Offset (dec),\
Packet Number,Type,Packet Size (bytes),Timestamp (ms),Drift (ms)";

/// One CSV row per classified packet, in the order the session recorded them.
pub fn write_flow_log(dir: &Path, session: &AnalysisSession) -> Result<PathBuf, ReportError> {
    let path = dir.join(FLOW_FILE);
    let file = File::create(&path).map_err(ReportError::io(&path))?;
    let mut out = BufWriter::new(file);
    write_rows(&mut out, session).map_err(ReportError::io(&path))?;
    out.flush().map_err(ReportError::io(&path))?;
    Ok(path)
}

fn write_rows<W: Write>(out: &mut W, session: &AnalysisSession) -> std::io::Result<()> {
    writeln!(out, "{}", HEADER)?;

    let mut drift_index = PerKind::<usize>::default();
    for classification in &session.classifications {
        let kind = classification.stream_kind;
        let index = drift_index.get_mut(kind);
        let drift_ms = session
            .drift
            .get(kind)
            .get(*index)
            .map(|sample| sample.drift_ms)
            .unwrap_or_default();
        *index += 1;

        writeln!(
            out,
            "{:.2},{},0x{:08x},{},{},{},{},{:.2},{:.2}",
            classification.arrival_ms,
            kind_label(kind),
            classification.stream_offset,
            classification.stream_offset,
            classification.packet,
            classification.frame_type.as_str(),
            classification.size_bytes,
            classification.timestamp_ms,
            drift_ms,
        )?;
    }
    Ok(())
}

fn kind_label(kind: StreamKind) -> &'static str {
    match kind {
        StreamKind::Video => "V",
        StreamKind::Audio => "A",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::sample_session;

    #[test]
    fn test_flow_rows() {
        let session = sample_session(false);
        let mut out = Vec::new();
        write_rows(&mut out, &session).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 5);
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines[1], "2.00,V,0x00000000,0,0,I,8,0.00,0.00");
        assert_eq!(lines[2], "42.00,V,0x00000008,8,1,P,8,40.00,0.00");
        assert!(lines[3].starts_with("82.00,V,0x00000010,16,2,"));
    }

    #[test]
    fn test_write_flow_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let session = sample_session(false);
        let path = write_flow_log(dir.path(), &session).unwrap();
        let text = std::fs::read_to_string(path).unwrap();
        assert_eq!(text.lines().count(), 5);
    }
}
