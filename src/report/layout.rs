use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use super::ReportError;

/// Turns a stream URL into a directory name: credentials and scheme are
/// dropped and every run of non-alphanumerics becomes a single `_`.
pub fn sanitize_url(url: &str) -> String {
    let mut stripped = url.to_string();
    if let Some(scheme_end) = stripped.find("://") {
        let rest = scheme_end + 3;
        if let Some(at) = stripped[rest..].find('@') {
            stripped.replace_range(rest..rest + at + 1, "");
        }
    }
    let host_and_path = match stripped.rfind("://") {
        Some(i) => &stripped[i + 3..],
        None => stripped.as_str(),
    };

    let mut sanitized = String::with_capacity(host_and_path.len());
    for c in host_and_path.chars() {
        if c.is_ascii_alphanumeric() {
            sanitized.push(c);
        } else if !sanitized.ends_with('_') {
            sanitized.push('_');
        }
    }

    let sanitized = sanitized.trim_matches('_');
    if sanitized.is_empty() {
        "unknown_stream".to_string()
    } else {
        sanitized.to_string()
    }
}

/// `<output>/<sanitized url>/<YYYYmmdd_HHMMSS>`
pub fn session_dir(output: &Path, url: &str, started_at: &DateTime<Local>) -> PathBuf {
    output
        .join(sanitize_url(url))
        .join(started_at.format("%Y%m%d_%H%M%S").to_string())
}

pub fn create_session_dir(
    output: &Path,
    url: &str,
    started_at: &DateTime<Local>,
) -> Result<PathBuf, ReportError> {
    let dir = session_dir(output, url, started_at);
    fs::create_dir_all(&dir).map_err(ReportError::io(&dir))?;
    Ok(dir)
}
