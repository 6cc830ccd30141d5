//! Files written into a session directory once the session is finalized.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::session::AnalysisSession;

pub mod flow;
pub mod forensic;
pub mod layout;
pub mod text;

pub use layout::{create_session_dir, sanitize_url, session_dir};

pub const REPORT_FILE: &str = "report.txt";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize summary: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReportError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> ReportError + '_ {
        move |source| ReportError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReportOptions {
    pub url: String,
    pub flow_log: bool,
    pub forensic: bool,
}

/// Writes every enabled report into `dir`, returning the paths written.
pub fn write_reports(
    dir: &Path,
    session: &AnalysisSession,
    options: &ReportOptions,
) -> Result<Vec<PathBuf>, ReportError> {
    let mut written = Vec::new();

    if options.flow_log {
        written.push(flow::write_flow_log(dir, session)?);
    }
    if options.forensic {
        written.extend(forensic::write_forensic(dir, session, &options.url)?);
    }

    let report_path = dir.join(REPORT_FILE);
    fs::write(&report_path, text::render_report(session, &options.url))
        .map_err(ReportError::io(&report_path))?;
    written.push(report_path);

    let summary_path = dir.join(SUMMARY_FILE);
    let json = serde_json::to_string_pretty(&session.summary())?;
    fs::write(&summary_path, json).map_err(ReportError::io(&summary_path))?;
    written.push(summary_path);

    tracing::info!(dir = %dir.display(), files = written.len(), "reports written");
    Ok(written)
}
