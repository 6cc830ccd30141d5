//! RTSP stream analysis: frame classification, timing drift, and structural
//! corruption detection over a bounded capture session.

pub mod analysis;
pub mod analyzer;
pub mod config;
pub mod packet;
pub mod pipeline;
pub mod report;
pub mod session;
pub mod source;
pub mod stats;

pub use analysis::{CorruptionEvent, CorruptionReason, FrameClassification, FrameType, PacketAnalysis};
pub use analyzer::Analyzer;
pub use config::{AnalysisConfig, Config, ConfigError};
pub use packet::{Codec, PacketId, PacketRecord, PerKind, RawPacket, StreamKind};
pub use pipeline::run_session;
pub use session::{AnalysisSession, FinishReason, SessionError};
pub use source::{PacketSource, SourceError};
pub use stats::{StreamStats, StreamSummary};
