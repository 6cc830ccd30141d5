use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local};
use serde::Serialize;
use thiserror::Error;

use crate::analysis::{CorruptionEvent, Discontinuity, DriftSample, FrameClassification, PacketAnalysis};
use crate::config::AnalysisConfig;
use crate::packet::{duration_ms, PacketId, PerKind, StreamKind};
use crate::stats::StreamStats;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session is already finalized")]
    Closed,
    #[error("packet arrived at {arrival:?}, past the {bound:?} session bound")]
    DurationElapsed { arrival: Duration, bound: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    DurationElapsed,
    SourceEnded,
    SourceFailed,
    Interrupted,
}

impl FinishReason {
    pub fn is_early(self) -> bool {
        !matches!(self, FinishReason::DurationElapsed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::DurationElapsed => "duration elapsed",
            FinishReason::SourceEnded => "source ended",
            FinishReason::SourceFailed => "source failed",
            FinishReason::Interrupted => "interrupted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Finalization {
    pub finished_at: DateTime<Local>,
    pub terminated_early: bool,
    pub reason: FinishReason,
}

/// Payload of a packet that raised corruption events, kept for forensic dumps.
#[derive(Debug, Clone)]
pub struct RetainedPayload {
    pub packet: PacketId,
    pub stream_kind: StreamKind,
    pub stream_offset: u64,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSession {
    pub started_at: DateTime<Local>,
    pub duration_bound: Duration,
    pub classifications: Vec<FrameClassification>,
    pub drift: PerKind<Vec<DriftSample>>,
    pub discontinuities: Vec<Discontinuity>,
    pub corruption: Vec<CorruptionEvent>,
    pub stats: PerKind<StreamStats>,
    /// Packets the normalizer rejected for lacking a usable timestamp.
    pub dropped_untimed: u64,
    /// Packets that arrived past the duration bound and were not analyzed.
    pub dropped_late: u64,
    #[serde(skip)]
    pub retained_payloads: Vec<RetainedPayload>,
    /// Corrupted packets whose payload was not kept once the cap was reached.
    pub payloads_not_retained: u64,
    #[serde(skip)]
    max_retained_payloads: usize,
    pub finalization: Option<Finalization>,
}

impl AnalysisSession {
    fn new(duration_bound: Duration, max_retained_payloads: usize) -> Self {
        Self {
            started_at: Local::now(),
            duration_bound,
            classifications: Vec::new(),
            drift: PerKind::default(),
            discontinuities: Vec::new(),
            corruption: Vec::new(),
            stats: PerKind::default(),
            dropped_untimed: 0,
            dropped_late: 0,
            retained_payloads: Vec::new(),
            payloads_not_retained: 0,
            max_retained_payloads,
            finalization: None,
        }
    }

    pub fn terminated_early(&self) -> bool {
        self.finalization
            .as_ref()
            .is_some_and(|f| f.terminated_early)
    }

    pub fn total_packets(&self) -> u64 {
        StreamKind::ALL
            .iter()
            .map(|&kind| self.stats.get(kind).packets())
            .sum()
    }

    /// The stats-only view written to `summary.json`.
    pub fn summary(&self) -> SessionSummary<'_> {
        SessionSummary {
            started_at: self.started_at,
            duration_bound_secs: self.duration_bound.as_secs_f64(),
            finalization: self.finalization.as_ref(),
            dropped_untimed: self.dropped_untimed,
            dropped_late: self.dropped_late,
            payloads_not_retained: self.payloads_not_retained,
            discontinuities: self.discontinuities.len(),
            corruption_events: self.corruption.len(),
            stats: &self.stats,
        }
    }

    fn apply(&mut self, analysis: PacketAnalysis) {
        let kind = analysis.classification.stream_kind;
        let stats = self.stats.get_mut(kind);

        stats.record_classification(&analysis.classification);
        stats.record_drift(&analysis.drift);
        if analysis.hint_mismatch {
            stats.record_hint_mismatch();
        }
        if analysis.unknown_codec {
            stats.record_unknown_codec();
        }
        if analysis.unresolved_slices > 0 {
            stats.record_unresolved_slices(analysis.unresolved_slices);
        }
        if let Some(discontinuity) = analysis.discontinuity {
            stats.record_discontinuity(&discontinuity);
            self.discontinuities.push(discontinuity);
        }
        for event in &analysis.corruption {
            stats.record_corruption(event);
            tracing::warn!(
                stream = %kind,
                packet = event.packet.0,
                reason = event.reason.label(),
                "{}",
                event.reason.describe()
            );
        }

        if let Some(payload) = analysis.corrupted_payload {
            if self.retained_payloads.len() < self.max_retained_payloads {
                self.retained_payloads.push(RetainedPayload {
                    packet: analysis.classification.packet,
                    stream_kind: kind,
                    stream_offset: analysis.classification.stream_offset,
                    payload,
                });
            } else {
                if self.payloads_not_retained == 0 {
                    tracing::warn!(
                        cap = self.max_retained_payloads,
                        "payload retention cap reached, further corrupted payloads are not kept"
                    );
                }
                self.payloads_not_retained += 1;
            }
        }
        self.corruption.extend(analysis.corruption);
        self.drift.get_mut(kind).push(analysis.drift);
        self.classifications.push(analysis.classification);
    }
}

#[derive(Debug, Serialize)]
pub struct SessionSummary<'a> {
    pub started_at: DateTime<Local>,
    pub duration_bound_secs: f64,
    pub finalization: Option<&'a Finalization>,
    pub dropped_untimed: u64,
    pub dropped_late: u64,
    pub payloads_not_retained: u64,
    pub discontinuities: usize,
    pub corruption_events: usize,
    pub stats: &'a PerKind<StreamStats>,
}

#[derive(Debug)]
enum State {
    Open(Box<AnalysisSession>),
    Finalized(Arc<AnalysisSession>),
}

/// Sole owner of the session while it is open. Finalizing freezes it into a
/// shared snapshot; later submissions are rejected.
#[derive(Debug)]
pub struct Aggregator {
    state: State,
}

impl Aggregator {
    pub fn new(config: &AnalysisConfig) -> Self {
        let session = AnalysisSession::new(config.duration, config.corruption.max_retained_payloads);
        Self {
            state: State::Open(Box::new(session)),
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, State::Finalized(_))
    }

    /// Current state of the session, open or finalized.
    pub fn session(&self) -> &AnalysisSession {
        match &self.state {
            State::Open(session) => session,
            State::Finalized(snapshot) => snapshot,
        }
    }

    pub fn snapshot(&self) -> Option<Arc<AnalysisSession>> {
        match &self.state {
            State::Open(_) => None,
            State::Finalized(snapshot) => Some(Arc::clone(snapshot)),
        }
    }

    /// Folds one analyzed packet into the session. A packet arriving past the
    /// duration bound is counted as late, not recorded, and finalizes the session.
    pub fn record(&mut self, analysis: PacketAnalysis) -> Result<(), SessionError> {
        let State::Open(session) = &mut self.state else {
            return Err(SessionError::Closed);
        };

        let bound = session.duration_bound;
        let arrival_ms = analysis.classification.arrival_ms;
        if arrival_ms > duration_ms(bound) {
            session.dropped_late += 1;
            self.finalize(FinishReason::DurationElapsed);
            return Err(SessionError::DurationElapsed {
                arrival: Duration::from_secs_f64(arrival_ms / 1000.0),
                bound,
            });
        }

        session.apply(analysis);
        Ok(())
    }

    /// Counts packets dropped for lacking a timestamp.
    pub fn record_dropped(&mut self, count: u64) -> Result<(), SessionError> {
        self.open_session().map(|session| session.dropped_untimed += count)
    }

    /// Counts packets that arrived past the duration bound.
    pub fn record_late(&mut self, count: u64) -> Result<(), SessionError> {
        self.open_session().map(|session| session.dropped_late += count)
    }

    fn open_session(&mut self) -> Result<&mut AnalysisSession, SessionError> {
        match &mut self.state {
            State::Open(session) => Ok(session),
            State::Finalized(_) => Err(SessionError::Closed),
        }
    }

    /// Freezes the session. Calling this again returns the existing snapshot.
    pub fn finalize(&mut self, reason: FinishReason) -> Arc<AnalysisSession> {
        let session = match &mut self.state {
            State::Finalized(snapshot) => return Arc::clone(snapshot),
            State::Open(session) => {
                std::mem::replace(session, Box::new(AnalysisSession::new(Duration::ZERO, 0)))
            }
        };

        let mut session = *session;
        session.finalization = Some(Finalization {
            finished_at: Local::now(),
            terminated_early: reason.is_early(),
            reason,
        });
        tracing::info!(
            packets = session.total_packets(),
            corruption_events = session.corruption.len(),
            discontinuities = session.discontinuities.len(),
            terminated_early = reason.is_early(),
            "session finalized: {}",
            reason.as_str()
        );

        let snapshot = Arc::new(session);
        self.state = State::Finalized(Arc::clone(&snapshot));
        snapshot
    }
}
