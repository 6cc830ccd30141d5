use serde::Serialize;

use crate::config::DriftConfig;
use crate::packet::PacketRecord;

/// How a packet's timestamp relates to the packets of its kind before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampStep {
    First,
    Advance,
    /// Presentation time behind an earlier packet, within the reorder window.
    Reordered,
    Backward,
    ForwardJump,
}

impl TimestampStep {
    pub fn is_discontinuity(self) -> bool {
        matches!(self, TimestampStep::Backward | TimestampStep::ForwardJump)
    }
}

/// Tracks decode order for one stream kind.
///
/// Packets carrying a DTS are judged on it, so B-frames in decode order
/// advance normally. Without a DTS the presentation high-water mark is the
/// reference, and a step back no larger than `reorder_window_ms` is frame
/// reordering rather than a reset.
#[derive(Debug, Clone)]
pub struct TimestampOrder {
    tolerance_ms: f64,
    reorder_window_ms: f64,
    reference_ms: Option<f64>,
}

impl TimestampOrder {
    pub fn new(config: &DriftConfig) -> Self {
        Self {
            tolerance_ms: config.discontinuity_tolerance_ms,
            reorder_window_ms: config.reorder_window_ms,
            reference_ms: None,
        }
    }

    /// Classifies the step to `record` and returns it with the reference it
    /// was measured against.
    pub fn observe(&mut self, record: &PacketRecord) -> (TimestampStep, f64) {
        let (key_ms, reordering) = match record.dts {
            Some(_) => (record.decode_ms(), false),
            None => (record.timestamp_ms(), true),
        };
        let Some(reference_ms) = self.reference_ms else {
            self.reference_ms = Some(key_ms);
            return (TimestampStep::First, key_ms);
        };

        let delta = key_ms - reference_ms;
        let step = if delta > self.tolerance_ms {
            TimestampStep::ForwardJump
        } else if delta >= 0.0 {
            TimestampStep::Advance
        } else if reordering && -delta <= self.reorder_window_ms {
            TimestampStep::Reordered
        } else {
            TimestampStep::Backward
        };

        if step != TimestampStep::Reordered {
            self.reference_ms = Some(key_ms);
        }
        (step, reference_ms)
    }
}
