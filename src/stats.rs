//! Online accumulators behind the per-stream statistics. Nothing here keeps
//! individual samples, so memory stays flat for arbitrarily long sessions.

use std::collections::BTreeMap;

use hdrhistogram::Histogram;
use serde::{Serialize, Serializer};

use crate::analysis::{
    CorruptionEvent, Discontinuity, DriftSample, FrameClassification, FrameType, TimestampStep,
};

/// Running mean/variance (Welford) plus extrema.
#[derive(Debug, Clone, Default)]
pub struct OnlineStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl OnlineStats {
    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then_some(self.mean)
    }

    /// Population standard deviation.
    pub fn stddev(&self) -> Option<f64> {
        (self.count > 0).then(|| (self.m2 / self.count as f64).sqrt())
    }

    pub fn min(&self) -> Option<f64> {
        (self.count > 0).then_some(self.min)
    }

    pub fn max(&self) -> Option<f64> {
        (self.count > 0).then_some(self.max)
    }
}

/// Largest payload size tracked exactly; bigger payloads saturate here.
const MAX_TRACKED_SIZE: u64 = 64 * 1024 * 1024;
const SIGNIFICANT_FIGURES: u8 = 3;

/// Payload size distribution backing the p50/p90/p99 figures. Values keep
/// three significant figures, so a percentile is within 0.1% of the exact value.
#[derive(Debug, Clone, Default)]
pub struct SizeHistogram {
    inner: Option<Histogram<u64>>,
}

impl SizeHistogram {
    pub fn record(&mut self, value: u64) {
        if self.inner.is_none() {
            self.inner = match Histogram::new_with_max(MAX_TRACKED_SIZE, SIGNIFICANT_FIGURES) {
                Ok(histogram) => Some(histogram),
                Err(e) => {
                    tracing::warn!("size histogram unavailable: {}", e);
                    return;
                }
            };
        }
        if let Some(histogram) = &mut self.inner {
            histogram.saturating_record(value);
        }
    }

    /// `q`-quantile (0.0..=1.0) of the recorded sizes.
    pub fn percentile(&self, q: f64) -> Option<u64> {
        self.inner
            .as_ref()
            .filter(|histogram| histogram.len() > 0)
            .map(|histogram| histogram.value_at_quantile(q.clamp(0.0, 1.0)))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameTypeCounts {
    pub i: u64,
    pub p: u64,
    pub b: u64,
    pub audio: u64,
    pub unknown: u64,
}

impl FrameTypeCounts {
    pub fn record(&mut self, frame_type: FrameType) {
        *self.slot(frame_type) += 1;
    }

    pub fn get(&self, frame_type: FrameType) -> u64 {
        match frame_type {
            FrameType::I => self.i,
            FrameType::P => self.p,
            FrameType::B => self.b,
            FrameType::Audio => self.audio,
            FrameType::Unknown => self.unknown,
        }
    }

    fn slot(&mut self, frame_type: FrameType) -> &mut u64 {
        match frame_type {
            FrameType::I => &mut self.i,
            FrameType::P => &mut self.p,
            FrameType::B => &mut self.b,
            FrameType::Audio => &mut self.audio,
            FrameType::Unknown => &mut self.unknown,
        }
    }

    pub fn total(&self) -> u64 {
        self.i + self.p + self.b + self.audio + self.unknown
    }
}

/// Rolling statistics for one stream kind.
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    packets: u64,
    bytes: u64,
    frame_types: FrameTypeCounts,
    sizes: OnlineStats,
    size_histogram: SizeHistogram,
    drift: OnlineStats,
    max_abs_drift_ms: Option<f64>,
    drift_samples: u64,
    intervals: OnlineStats,
    last_decode_ms: Option<f64>,
    non_monotonic: u64,
    timestamp_gaps: u64,
    discontinuities: u64,
    corruption: BTreeMap<&'static str, u64>,
    hint_mismatches: u64,
    unknown_codec: u64,
    unresolved_slices: u64,
    first_arrival_ms: Option<f64>,
    last_arrival_ms: Option<f64>,
}

impl StreamStats {
    pub fn record_classification(&mut self, classification: &FrameClassification) {
        self.packets += 1;
        self.bytes += classification.size_bytes as u64;
        self.frame_types.record(classification.frame_type);
        self.sizes.push(classification.size_bytes as f64);
        self.size_histogram.record(classification.size_bytes as u64);

        if let Some(last) = self.last_decode_ms {
            let interval = classification.decode_ms - last;
            if interval >= 0.0 {
                if self
                    .intervals
                    .mean()
                    .is_some_and(|mean| mean > 0.0 && interval > 2.0 * mean)
                {
                    self.timestamp_gaps += 1;
                }
                self.intervals.push(interval);
            }
        }
        self.last_decode_ms = Some(classification.decode_ms);

        self.first_arrival_ms.get_or_insert(classification.arrival_ms);
        self.last_arrival_ms = Some(classification.arrival_ms);
    }

    /// Backward steps count as non-monotonic; reordered B-frames do not.
    pub fn record_drift(&mut self, sample: &DriftSample) {
        self.drift_samples += 1;
        if sample.step == TimestampStep::Backward {
            self.non_monotonic += 1;
        }
        self.drift.push(sample.drift_ms);
        if self
            .max_abs_drift_ms
            .map_or(true, |max| sample.drift_ms.abs() > max.abs())
        {
            self.max_abs_drift_ms = Some(sample.drift_ms);
        }
    }

    pub fn record_discontinuity(&mut self, _discontinuity: &Discontinuity) {
        self.discontinuities += 1;
    }

    pub fn record_corruption(&mut self, event: &CorruptionEvent) {
        *self.corruption.entry(event.reason.label()).or_default() += 1;
    }

    pub fn record_hint_mismatch(&mut self) {
        self.hint_mismatches += 1;
    }

    pub fn record_unknown_codec(&mut self) {
        self.unknown_codec += 1;
    }

    /// Slices whose header could not be read and were counted as P.
    pub fn record_unresolved_slices(&mut self, count: u64) {
        self.unresolved_slices += count;
    }

    pub fn packets(&self) -> u64 {
        self.packets
    }

    pub fn drift_samples(&self) -> u64 {
        self.drift_samples
    }

    pub fn frame_types(&self) -> &FrameTypeCounts {
        &self.frame_types
    }

    pub fn summary(&self) -> StreamSummary {
        let observed_span_ms = match (self.first_arrival_ms, self.last_arrival_ms) {
            (Some(first), Some(last)) if last > first => Some(last - first),
            _ => None,
        };

        StreamSummary {
            packets: self.packets,
            bytes: self.bytes,
            frame_types: self.frame_types,
            size: SizeSummary {
                min: self.sizes.min().map(|v| v as u64),
                max: self.sizes.max().map(|v| v as u64),
                mean: self.sizes.mean(),
                stddev: self.sizes.stddev(),
                p50: self.size_histogram.percentile(0.50),
                p90: self.size_histogram.percentile(0.90),
                p99: self.size_histogram.percentile(0.99),
            },
            drift: DriftSummary {
                mean_ms: self.drift.mean(),
                stddev_ms: self.drift.stddev(),
                max_ms: self.max_abs_drift_ms,
            },
            mean_interval_ms: self.intervals.mean(),
            packet_rate: observed_span_ms.map(|span| (self.packets - 1) as f64 * 1000.0 / span),
            non_monotonic_timestamps: self.non_monotonic,
            timestamp_gaps: self.timestamp_gaps,
            discontinuities: self.discontinuities,
            corruption_events: self.corruption.values().sum(),
            corruption_by_reason: self
                .corruption
                .iter()
                .map(|(reason, count)| (reason.to_string(), *count))
                .collect(),
            keyframe_hint_mismatches: self.hint_mismatches,
            unknown_codec_packets: self.unknown_codec,
            unresolved_slices: self.unresolved_slices,
        }
    }
}

impl Serialize for StreamStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.summary().serialize(serializer)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SizeSummary {
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub mean: Option<f64>,
    pub stddev: Option<f64>,
    pub p50: Option<u64>,
    pub p90: Option<u64>,
    pub p99: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriftSummary {
    pub mean_ms: Option<f64>,
    pub stddev_ms: Option<f64>,
    /// Signed sample with the largest magnitude.
    pub max_ms: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamSummary {
    pub packets: u64,
    pub bytes: u64,
    pub frame_types: FrameTypeCounts,
    pub size: SizeSummary,
    pub drift: DriftSummary,
    pub mean_interval_ms: Option<f64>,
    /// Packets per second of arrival time.
    pub packet_rate: Option<f64>,
    pub non_monotonic_timestamps: u64,
    pub timestamp_gaps: u64,
    pub discontinuities: u64,
    pub corruption_events: u64,
    pub corruption_by_reason: BTreeMap<String, u64>,
    pub keyframe_hint_mismatches: u64,
    pub unknown_codec_packets: u64,
    pub unresolved_slices: u64,
}
