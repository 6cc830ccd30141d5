use std::collections::BTreeMap;

use crate::analysis::FrameType;
use crate::packet::StreamKind;
use crate::session::AnalysisSession;
use crate::stats::StreamSummary;

const RULE: &str = "------------------------------";
const DETAILED_EVENTS: usize = 20;

pub fn render_report(session: &AnalysisSession, url: &str) -> String {
    let mut report = String::new();
    report.push_str("RTSP Stream Analysis Report\n");
    report.push_str(&format!("Stream: {}\n", url));
    report.push_str(&format!(
        "Analysis started at: {}\n",
        session.started_at.format("%Y-%m-%d %H:%M:%S")
    ));
    report.push_str(&format!(
        "Session bound: {:.2} seconds\n",
        session.duration_bound.as_secs_f64()
    ));
    if let Some(finalization) = &session.finalization {
        let elapsed = finalization.finished_at - session.started_at;
        report.push_str(&format!(
            "Analysis duration: {:.2} seconds\n",
            elapsed.num_milliseconds() as f64 / 1000.0
        ));
        report.push_str(&format!("Finished: {}", finalization.reason.as_str()));
        if finalization.terminated_early {
            report.push_str(" (terminated early)");
        }
        report.push('\n');
    }
    if session.dropped_untimed > 0 {
        report.push_str(&format!(
            "Packets dropped without timestamp: {}\n",
            session.dropped_untimed
        ));
    }
    if session.dropped_late > 0 {
        report.push_str(&format!(
            "Packets past the duration bound: {}\n",
            session.dropped_late
        ));
    }

    report.push_str(RULE);
    report.push('\n');
    video_section(&mut report, &session.stats.video.summary());

    let audio = session.stats.audio.summary();
    if audio.packets > 0 {
        report.push_str(RULE);
        report.push('\n');
        audio_section(&mut report, &audio);
    }

    if !session.discontinuities.is_empty() {
        report.push_str(RULE);
        report.push('\n');
        report.push_str("Timestamp Discontinuities\n");
        for d in session.discontinuities.iter().take(DETAILED_EVENTS) {
            report.push_str(&format!(
                "  - {} packet #{}: {:.2} ms -> {:.2} ms ({:?})\n",
                d.stream_kind, d.packet, d.previous_ms, d.timestamp_ms, d.kind
            ));
        }
        more_line(&mut report, session.discontinuities.len(), "discontinuities");
    }

    report.push_str(RULE);
    report.push('\n');
    corruption_section(&mut report, session);

    report.push_str(RULE);
    report.push('\n');
    report.push_str("Analysis finished.\n");
    report
}

fn video_section(report: &mut String, stats: &StreamSummary) {
    report.push_str("Video Analysis\n");
    report.push_str(&format!("Total frames captured: {}\n", stats.packets));
    if stats.packets == 0 {
        report.push_str("No frames captured.\n");
        return;
    }
    if let Some(rate) = stats.packet_rate {
        report.push_str(&format!("Average FPS: {:.2}\n", rate));
    }

    report.push_str("Frame Type Distribution:\n");
    for frame_type in [FrameType::I, FrameType::P, FrameType::B, FrameType::Unknown] {
        let count = stats.frame_types.get(frame_type);
        if count > 0 {
            report.push_str(&format!("  - {}: {}\n", frame_type.as_str(), count));
        }
    }

    timing_lines(report, stats, "frame");

    let kb = |bytes: f64| bytes / 1024.0;
    if let (Some(mean), Some(min), Some(max)) = (stats.size.mean, stats.size.min, stats.size.max) {
        report.push_str(&format!("Average compressed frame size: {:.2} KB\n", kb(mean)));
        report.push_str(&format!("Min compressed frame size: {:.2} KB\n", kb(min as f64)));
        report.push_str(&format!("Max compressed frame size: {:.2} KB\n", kb(max as f64)));
    }
    percentile_line(report, stats);

    if stats.keyframe_hint_mismatches > 0 {
        report.push_str(&format!(
            "Keyframe hint mismatches: {}\n",
            stats.keyframe_hint_mismatches
        ));
    }
    if stats.unknown_codec_packets > 0 {
        report.push_str(&format!(
            "Packets with unknown codec: {}\n",
            stats.unknown_codec_packets
        ));
    }
    if stats.unresolved_slices > 0 {
        report.push_str(&format!(
            "Slices with unreadable headers (counted as P): {}\n",
            stats.unresolved_slices
        ));
    }
}

fn audio_section(report: &mut String, stats: &StreamSummary) {
    report.push_str("Audio Analysis\n");
    report.push_str(&format!("Total audio packets: {}\n", stats.packets));
    if let Some(rate) = stats.packet_rate {
        report.push_str(&format!("Average packets per second: {:.2}\n", rate));
    }
    if let (Some(mean), Some(min), Some(max)) = (stats.size.mean, stats.size.min, stats.size.max) {
        report.push_str(&format!("Average packet size: {:.2} bytes\n", mean));
        report.push_str(&format!("Min packet size: {} bytes\n", min));
        report.push_str(&format!("Max packet size: {} bytes\n", max));
    }
    percentile_line(report, stats);
    timing_lines(report, stats, "packet");
}

fn timing_lines(report: &mut String, stats: &StreamSummary, unit: &str) {
    if let Some(interval) = stats.mean_interval_ms {
        report.push_str(&format!("Average timestamp difference: {:.2} ms\n", interval));
    }
    if stats.non_monotonic_timestamps > 0 {
        report.push_str(&format!(
            "Warning: {} non-monotonic timestamps found\n",
            stats.non_monotonic_timestamps
        ));
    } else {
        report.push_str("Timestamps are monotonic.\n");
    }
    if stats.timestamp_gaps > 0 {
        report.push_str(&format!(
            "Warning: potential skipped {}s detected at {} points\n",
            unit, stats.timestamp_gaps
        ));
    } else {
        report.push_str("No significant timestamp gaps detected.\n");
    }
    if let (Some(mean), Some(max)) = (stats.drift.mean_ms, stats.drift.max_ms) {
        report.push_str(&format!("Average wall clock drift: {:.2} ms\n", mean));
        report.push_str(&format!("Max wall clock drift: {:.2} ms\n", max));
    }
}

fn percentile_line(report: &mut String, stats: &StreamSummary) {
    if let (Some(p50), Some(p90), Some(p99)) = (stats.size.p50, stats.size.p90, stats.size.p99) {
        report.push_str(&format!(
            "Size percentiles: p50 {} / p90 {} / p99 {} bytes\n",
            p50, p90, p99
        ));
    }
}

fn corruption_section(report: &mut String, session: &AnalysisSession) {
    report.push_str("CORRUPTION ANALYSIS\n");
    if session.corruption.is_empty() {
        report.push_str("No corrupted packets detected.\n");
        return;
    }

    report.push_str(&format!(
        "Total corruption events detected: {}\n",
        session.corruption.len()
    ));
    for kind in StreamKind::ALL {
        let count = session
            .corruption
            .iter()
            .filter(|e| e.stream_kind == kind)
            .count();
        if count > 0 {
            report.push_str(&format!("  {}: {}\n", kind, count));
        }
    }

    let mut by_reason: BTreeMap<&str, (usize, String)> = BTreeMap::new();
    for event in &session.corruption {
        by_reason
            .entry(event.reason.label())
            .or_insert_with(|| (0, event.reason.describe()))
            .0 += 1;
    }
    report.push_str("\nCorruption Types:\n");
    for (label, (count, example)) in &by_reason {
        report.push_str(&format!("  - {}: {} occurrences\n", label, count));
        report.push_str(&format!("    (e.g. {})\n", example));
    }

    report.push_str("\nDetailed Corruption Events:\n");
    for (i, event) in session.corruption.iter().take(DETAILED_EVENTS).enumerate() {
        report.push_str(&format!("  [{}] Packet #{} ({})\n", i + 1, event.packet, event.stream_kind));
        report.push_str(&format!("      Timestamp: {:.2} ms\n", event.timestamp_ms));
        report.push_str(&format!("      Frame Type: {}\n", event.frame_type.as_str()));
        report.push_str(&format!("      Error Type: {}\n", event.reason.label()));
        report.push_str(&format!("      Error: {}\n", event.reason.describe()));
    }
    more_line(report, session.corruption.len(), "corruption events");
}

fn more_line(report: &mut String, total: usize, what: &str) {
    if total > DETAILED_EVENTS {
        report.push_str(&format!("  ... and {} more {}\n", total - DETAILED_EVENTS, what));
    }
}
