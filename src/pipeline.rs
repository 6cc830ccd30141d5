use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::analysis::{PacketAnalysis, StreamAnalyzer};
use crate::config::AnalysisConfig;
use crate::packet::{Normalizer, PacketRecord, PerKind, StreamKind};
use crate::session::{Aggregator, AnalysisSession, FinishReason, SessionError};
use crate::source::PacketSource;

const CHANNEL_CAPACITY: usize = 512;

/// Runs an analysis session over `source` until the configured duration
/// elapses, the source ends, or `shutdown` resolves.
///
/// Each stream kind is analyzed by its own task; a single aggregator owns
/// the session and finalizes it once every in-flight packet has drained.
/// The reader enforces the duration bound, so packets already handed to a
/// worker are always recorded.
pub async fn run_session<S, F>(config: AnalysisConfig, source: S, shutdown: F) -> Arc<AnalysisSession>
where
    S: PacketSource,
    F: Future<Output = ()>,
{
    let (video_in, video_out) = spawn_worker(StreamKind::Video, &config);
    let (audio_in, audio_out) = spawn_worker(StreamKind::Audio, &config);

    tracing::info!(duration_secs = config.duration.as_secs_f64(), "analysis session started");

    let senders = PerKind {
        video: video_in,
        audio: audio_in,
    };
    let aggregator = Aggregator::new(&config);
    let (outcome, mut aggregator) = tokio::join!(
        read_source(source, senders, config.duration, shutdown),
        aggregate(aggregator, video_out, audio_out),
    );

    if outcome.untimed > 0 {
        tracing::debug!(dropped = outcome.untimed, "packets without a timestamp were skipped");
        if let Err(e) = aggregator.record_dropped(outcome.untimed) {
            tracing::warn!(dropped = outcome.untimed, "untimed packet count lost: {}", e);
        }
    }
    if outcome.late > 0 {
        tracing::debug!(late = outcome.late, "packets past the session bound were skipped");
        if let Err(e) = aggregator.record_late(outcome.late) {
            tracing::warn!(late = outcome.late, "late packet count lost: {}", e);
        }
    }
    aggregator.finalize(outcome.reason)
}

#[derive(Debug)]
struct ReadOutcome {
    reason: FinishReason,
    untimed: u64,
    late: u64,
}

/// Pulls packets until the deadline, the end of the source, or shutdown.
/// Packets arriving past `duration` are counted and not forwarded; reading
/// continues so in-bound packets of the other kind still get through.
/// Dropping `senders` on return lets the workers drain and exit.
async fn read_source<S, F>(
    mut source: S,
    senders: PerKind<mpsc::Sender<PacketRecord>>,
    duration: std::time::Duration,
    shutdown: F,
) -> ReadOutcome
where
    S: PacketSource,
    F: Future<Output = ()>,
{
    let deadline = tokio::time::sleep(duration);
    tokio::pin!(deadline);
    tokio::pin!(shutdown);

    let mut normalizer = Normalizer::new();
    let mut untimed = 0u64;
    let mut late = 0u64;

    let reason = loop {
        tokio::select! {
            _ = &mut deadline => break FinishReason::DurationElapsed,
            _ = &mut shutdown => {
                tracing::info!("shutdown signal received");
                break FinishReason::Interrupted;
            }
            next = source.next_packet() => match next {
                Ok(Some(raw)) => match normalizer.normalize(raw) {
                    Ok(record) if record.arrival > duration => {
                        tracing::trace!(
                            stream = %record.stream_kind,
                            packet = record.id.0,
                            "packet arrived past the session bound"
                        );
                        late += 1;
                    }
                    Ok(record) => {
                        let kind = record.stream_kind;
                        if senders.get(kind).send(record).await.is_err() {
                            tracing::warn!(stream = %kind, "analysis worker stopped");
                            break FinishReason::SourceFailed;
                        }
                    }
                    Err(e) => {
                        tracing::trace!("dropping packet: {}", e);
                        untimed += 1;
                    }
                },
                Ok(None) if late > 0 => break FinishReason::DurationElapsed,
                Ok(None) => {
                    tracing::warn!("source ended before the session duration elapsed");
                    break FinishReason::SourceEnded;
                }
                Err(e) => {
                    tracing::error!("source failed: {}", e);
                    break FinishReason::SourceFailed;
                }
            }
        }
    };

    tracing::debug!(
        packets = normalizer.packets_normalized(),
        late,
        reason = reason.as_str(),
        "reader stopped"
    );
    ReadOutcome {
        reason,
        untimed,
        late,
    }
}

fn spawn_worker(
    kind: StreamKind,
    config: &AnalysisConfig,
) -> (mpsc::Sender<PacketRecord>, mpsc::Receiver<PacketAnalysis>) {
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(analyze_stream(StreamAnalyzer::new(kind, config), in_rx, out_tx));
    (in_tx, out_rx)
}

async fn analyze_stream(
    mut analyzer: StreamAnalyzer,
    mut input: mpsc::Receiver<PacketRecord>,
    output: mpsc::Sender<PacketAnalysis>,
) {
    let kind = analyzer.stream_kind();
    let mut analyzed = 0u64;
    while let Some(record) = input.recv().await {
        analyzed += 1;
        if output.send(analyzer.analyze(record)).await.is_err() {
            break;
        }
    }
    tracing::debug!(stream = %kind, analyzed, "analysis worker finished");
}

async fn aggregate(
    mut aggregator: Aggregator,
    mut video: mpsc::Receiver<PacketAnalysis>,
    mut audio: mpsc::Receiver<PacketAnalysis>,
) -> Aggregator {
    let mut video_open = true;
    let mut audio_open = true;

    while video_open || audio_open {
        tokio::select! {
            analysis = video.recv(), if video_open => match analysis {
                Some(analysis) => fold(&mut aggregator, analysis),
                None => video_open = false,
            },
            analysis = audio.recv(), if audio_open => match analysis {
                Some(analysis) => fold(&mut aggregator, analysis),
                None => audio_open = false,
            },
        }
    }

    aggregator
}

fn fold(aggregator: &mut Aggregator, analysis: PacketAnalysis) {
    let packet = analysis.classification.packet.0;
    match aggregator.record(analysis) {
        Ok(()) => {}
        Err(SessionError::Closed) => {
            tracing::warn!(packet, "analysis arrived after the session closed");
        }
        Err(SessionError::DurationElapsed { arrival, bound }) => {
            tracing::warn!(packet, ?arrival, ?bound, "packet past the session bound reached the aggregator");
        }
    }
}
