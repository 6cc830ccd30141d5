use std::path::PathBuf;

use chrono::Local;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use streamripper::config::{Config, DEFAULT_CONFIG_PATH};
use streamripper::report::{self, ReportOptions};
use streamripper::run_session;
use streamripper::source::{FfmpegSource, RtspOptions};

/// Analyze an RTSP stream for frame types, timing drift and corruption.
#[derive(Debug, Parser)]
#[command(name = "streamripper", version)]
struct Cli {
    /// RTSP URL to analyze; overrides `[source] url` in the config file
    url: Option<String>,

    /// Path to the config file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Capture duration in seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Directory the session directory is created in
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Do not write flow.csv
    #[arg(long)]
    no_flow_log: bool,

    /// Do not write corruption.txt and payload dumps
    #[arg(long)]
    no_forensic: bool,

    /// Do not save the raw video elementary stream
    #[arg(long)]
    no_save_stream: bool,
}

impl Cli {
    fn apply(self, config: &mut Config) {
        if let Some(url) = self.url {
            config.source.url = Some(url);
        }
        if let Some(duration) = self.duration {
            config.session.duration_secs = duration;
        }
        if let Some(dir) = self.output_dir {
            config.output.dir = dir;
        }
        config.output.flow_log &= !self.no_flow_log;
        config.output.forensic &= !self.no_forensic;
        config.output.save_stream &= !self.no_save_stream;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("streamripper=debug".parse()?))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config)?;
    cli.apply(&mut config);

    let url = config.source_url()?.to_string();
    let analysis = config.analysis()?;
    let dir = report::create_session_dir(&config.output.dir, &url, &Local::now())?;
    tracing::info!(
        dir = %dir.display(),
        duration_secs = config.session.duration_secs,
        "analyzing stream"
    );

    let source = FfmpegSource::spawn(RtspOptions {
        url: url.clone(),
        transport: config.source.transport.clone(),
        save_stream: config.output.save_stream.then(|| dir.clone()),
    })?;

    let session = run_session(analysis, source, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await;

    let options = ReportOptions {
        url: url.clone(),
        flow_log: config.output.flow_log,
        forensic: config.output.forensic,
    };
    report::write_reports(&dir, &session, &options)?;
    print!("{}", report::text::render_report(&session, &url));

    tracing::info!(dir = %dir.display(), "analysis complete");
    Ok(())
}
