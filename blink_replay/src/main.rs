use anyhow::{Context, Result, bail};
use blink_tracker::{Catalogue, CatalogueSpec, Frame, PipelineConfig, StreamPool};
use clap::Parser;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "blink_replay")]
#[command(
    about = "Replay a recorded detection log through the blink tracker and print decoded marker ids"
)]
#[command(version)]
struct Cli {
    /// Replay configuration (JSON): tracker settings, code catalogue and stream names.
    #[arg(long)]
    config: PathBuf,

    /// Detection log, one JSON frame record per line.
    #[arg(long)]
    frames: PathBuf,

    /// Framerate reported to every stream before the replay starts.
    #[arg(long)]
    framerate: Option<f64>,

    /// Print the decoded results every N frames of a stream (0 prints only the final state).
    #[arg(long, default_value = "0")]
    print_every: usize,
}

#[derive(Debug, Deserialize)]
struct ReplayConfig {
    #[serde(default)]
    pipeline: PipelineConfig,
    catalogue: CatalogueSpec,
    #[serde(default = "default_streams")]
    streams: Vec<String>,
}

fn default_streams() -> Vec<String> {
    vec!["cam0".to_string()]
}

/// One line of the detection log.
#[derive(Debug, Deserialize)]
struct FrameRecord {
    #[serde(default)]
    stream: Option<String>,
    #[serde(flatten)]
    frame: Frame,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // --- 1. Configuration ---
    let text = std::fs::read_to_string(&cli.config)
        .with_context(|| format!("reading config {}", cli.config.display()))?;
    let config: ReplayConfig = serde_json::from_str(&text)
        .with_context(|| format!("parsing config {}", cli.config.display()))?;
    let catalogue = Catalogue::from_spec(&config.catalogue).context("building code catalogue")?;

    // --- 2. Worker Pool ---
    let pool = StreamPool::new(config.pipeline, catalogue, config.streams)
        .context("starting stream pool")?;
    if let Some(framerate) = cli.framerate {
        for stream in 0..pool.len() {
            pool.update_framerate(stream, framerate)?;
        }
    }

    // --- 3. Replay Loop ---
    let file = File::open(&cli.frames)
        .with_context(|| format!("opening frame log {}", cli.frames.display()))?;
    let reader = BufReader::new(file);
    let mut frames_per_stream = vec![0usize; pool.len()];
    for (line_no, line) in reader.lines().enumerate() {
        let line = line.with_context(|| format!("reading line {}", line_no + 1))?;
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }
        let record: FrameRecord = serde_json::from_str(&line)
            .with_context(|| format!("parsing frame on line {}", line_no + 1))?;
        let stream = match record.stream.as_deref() {
            Some(name) => match pool.stream_index(name) {
                Some(index) => index,
                None => bail!("line {}: unknown stream `{}`", line_no + 1, name),
            },
            None => 0,
        };

        let summary = pool.process(stream, record.frame).await?;
        frames_per_stream[stream] += 1;
        tracing::debug!("line {}: {:?}", line_no + 1, summary);

        if cli.print_every > 0 && frames_per_stream[stream] % cli.print_every == 0 {
            print_results(&pool, stream)?;
        }
    }

    // --- 4. Final State ---
    let names: Vec<String> = pool.stream_names().map(str::to_string).collect();
    for (stream, name) in names.iter().enumerate() {
        println!("# {} ({} frames)", name, frames_per_stream[stream]);
        print_results(&pool, stream)?;
    }
    pool.shutdown().await;
    Ok(())
}

fn print_results(pool: &StreamPool, stream: usize) -> Result<()> {
    for report in pool.results(stream)? {
        let line = serde_json::json!({
            "stream": stream,
            "sequence": report.sequence.value(),
            "x": report.last.position.x,
            "y": report.last.position.y,
            "stamp": report.last.stamp,
            "led_on": report.last.led_on,
            "id": report.id.wire_value(),
        });
        println!("{line}");
    }
    Ok(())
}
