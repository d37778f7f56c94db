use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use h264_ingest::mock::{MockBehavior, RecordingDecoderFactory};
use h264_ingest::{DecodedFrame, FrameRenderer, StreamConfig, StreamError, StreamSession};

#[derive(Parser, Debug)]
#[command(about = "Feed an Annex-B H.264 file through a stream session")]
struct Args {
    #[arg(long)]
    input: PathBuf,
    #[arg(long, default_value_t = 65536)]
    chunk_bytes: usize,
    /// Treat every chunk end as a unit end. File slices are not unit
    /// aligned, so only use this for inputs cut on unit boundaries.
    #[arg(long, default_value_t = false)]
    aligned_chunks: bool,
    #[arg(long)]
    width: Option<u32>,
    #[arg(long)]
    height: Option<u32>,
}

#[derive(Default)]
struct NullRenderer {
    frames: usize,
}

impl FrameRenderer for NullRenderer {
    fn render(&mut self, _frame: &DecodedFrame) -> Result<(), StreamError> {
        self.frames += 1;
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut config = StreamConfig::from_env();
    config.flush_at_chunk_end = args.aligned_chunks;
    let factory = RecordingDecoderFactory::new(MockBehavior {
        emit_frames: Some((
            args.width.unwrap_or(config.coded_width_hint),
            args.height.unwrap_or(config.coded_height_hint),
        )),
        ..MockBehavior::default()
    });
    let log = factory.log();
    let mut session = StreamSession::new(config, factory, NullRenderer::default());

    let data = fs::read(&args.input)
        .with_context(|| format!("failed to read input stream: {}", args.input.display()))?;
    let step = args.chunk_bytes.max(1);

    for chunk in data.chunks(step) {
        session.ingest(chunk).context("ingest failed")?;
        session.pump_output().context("render failed")?;
    }
    session.finish().context("finishing stream failed")?;
    session.pump_output().context("render failed")?;

    let stats = session.stats();
    let counters = session.counters();
    let decoded = h264_ingest::mock::lock_log(&log).decoded.len();
    println!(
        "frames={}, width={:?}, height={:?}, units={}, dispatched={}, decoded={}, resyncs={}, misaligned={}, rebuilds={}, state={}, codec={}, input={}, chunk_bytes={}",
        stats.frame_count,
        stats.width,
        stats.height,
        counters.units,
        counters.dispatched,
        decoded,
        counters.resyncs,
        counters.misaligned_chunks,
        counters.rebuilds,
        session.state(),
        session
            .decoder_config()
            .map_or_else(|| "-".to_string(), |c| c.codec.clone()),
        args.input.display(),
        step
    );

    session.teardown();
    Ok(())
}
