use std::fmt;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

mod avcc;
mod bitstream;
mod contract;
mod control;
mod dispatcher;
mod fallback;
mod lifecycle;
pub mod mock;
mod parameter_sets;
mod pipeline;

pub use avcc::{
    FALLBACK_CODEC, SpsInfo, avc_decoder_configuration_record, build_decoder_config, codec_string,
    fallback_decoder_config, parse_sps, strip_emulation_prevention,
};
use bitstream::starts_with_start_code;
pub use bitstream::{AnnexBScanner, NalUnit, ScannerStats, split_annexb};
pub use contract::{
    AccessUnit, CodecState, ControlChannel, DecodedFrame, DecoderConfig, DecoderFactory,
    Dimensions, FrameRenderer, FrameSource, PixelBuffer, StillImageFormat, StreamError,
    StreamStats, VideoDecoder,
};
pub use control::{ControlMessage, LinkStatus, StatusMessage};
pub use dispatcher::AccessUnitDispatcher;
pub use fallback::{ChunkKind, classify, decode_still};
pub use lifecycle::{DecoderLifecycle, DecoderState, DropReason, LifecycleSettings, UnitOutcome};
pub use parameter_sets::{ParameterSetCache, ParameterSets};
pub use pipeline::{ChannelStats, FrameReceiver, FrameSendError, FrameSender, frame_channel};

/// Every tunable of a stream session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub max_working_buffer: usize,
    pub max_parameter_buffer: usize,
    /// H.264 chunks to wait for SPS/PPS before configuring the Baseline fallback.
    pub parameter_set_deadline_chunks: u32,
    pub keyframe_timeout: Duration,
    pub frame_interval_us: u64,
    /// Consecutive rebuilds without decoder output before giving up.
    pub rebuild_budget: u32,
    pub coded_width_hint: u32,
    pub coded_height_hint: u32,
    pub output_capacity: usize,
    /// The source writes whole NAL units per message, so a chunk end also
    /// ends the unit in flight. Disable for transports that split units.
    pub flush_at_chunk_end: bool,
    pub max_size: u32,
    pub bit_rate_mbps: u32,
}

impl StreamConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_working_buffer: 1 << 20,
            max_parameter_buffer: 51_200,
            parameter_set_deadline_chunks: 6,
            keyframe_timeout: Duration::from_secs(3),
            frame_interval_us: 33_000,
            rebuild_budget: 3,
            coded_width_hint: 1920,
            coded_height_hint: 1080,
            output_capacity: 16,
            flush_at_chunk_end: true,
            max_size: 1080,
            bit_rate_mbps: 4,
        }
    }

    /// Defaults overlaid with `H264_INGEST_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::new();
        if let Some(v) = env_number("H264_INGEST_MAX_WORKING_BUFFER") {
            config.max_working_buffer = v.clamp(4 * 1024, 64 << 20) as usize;
        }
        if let Some(v) = env_number("H264_INGEST_KEYFRAME_TIMEOUT_MS") {
            config.keyframe_timeout = Duration::from_millis(v.clamp(0, 60_000));
        }
        if let Some(v) = env_number("H264_INGEST_REBUILD_BUDGET") {
            config.rebuild_budget = v.clamp(0, 100) as u32;
        }
        if let Some(v) = env_number("H264_INGEST_FRAME_INTERVAL_US") {
            config.frame_interval_us = v.clamp(1, 1_000_000);
        }
        if let Some(v) = env_number("H264_INGEST_OUTPUT_CAPACITY") {
            config.output_capacity = v.clamp(1, 1024) as usize;
        }
        if let Ok(v) = std::env::var("H264_INGEST_FLUSH_AT_CHUNK_END") {
            config.flush_at_chunk_end = v == "1" || v.eq_ignore_ascii_case("true");
        }
        config
    }

    fn coded_hint(&self) -> (u32, u32) {
        (self.coded_width_hint, self.coded_height_hint)
    }

    fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            frame_interval_us: self.frame_interval_us,
            keyframe_timeout: self.keyframe_timeout,
            rebuild_budget: self.rebuild_budget,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamConfig(working_buffer={}, parameter_buffer={}, parameter_deadline={} chunks, keyframe_timeout={:?}, frame_interval={}us, rebuild_budget={}, hint={}x{}, output_capacity={}, flush_at_chunk_end={}, max_size={}, bit_rate={}Mbps)",
            self.max_working_buffer,
            self.max_parameter_buffer,
            self.parameter_set_deadline_chunks,
            self.keyframe_timeout,
            self.frame_interval_us,
            self.rebuild_budget,
            self.coded_width_hint,
            self.coded_height_hint,
            self.output_capacity,
            self.flush_at_chunk_end,
            self.max_size,
            self.bit_rate_mbps
        )
    }
}

fn env_number(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<u64>().ok())
}

/// What one `ingest` call did with its chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub still_image: Option<StillImageFormat>,
    pub units: usize,
    pub parameter_sets: usize,
    /// Units accepted by the decoder, including a keyframe held from an
    /// earlier chunk that was released during this one.
    pub dispatched: usize,
    /// Keyframes kept back until the decoder finishes configuring.
    pub held: usize,
    pub dropped: usize,
    /// A new decoder configuration was applied.
    pub configured: bool,
    pub rebuilt: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestCounters {
    pub chunks: u64,
    pub bytes: u64,
    pub h264_chunks: u64,
    pub still_images: u64,
    pub units: u64,
    pub dispatched: u64,
    pub keyframes: u64,
    pub filler_dropped: u64,
    pub gated_dropped: u64,
    pub resyncs: u64,
    /// Chunks that did not begin with a start code right after a chunk-end
    /// flush. The unit they continue was already submitted truncated.
    pub misaligned_chunks: u64,
    pub rebuilds: u64,
}

/// One incoming stream: chunks in, decoded pictures out to the renderer.
pub struct StreamSession {
    config: StreamConfig,
    scanner: AnnexBScanner,
    parameter_sets: ParameterSetCache,
    lifecycle: DecoderLifecycle,
    frames: FrameReceiver,
    still_output: FrameSender,
    renderer: Box<dyn FrameRenderer>,
    control: Option<Box<dyn ControlChannel>>,
    link: LinkStatus,
    stats: StreamStats,
    counters: IngestCounters,
    chunks_without_config: u32,
    /// The previous chunk ended inside a unit that was flushed as complete.
    flushed_at_chunk_end: bool,
    closed: bool,
}

impl StreamSession {
    pub fn new(
        config: StreamConfig,
        factory: impl DecoderFactory + 'static,
        renderer: impl FrameRenderer + 'static,
    ) -> Self {
        let (output, frames) = frame_channel(config.output_capacity);
        info!("starting stream session with {config}");
        Self {
            scanner: AnnexBScanner::new(config.max_working_buffer),
            parameter_sets: ParameterSetCache::new(config.max_parameter_buffer),
            lifecycle: DecoderLifecycle::new(
                Box::new(factory),
                output.clone(),
                config.lifecycle_settings(),
            ),
            frames,
            still_output: output,
            renderer: Box::new(renderer),
            control: None,
            link: LinkStatus::default(),
            stats: StreamStats::default(),
            counters: IngestCounters::default(),
            chunks_without_config: 0,
            flushed_at_chunk_end: false,
            closed: false,
            config,
        }
    }

    #[must_use]
    pub fn with_control(mut self, control: impl ControlChannel + 'static) -> Self {
        self.control = Some(Box::new(control));
        self
    }

    /// Announces the requested encoding to the source, if a control channel
    /// is attached.
    pub fn start(&mut self) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::SessionClosed);
        }
        if self.control.is_none() {
            debug!("no control channel, source keeps its own encoding");
            return Ok(());
        }
        self.send_encoding()
    }

    pub fn request_encoding(&mut self, max_size: u32, bit_rate_mbps: u32) -> Result<(), StreamError> {
        if self.closed {
            return Err(StreamError::SessionClosed);
        }
        if max_size == 0 || bit_rate_mbps == 0 {
            return Err(StreamError::InvalidInput(format!(
                "max_size={max_size} bit_rate={bit_rate_mbps}Mbps"
            )));
        }
        self.config.max_size = max_size;
        self.config.bit_rate_mbps = bit_rate_mbps;
        self.send_encoding()
    }

    fn send_encoding(&mut self) -> Result<(), StreamError> {
        let text = ControlMessage::Config {
            max_size: self.config.max_size,
            bit_rate: self.config.bit_rate_mbps,
        }
        .to_json()?;
        let control = self
            .control
            .as_mut()
            .ok_or_else(|| StreamError::Control("no control channel attached".to_string()))?;
        control.send_text(&text)
    }

    /// Feeds a text message received on the control side of the transport.
    pub fn handle_status_text(&mut self, text: &str) -> Result<StatusMessage, StreamError> {
        let status = StatusMessage::parse(text)?;
        self.link.apply(&status);
        Ok(status)
    }

    pub fn ingest(&mut self, chunk: &[u8]) -> Result<IngestReport, StreamError> {
        self.ingest_at(chunk, Instant::now())
    }

    /// `ingest` with an explicit clock, for deterministic keyframe deadlines.
    pub fn ingest_at(&mut self, chunk: &[u8], now: Instant) -> Result<IngestReport, StreamError> {
        if self.closed {
            return Err(StreamError::SessionClosed);
        }
        self.counters.chunks += 1;
        self.counters.bytes += chunk.len() as u64;
        self.run(now, |session, now, report| session.process_chunk(chunk, now, report))
    }

    /// Ends the stream. The bytes after the last start code are taken as a
    /// complete unit and routed like any other. The session stays open.
    pub fn finish(&mut self) -> Result<IngestReport, StreamError> {
        self.finish_at(Instant::now())
    }

    pub fn finish_at(&mut self, now: Instant) -> Result<IngestReport, StreamError> {
        if self.closed {
            return Err(StreamError::SessionClosed);
        }
        self.run(now, |session, now, report| {
            session.flushed_at_chunk_end = false;
            let units: Vec<NalUnit> = session.scanner.flush().into_iter().collect();
            session.route_units(&units, now, report)
        })
    }

    fn run(
        &mut self,
        now: Instant,
        step: impl FnOnce(&mut Self, Instant, &mut IngestReport) -> Result<(), StreamError>,
    ) -> Result<IngestReport, StreamError> {
        let mut report = IngestReport::default();
        let rebuilds_before = self.lifecycle.rebuilds();
        let dispatched_before = self.lifecycle.dispatched();
        let result = step(self, now, &mut report);

        if self.lifecycle.rebuilds() != rebuilds_before {
            // Bytes buffered for the failed decoder are not replayed.
            self.scanner.reset();
            self.parameter_sets.clear();
            self.flushed_at_chunk_end = false;
            report.rebuilt = true;
        }
        report.dispatched = (self.lifecycle.dispatched() - dispatched_before) as usize;
        self.counters.units += report.units as u64;
        self.counters.dispatched = self.lifecycle.dispatched();
        self.counters.keyframes = self.lifecycle.keyframes_dispatched();
        self.counters.resyncs = self.scanner.stats().resyncs;
        self.counters.rebuilds = self.lifecycle.rebuilds();

        match result {
            Ok(()) => Ok(report),
            Err(err @ StreamError::DecoderFatal { .. }) => {
                self.link.last_error = Some(err.to_string());
                self.teardown();
                Err(err)
            }
            Err(err) => {
                self.link.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn process_chunk(
        &mut self,
        chunk: &[u8],
        now: Instant,
        report: &mut IngestReport,
    ) -> Result<(), StreamError> {
        if let ChunkKind::StillImage(format) = classify(chunk) {
            report.still_image = Some(format);
            self.counters.still_images += 1;
            match decode_still(chunk, format) {
                Ok(frame) => {
                    if let Err(err) = self.still_output.send(frame) {
                        debug!("still image dropped: {err:?}");
                    }
                }
                Err(err) => {
                    warn!("{err}");
                    self.link.last_error = Some(err.to_string());
                }
            }
            return Ok(());
        }

        self.counters.h264_chunks += 1;
        self.lifecycle.poll(now)?;

        if self.flushed_at_chunk_end && !chunk.is_empty() && !starts_with_start_code(chunk) {
            self.counters.misaligned_chunks += 1;
            let err = StreamError::MalformedStream(
                "chunk continues a unit that was already flushed at the previous chunk end"
                    .to_string(),
            );
            warn!("{err}; disable flush_at_chunk_end for transports that split units");
        }

        let mut units = self.scanner.push(chunk);
        self.flushed_at_chunk_end = false;
        if self.config.flush_at_chunk_end {
            if let Some(unit) = self.scanner.flush() {
                units.push(unit);
                self.flushed_at_chunk_end = true;
            }
        }

        self.route_units(&units, now, report)?;

        if self.lifecycle.requested_config().is_none() {
            self.chunks_without_config += 1;
            if self.chunks_without_config >= self.config.parameter_set_deadline_chunks {
                let timeout = StreamError::Timeout(format!(
                    "no parameter sets after {} chunks",
                    self.chunks_without_config
                ));
                warn!("{timeout}, configuring {FALLBACK_CODEC}");
                let fallback = fallback_decoder_config(self.config.coded_hint());
                report.configured |= self.lifecycle.apply_config(fallback)?;
            }
        }
        Ok(())
    }

    fn route_units(
        &mut self,
        units: &[NalUnit],
        now: Instant,
        report: &mut IngestReport,
    ) -> Result<(), StreamError> {
        for unit in units {
            report.units += 1;
            if unit.is_filler() {
                report.dropped += 1;
                self.counters.filler_dropped += 1;
                continue;
            }
            if unit.is_parameter_set() {
                report.parameter_sets += 1;
                if let Some(sets) = self.parameter_sets.observe(unit) {
                    let config = build_decoder_config(&sets, self.config.coded_hint());
                    report.configured |= self.lifecycle.apply_config(config)?;
                }
                continue;
            }
            match self.lifecycle.offer(unit, now)? {
                UnitOutcome::Dispatched { .. } => {}
                UnitOutcome::Held => report.held += 1,
                UnitOutcome::Dropped(reason) => {
                    debug!("dropped type {} unit: {reason:?}", unit.nal_type);
                    report.dropped += 1;
                    self.counters.gated_dropped += 1;
                }
            }
        }
        Ok(())
    }

    /// Hands every decoded picture waiting in the channel to the renderer.
    /// Returns how many were rendered.
    pub fn pump_output(&mut self) -> Result<usize, StreamError> {
        let mut rendered = 0;
        while let Some(frame) = self.frames.try_recv() {
            self.renderer.render(&frame)?;
            rendered += 1;
            self.stats.frame_count += 1;
            self.stats.width = Some(frame.dims.width.get());
            self.stats.height = Some(frame.dims.height.get());
        }
        Ok(rendered)
    }

    /// Idempotent; also run on drop.
    pub fn teardown(&mut self) {
        if self.closed {
            return;
        }
        self.lifecycle.teardown();
        self.scanner.reset();
        self.parameter_sets.clear();
        let discarded = self.frames.close();
        self.closed = true;
        info!(
            "stream session closed after {} chunks, {} frames rendered, {discarded} frames discarded",
            self.counters.chunks, self.stats.frame_count
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn state(&self) -> DecoderState {
        self.lifecycle.state()
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    pub fn counters(&self) -> IngestCounters {
        self.counters
    }

    pub fn channel_stats(&self) -> ChannelStats {
        self.frames.stats()
    }

    pub fn link_status(&self) -> &LinkStatus {
        &self.link
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// The configuration the live decoder accepted, if any.
    pub fn decoder_config(&self) -> Option<&DecoderConfig> {
        self.lifecycle.active_config()
    }

    pub fn buffered_bytes(&self) -> usize {
        self.scanner.buffered_len()
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for StreamSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSession")
            .field("config", &self.config)
            .field("lifecycle", &self.lifecycle)
            .field("stats", &self.stats)
            .field("counters", &self.counters)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_stream_defaults() {
        let config = StreamConfig::default();
        assert_eq!(config.max_parameter_buffer, 51_200);
        assert_eq!(config.parameter_set_deadline_chunks, 6);
        assert_eq!(config.keyframe_timeout, Duration::from_secs(3));
        assert_eq!(config.frame_interval_us, 33_000);
        assert_eq!(config.coded_hint(), (1920, 1080));
        assert!(config.to_string().contains("rebuild_budget=3"));
    }

    #[test]
    fn env_overrides_are_clamped() {
        // SAFETY: variables are unique to this test.
        unsafe {
            std::env::set_var("H264_INGEST_OUTPUT_CAPACITY", "0");
            std::env::set_var("H264_INGEST_KEYFRAME_TIMEOUT_MS", "1500");
        }
        let config = StreamConfig::from_env();
        assert_eq!(config.output_capacity, 1);
        assert_eq!(config.keyframe_timeout, Duration::from_millis(1500));
        unsafe {
            std::env::remove_var("H264_INGEST_OUTPUT_CAPACITY");
            std::env::remove_var("H264_INGEST_KEYFRAME_TIMEOUT_MS");
        }
    }
}
