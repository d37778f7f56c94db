//! In-process decoder used by tests, benches and the demo CLI. It records
//! every call and can be told to misbehave.

use std::cell::Cell;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::contract::{
    AccessUnit, CodecState, DecodedFrame, DecoderConfig, DecoderFactory, Dimensions, FrameSource,
    PixelBuffer, StreamError, VideoDecoder,
};
use crate::pipeline::FrameSender;

#[derive(Debug, Clone, Default)]
pub struct DecoderLog {
    pub created: usize,
    pub closed: usize,
    /// Every configuration attempted, accepted or not.
    pub configs: Vec<DecoderConfig>,
    pub decoded: Vec<AccessUnit>,
}

#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    pub reject_described_configs: bool,
    pub reject_all_configs: bool,
    /// `state()` keeps answering `Unconfigured` for this many queries after a
    /// successful `configure`, like a decoder that configures asynchronously.
    pub configure_delay_queries: usize,
    /// Each instance closes itself after this many successful decodes.
    pub close_after_decodes: Option<usize>,
    /// Each instance rejects decode calls once this many were accepted.
    pub reject_after_decodes: Option<usize>,
    /// Emit one NV12 picture of this size per decoded unit.
    pub emit_frames: Option<(u32, u32)>,
}

pub struct RecordingDecoder {
    behavior: MockBehavior,
    log: Arc<Mutex<DecoderLog>>,
    output: FrameSender,
    state: CodecState,
    configure_delay: Cell<usize>,
    decodes: usize,
}

impl VideoDecoder for RecordingDecoder {
    fn state(&self) -> CodecState {
        let delay = self.configure_delay.get();
        if self.state == CodecState::Configured && delay > 0 {
            self.configure_delay.set(delay - 1);
            return CodecState::Unconfigured;
        }
        self.state
    }

    fn configure(&mut self, config: &DecoderConfig) -> Result<(), StreamError> {
        lock_log(&self.log).configs.push(config.clone());
        if self.state == CodecState::Closed {
            return Err(StreamError::Decoder("configure on closed decoder".to_string()));
        }
        if self.behavior.reject_all_configs
            || (self.behavior.reject_described_configs && config.has_description())
        {
            self.state = CodecState::Closed;
            return Err(StreamError::Configuration(format!(
                "unsupported config {}",
                config.codec
            )));
        }
        self.state = CodecState::Configured;
        self.configure_delay.set(self.behavior.configure_delay_queries);
        Ok(())
    }

    fn decode(&mut self, unit: &AccessUnit) -> Result<(), StreamError> {
        if self.state != CodecState::Configured {
            return Err(StreamError::Decoder(format!("decode while {}", self.state)));
        }
        if self
            .behavior
            .reject_after_decodes
            .is_some_and(|limit| self.decodes >= limit)
        {
            self.state = CodecState::Closed;
            return Err(StreamError::Decoder("decode rejected".to_string()));
        }

        self.decodes += 1;
        lock_log(&self.log).decoded.push(unit.clone());

        if let Some(dims) = self.behavior.emit_frames.and_then(|(w, h)| Dimensions::new(w, h)) {
            let pitch = dims.width.get() as usize;
            let rows = dims.height.get() as usize;
            // Full channel or closed session: the picture is dropped, like a
            // real callback firing late.
            let _ = self.output.send(DecodedFrame {
                dims,
                timestamp_us: Some(unit.timestamp_us),
                pixels: PixelBuffer::Nv12 {
                    pitch,
                    data: vec![0x80; pitch * rows * 3 / 2],
                },
                source: FrameSource::Decoder,
            });
        }

        if self
            .behavior
            .close_after_decodes
            .is_some_and(|limit| self.decodes >= limit)
        {
            self.state = CodecState::Closed;
        }
        Ok(())
    }

    fn close(&mut self) {
        self.state = CodecState::Closed;
        lock_log(&self.log).closed += 1;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingDecoderFactory {
    behavior: MockBehavior,
    log: Arc<Mutex<DecoderLog>>,
}

impl RecordingDecoderFactory {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            log: Arc::new(Mutex::new(DecoderLog::default())),
        }
    }

    /// Shared handle, still readable after the factory moved into a session.
    pub fn log(&self) -> Arc<Mutex<DecoderLog>> {
        Arc::clone(&self.log)
    }

    pub fn snapshot(&self) -> DecoderLog {
        lock_log(&self.log).clone()
    }
}

impl DecoderFactory for RecordingDecoderFactory {
    fn create(&mut self, output: FrameSender) -> Result<Box<dyn VideoDecoder>, StreamError> {
        lock_log(&self.log).created += 1;
        Ok(Box::new(RecordingDecoder {
            behavior: self.behavior.clone(),
            log: Arc::clone(&self.log),
            output,
            state: CodecState::Unconfigured,
            configure_delay: Cell::new(0),
            decodes: 0,
        }))
    }
}

pub fn lock_log(log: &Mutex<DecoderLog>) -> MutexGuard<'_, DecoderLog> {
    match log.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
