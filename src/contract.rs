use std::num::NonZeroU32;
use std::{fmt, fmt::Display};

use crate::pipeline::FrameSender;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: NonZeroU32,
    pub height: NonZeroU32,
}

impl Dimensions {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Option<Self> {
        Some(Self {
            width: NonZeroU32::new(width)?,
            height: NonZeroU32::new(height)?,
        })
    }
}

impl Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillImageFormat {
    Jpeg,
    Png,
}

impl Display for StillImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jpeg => f.write_str("jpeg"),
            Self::Png => f.write_str("png"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PixelBuffer {
    Rgba8(Vec<u8>),
    Nv12 { pitch: usize, data: Vec<u8> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameSource {
    Decoder,
    StillImage(StillImageFormat),
}

/// A picture ready for the renderer, either produced by the external decoder
/// or decoded from a still-image fallback chunk.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub dims: Dimensions,
    pub timestamp_us: Option<u64>,
    pub pixels: PixelBuffer,
    pub source: FrameSource,
}

/// Configuration handed to the external decoder's `configure` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// RFC 6381 codec string, e.g. `avc1.64001F`.
    pub codec: String,
    /// AVCDecoderConfigurationRecord. `None` means the decoder has to find
    /// SPS/PPS in-band.
    pub description: Option<Vec<u8>>,
    pub coded_width: u32,
    pub coded_height: u32,
}

impl DecoderConfig {
    #[must_use]
    pub fn has_description(&self) -> bool {
        self.description.is_some()
    }
}

impl Display for DecoderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DecoderConfig(codec={}, description_bytes={}, coded={}x{})",
            self.codec,
            self.description.as_ref().map_or(0, Vec::len),
            self.coded_width,
            self.coded_height
        )
    }
}

/// One timestamped unit submitted to the external decoder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessUnit {
    /// Annex-B bytes, start code included.
    pub data: Vec<u8>,
    pub timestamp_us: u64,
    pub is_key: bool,
    pub nal_type: u8,
}

/// State reported by the external decoding capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecState {
    Unconfigured,
    Configured,
    Closed,
}

impl Display for CodecState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unconfigured => f.write_str("unconfigured"),
            Self::Configured => f.write_str("configured"),
            Self::Closed => f.write_str("closed"),
        }
    }
}

/// Caller-facing numbers: rendered frames and the last known picture size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub frame_count: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Display for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamStats(frame_count={}, width={:?}, height={:?})",
            self.frame_count, self.width, self.height
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("malformed stream: {0}")]
    MalformedStream(String),
    #[error("decoder configuration failed: {0}")]
    Configuration(String),
    #[error("decoder failed {attempts} times in a row: {message}")]
    DecoderFatal { attempts: u32, message: String },
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("still image decode failed: {0}")]
    StillImage(String),
    #[error("control channel error: {0}")]
    Control(String),
    #[error("decoder error: {0}")]
    Decoder(String),
    #[error("stream session is closed")]
    SessionClosed,
}

/// The external decoding capability. Calls return immediately; completion of
/// `configure` is observed through later `state()` queries and decoded
/// pictures arrive on the `FrameSender` the decoder was created with.
pub trait VideoDecoder {
    fn state(&self) -> CodecState;

    fn configure(&mut self, config: &DecoderConfig) -> Result<(), StreamError>;

    fn decode(&mut self, unit: &AccessUnit) -> Result<(), StreamError>;

    fn close(&mut self);
}

/// Creates decoder instances. Called once at first configuration and again
/// on every rebuild.
pub trait DecoderFactory {
    fn create(&mut self, output: FrameSender) -> Result<Box<dyn VideoDecoder>, StreamError>;
}

impl<F> DecoderFactory for F
where
    F: FnMut(FrameSender) -> Result<Box<dyn VideoDecoder>, StreamError>,
{
    fn create(&mut self, output: FrameSender) -> Result<Box<dyn VideoDecoder>, StreamError> {
        self(output)
    }
}

pub trait FrameRenderer {
    fn render(&mut self, frame: &DecodedFrame) -> Result<(), StreamError>;
}

/// Text side of the transport, used for the JSON control messages.
pub trait ControlChannel {
    fn send_text(&mut self, text: &str) -> Result<(), StreamError>;
}
