use crate::contract::{
    DecodedFrame, Dimensions, FrameSource, PixelBuffer, StillImageFormat, StreamError,
};

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    StillImage(StillImageFormat),
    Unclassified,
}

/// Looks only at the leading signature. Still images always arrive as one
/// self-contained chunk, so no reassembly is attempted.
pub fn classify(chunk: &[u8]) -> ChunkKind {
    if chunk.starts_with(&JPEG_MAGIC) {
        ChunkKind::StillImage(StillImageFormat::Jpeg)
    } else if chunk.starts_with(&PNG_MAGIC) {
        ChunkKind::StillImage(StillImageFormat::Png)
    } else {
        ChunkKind::Unclassified
    }
}

pub fn decode_still(chunk: &[u8], format: StillImageFormat) -> Result<DecodedFrame, StreamError> {
    let image_format = match format {
        StillImageFormat::Jpeg => image::ImageFormat::Jpeg,
        StillImageFormat::Png => image::ImageFormat::Png,
    };
    let rgba = image::load_from_memory_with_format(chunk, image_format)
        .map_err(|e| StreamError::StillImage(format!("{format}: {e}")))?
        .to_rgba8();
    let (width, height) = rgba.dimensions();
    let dims = Dimensions::new(width, height)
        .ok_or_else(|| StreamError::StillImage(format!("{format}: empty image")))?;

    Ok(DecodedFrame {
        dims,
        timestamp_us: None,
        pixels: PixelBuffer::Rgba8(rgba.into_raw()),
        source: FrameSource::StillImage(format),
    })
}
