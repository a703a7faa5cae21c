//! JPEG compression of captured video frames.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{ExtendedColorType, ImageFormat, RgbImage};

use crate::error::CodecError;

/// Encode a frame at a fixed quality.
///
/// Quality is clamped into the encoder's 1-100 range, so 0 behaves as 1.
pub fn encode(frame: &RgbImage, quality: u8) -> Result<Bytes, CodecError> {
    let quality = quality.clamp(1, 100);
    let mut out = Vec::with_capacity(frame.as_raw().len() / 8);

    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            frame.as_raw(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| CodecError::Encode(e.to_string()))?;

    Ok(Bytes::from(out))
}

/// Decode a reassembled frame. Corrupt input is a per-frame error.
pub fn decode(data: &[u8]) -> Result<RgbImage, CodecError> {
    image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map(|img| img.to_rgb8())
        .map_err(|e| CodecError::Decode(e.to_string()))
}
