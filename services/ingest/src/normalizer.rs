//! Image normalization before storage.
//!
//! Every upload is scaled and center-cropped to the canonical detector input
//! size and re-encoded in its source format. Formats the encoder cannot write
//! fall back to PNG.

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageOutputFormat};
use std::io::Cursor;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur during normalization.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Uploaded file is empty")]
    Empty,

    #[error("Unrecognized image format")]
    UnknownFormat,

    #[error("Failed to decode {format:?} image: {message}")]
    Undecodable { format: ImageFormat, message: String },

    #[error("Failed to encode normalized image: {0}")]
    EncodeFailed(String),
}

/// A normalized image ready for storage.
#[derive(Debug, Clone)]
pub struct NormalizedImage {
    pub data: Bytes,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub original_width: u32,
    pub original_height: u32,
}

impl NormalizedImage {
    /// Canonical file extension for the stored format
    pub fn extension(&self) -> &'static str {
        self.format.extensions_str().first().copied().unwrap_or("bin")
    }
}

/// Scales uploads to a fixed canonical size.
#[derive(Debug, Clone, Copy)]
pub struct ImageNormalizer {
    target_width: u32,
    target_height: u32,
}

impl ImageNormalizer {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Decode, cover-fit to the target size, and re-encode.
    ///
    /// CPU bound; async callers should run it on the blocking pool.
    pub fn normalize(&self, data: &[u8]) -> Result<NormalizedImage, NormalizeError> {
        if data.is_empty() {
            return Err(NormalizeError::Empty);
        }

        let source_format = image::guess_format(data).map_err(|_| NormalizeError::UnknownFormat)?;
        let decoded = image::load_from_memory_with_format(data, source_format).map_err(|e| {
            NormalizeError::Undecodable {
                format: source_format,
                message: e.to_string(),
            }
        })?;

        let (original_width, original_height) = (decoded.width(), decoded.height());
        let resized = decoded.resize_to_fill(
            self.target_width,
            self.target_height,
            FilterType::Lanczos3,
        );

        let (data, format) = match encode(&resized, source_format) {
            Ok(encoded) => (encoded, source_format),
            Err(e) => {
                debug!(format = ?source_format, error = %e, "Re-encoding unsupported, falling back to PNG");
                (encode(&resized, ImageFormat::Png)?, ImageFormat::Png)
            }
        };

        Ok(NormalizedImage {
            data: Bytes::from(data),
            format,
            width: resized.width(),
            height: resized.height(),
            original_width,
            original_height,
        })
    }
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, NormalizeError> {
    // JPEG has no alpha channel
    let image = if format == ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(image.to_rgb8())
    } else {
        image.clone()
    };

    let mut buffer = Cursor::new(Vec::new());
    image
        .write_to(&mut buffer, ImageOutputFormat::from(format))
        .map_err(|e| NormalizeError::EncodeFailed(e.to_string()))?;
    Ok(buffer.into_inner())
}
