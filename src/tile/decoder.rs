//! Tile decoding.
//!
//! The pipeline treats the codec as a single `decode(bytes, hints)` boundary.
//! [`ImageTileDecoder`] is the default implementation on top of the `image`
//! crate.
//!
//! # Format Selection
//!
//! - If the request hints a `format` the decoder recognises, that codec is
//!   used directly.
//! - Otherwise the format is guessed from the leading magic bytes.

use std::io::Cursor;

use image::{DynamicImage, ImageFormat, ImageReader};

use crate::error::TileError;

use super::key::{TileHints, FORMAT_HINT};

/// Codec boundary: turns fetched bytes into an image.
///
/// Implementations must be cheap to share; decoding runs on the blocking
/// thread pool.
pub trait TileDecoder: Send + Sync {
    /// Decode `bytes`, honouring any format hint.
    fn decode(&self, bytes: &[u8], hints: &TileHints) -> Result<DynamicImage, TileError>;
}

/// Decoder backed by the `image` crate.
#[derive(Debug, Clone, Default)]
pub struct ImageTileDecoder {}

impl ImageTileDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self {}
    }
}

impl TileDecoder for ImageTileDecoder {
    fn decode(&self, bytes: &[u8], hints: &TileHints) -> Result<DynamicImage, TileError> {
        if bytes.is_empty() {
            return Err(TileError::Decode {
                message: "empty tile body".to_string(),
            });
        }

        reader_for(bytes, hints)?
            .decode()
            .map_err(|e| TileError::Decode {
                message: e.to_string(),
            })
    }
}

fn reader_for<'a>(
    bytes: &'a [u8],
    hints: &TileHints,
) -> Result<ImageReader<Cursor<&'a [u8]>>, TileError> {
    let cursor = Cursor::new(bytes);

    if let Some(format) = hints.get(FORMAT_HINT).and_then(|f| format_from_hint(f)) {
        return Ok(ImageReader::with_format(cursor, format));
    }

    ImageReader::new(cursor)
        .with_guessed_format()
        .map_err(|e| TileError::Decode {
            message: e.to_string(),
        })
}

/// Map a format hint (`png`, `jpg`, `image/jpeg`, ...) to a codec.
pub fn format_from_hint(hint: &str) -> Option<ImageFormat> {
    let hint = hint.trim().to_ascii_lowercase();
    let ext = hint.strip_prefix("image/").unwrap_or(&hint);
    match ext {
        "png" => Some(ImageFormat::Png),
        "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
        _ => None,
    }
}
