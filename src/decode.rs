//! Pixel buffers and the decoder seam.
//!
//! The cache and stretch engine only ever see a `PixelBuffer`: interleaved
//! f32 samples normalized to [0,1] plus the source header map. Anything that
//! can produce one plugs in through the `Decode` trait; the built-in
//! implementation handles the formats the `image` crate can open, and
//! anything else (vendor variants included) surfaces a `DecodeError` for the
//! operator to skip past.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use image::GenericImageView;
use serde_json::Value;
use thiserror::Error;

/// Sample type of the source data, before normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitDepth {
    U8,
    U16,
    F32,
}

/// Decoded image data. Samples are interleaved (`channels` per pixel),
/// normalized to [0,1] by the decoder. Handed out of the cache as
/// `Arc<PixelBuffer>`: shared, never mutated after construction.
#[derive(Debug)]
pub struct PixelBuffer {
    pub samples: Vec<f32>,
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub depth: BitDepth,
    /// Source header keywords, string-or-number values, opaque to the core.
    pub header: HashMap<String, Value>,
}

impl PixelBuffer {
    /// Approximate resident size in bytes, for the cache budget.
    pub fn footprint(&self) -> u64 {
        let samples = self.samples.len() as u64 * 4;
        let header: u64 = self
            .header
            .iter()
            .map(|(k, v)| (k.len() + v.to_string().len() + 48) as u64)
            .sum();
        samples + header
    }
}

/// Reasons are stringified rather than wrapped so failures can be cloned out
/// of the preload failure list as snapshots.
#[derive(Debug, Clone, Error)]
pub enum DecodeError {
    #[error("cannot read '{path}': {reason}")]
    Io { path: PathBuf, reason: String },
    #[error("cannot decode '{path}': {reason}")]
    Format { path: PathBuf, reason: String },
    #[error("no decoder for '.{extension}' files")]
    Unsupported { extension: String },
}

/// The decoder seam. Implementations run on preload worker threads, so they
/// must be `Send + Sync` and free of shared mutable state.
pub trait Decode: Send + Sync {
    fn decode(&self, path: &Path) -> Result<PixelBuffer, DecodeError>;
}

/// Built-in decoder over the `image` crate. Grayscale sources stay single
/// channel; everything else lands as interleaved RGB. Integer samples are
/// min/max normalized to [0,1], matching what the stretch presets expect.
pub struct ImageDecoder;

impl Decode for ImageDecoder {
    fn decode(&self, path: &Path) -> Result<PixelBuffer, DecodeError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        if matches!(ext.as_str(), "xisf" | "xifs" | "fits" | "fit" | "fts" | "raw") {
            // Vendor formats need the external decoder; report, don't guess.
            return Err(DecodeError::Unsupported { extension: ext });
        }

        let meta = std::fs::metadata(path).map_err(|e| DecodeError::Io {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let img = image::open(path).map_err(|e| DecodeError::Format {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let (width, height) = img.dimensions();
        let (mut samples, channels, depth): (Vec<f32>, u8, BitDepth) = match img {
            image::DynamicImage::ImageLuma8(g) => {
                let s = g.into_raw().into_iter().map(|v| v as f32).collect();
                (s, 1u8, BitDepth::U8)
            }
            image::DynamicImage::ImageLuma16(g) => {
                let s = g.into_raw().into_iter().map(|v| v as f32).collect();
                (s, 1u8, BitDepth::U16)
            }
            image::DynamicImage::ImageRgb16(rgb) => {
                let s = rgb.into_raw().into_iter().map(|v| v as f32).collect();
                (s, 3u8, BitDepth::U16)
            }
            other => {
                let s = other
                    .into_rgb8()
                    .into_raw()
                    .into_iter()
                    .map(|v| v as f32)
                    .collect();
                (s, 3u8, BitDepth::U8)
            }
        };
        normalize(&mut samples);

        let mut header = HashMap::new();
        header.insert("NAXIS1".into(), Value::from(width));
        header.insert("NAXIS2".into(), Value::from(height));
        header.insert("CHANNELS".into(), Value::from(channels));
        header.insert("FORMAT".into(), Value::from(ext.to_uppercase()));
        header.insert("FILESIZE".into(), Value::from(meta.len()));

        Ok(PixelBuffer {
            samples,
            width,
            height,
            channels,
            depth,
            header,
        })
    }
}

/// Min/max normalize in place. A flat image maps to all zeros.
fn normalize(samples: &mut [f32]) {
    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &s in samples.iter() {
        if s < min {
            min = s;
        }
        if s > max {
            max = s;
        }
    }
    if max > min {
        let span = max - min;
        for s in samples.iter_mut() {
            *s = (*s - min) / span;
        }
    } else {
        samples.fill(0.0);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_maps_to_unit_range() {
        let mut s = vec![10.0, 20.0, 30.0];
        normalize(&mut s);
        assert_eq!(s, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn normalize_flat_image_is_zero() {
        let mut s = vec![7.0, 7.0, 7.0];
        normalize(&mut s);
        assert_eq!(s, vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn vendor_formats_are_reported_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("light.xisf");
        std::fs::write(&p, b"not really xisf").unwrap();
        let err = ImageDecoder.decode(&p).unwrap_err();
        assert!(matches!(err, DecodeError::Unsupported { .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = ImageDecoder
            .decode(Path::new("/nonexistent/a.png"))
            .unwrap_err();
        assert!(matches!(err, DecodeError::Io { .. }));
    }

    #[test]
    fn garbage_png_is_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("broken.png");
        std::fs::write(&p, b"definitely not a png").unwrap();
        let err = ImageDecoder.decode(&p).unwrap_err();
        assert!(matches!(err, DecodeError::Format { .. }));
    }

    #[test]
    fn decodes_png_to_normalized_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("grad.png");
        // 4x1 grayscale gradient
        let pixels: Vec<u8> = vec![0, 85, 170, 255];
        image::save_buffer(&p, &pixels, 4, 1, image::ExtendedColorType::L8).unwrap();

        let buf = ImageDecoder.decode(&p).unwrap();
        assert_eq!(buf.width, 4);
        assert_eq!(buf.height, 1);
        assert_eq!(buf.channels, 1);
        assert_eq!(buf.depth, BitDepth::U8);
        assert_eq!(buf.samples.first().copied(), Some(0.0));
        assert_eq!(buf.samples.last().copied(), Some(1.0));
        assert_eq!(buf.header["FORMAT"], Value::from("PNG"));
    }

    #[test]
    fn footprint_counts_samples() {
        let buf = PixelBuffer {
            samples: vec![0.0; 100],
            width: 10,
            height: 10,
            channels: 1,
            depth: BitDepth::F32,
            header: HashMap::new(),
        };
        assert_eq!(buf.footprint(), 400);
    }

    #[test]
    fn byte_decoder_counts_and_fails_on_marker() {
        use testutil::ByteDecoder;
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.raw");
        let bad = dir.path().join("bad.raw");
        std::fs::write(&good, [0u8, 255u8]).unwrap();
        std::fs::write(&bad, b"BAD").unwrap();

        let d = ByteDecoder::new();
        let buf = d.decode(&good).unwrap();
        assert_eq!(buf.samples, vec![0.0, 1.0]);
        assert!(d.decode(&bad).is_err());
        assert_eq!(d.count(), 2);
    }
}
