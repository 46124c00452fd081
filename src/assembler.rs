//! The Frame Assembler: turns a [RawFrame] into a [SampleWindow], or drops
//! it.
//!
//! Any frame whose decompressed size is not exactly one window is rejected
//! whole. A wrong-shaped tensor never reaches the classifier.

use crate::transport::RawFrame;
use crate::window::{SampleFormat, SampleWindow, WindowShape};

use flate2::read::ZlibDecoder;
use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use thiserror::Error;

/// How window payloads are compressed on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// zlib streams, as the ground unit's sender produces
    #[default]
    Zlib,
    /// Raw sample bytes
    None,
}

/// Why a frame could not be turned into a window.
#[derive(Debug, Error)]
pub enum AssemblyError {
    /// The payload is not a valid zlib stream
    #[error("corrupt compressed payload: {0}")]
    Decompression(#[source] io::Error),
    /// The decompressed payload is not exactly one window long
    #[error("expected {expected} bytes for one window, got {}", actual_len(.actual, .expected))]
    ShapeMismatch {
        /// Bytes one window takes
        expected: usize,
        /// Bytes the frame held
        actual: usize,
    },
}

/// Output buffers are never reserved beyond this up front.
const PREALLOC_LIMIT: usize = 1024 * 1024;

/// Decompression stops one byte past the expected size, so an `actual` of
/// `expected + 1` only means "too long".
fn actual_len(actual: &usize, expected: &usize) -> String {
    if actual > expected {
        format!("more than {}", expected)
    } else {
        actual.to_string()
    }
}

/// Decodes frames of one stream into windows of a fixed shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAssembler {
    shape: WindowShape,
    format: SampleFormat,
    compression: Compression,
}

impl FrameAssembler {
    /// An assembler for windows of `shape`, sent as `format` samples.
    pub fn new(shape: WindowShape, format: SampleFormat, compression: Compression) -> Self {
        Self {
            shape,
            format,
            compression,
        }
    }

    /// Shape of the windows produced.
    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    /// Number of decompressed bytes one window takes, saturating at
    /// `usize::MAX` for shapes too large to address.
    pub fn expected_bytes(&self) -> usize {
        self.shape.byte_len(self.format).unwrap_or(usize::MAX)
    }

    /// Decompresses `frame` and reshapes it into one window.
    pub fn assemble(&self, frame: &RawFrame) -> Result<SampleWindow, AssemblyError> {
        let expected = self.expected_bytes();
        let bytes = match self.compression {
            Compression::Zlib => inflate(&frame.bytes, expected)?,
            Compression::None => frame.bytes.clone(),
        };

        SampleWindow::from_bytes(self.shape, self.format, &bytes).ok_or(
            AssemblyError::ShapeMismatch {
                expected,
                actual: bytes.len(),
            },
        )
    }
}

/// Inflates a zlib stream, reading at most `expected + 1` bytes.
fn inflate(compressed: &[u8], expected: usize) -> Result<Vec<u8>, AssemblyError> {
    let mut out = Vec::with_capacity(expected.min(PREALLOC_LIMIT));
    ZlibDecoder::new(compressed)
        .take((expected as u64).saturating_add(1))
        .read_to_end(&mut out)
        .map_err(AssemblyError::Decompression)?;
    Ok(out)
}

/// Compresses raw window bytes the way the sender does.
pub fn deflate(raw: &[u8]) -> io::Result<Vec<u8>> {
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    let mut encoder = ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(raw)?;
    encoder.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, Rng, SeedableRng};
    use std::time::SystemTime;

    fn raw(bytes: Vec<u8>) -> RawFrame {
        RawFrame {
            seq: 0,
            received_at: SystemTime::now(),
            bytes,
        }
    }

    fn ground_unit() -> FrameAssembler {
        FrameAssembler::new(WindowShape::new(100, 4), SampleFormat::F32Le, Compression::Zlib)
    }

    #[test]
    fn zeros_make_a_zero_window() {
        let frame = raw(deflate(&[0u8; 1600]).unwrap());
        let window = ground_unit().assemble(&frame).unwrap();
        assert_eq!(window.shape(), WindowShape::new(100, 4));
        assert!(window.samples().iter().all(|&s| s == 0.0));
    }

    #[test]
    fn one_byte_short_is_a_shape_mismatch() {
        let frame = raw(deflate(&[0u8; 1599]).unwrap());
        let err = ground_unit().assemble(&frame).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::ShapeMismatch {
                expected: 1600,
                actual: 1599
            }
        ));
    }

    #[test]
    fn oversized_payload_stops_inflating() {
        let frame = raw(deflate(&vec![0u8; 1_000_000]).unwrap());
        let err = ground_unit().assemble(&frame).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::ShapeMismatch {
                expected: 1600,
                actual: 1601
            }
        ));
        assert_eq!(
            err.to_string(),
            "expected 1600 bytes for one window, got more than 1600"
        );
    }

    #[test]
    fn corrupt_payload_is_a_decompression_error() {
        let err = ground_unit()
            .assemble(&raw(b"definitely not zlib".to_vec()))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::Decompression(_)));
    }

    #[test]
    fn unaddressable_shape_is_a_mismatch() {
        let assembler =
            FrameAssembler::new(WindowShape::new(1 << 62, 4), SampleFormat::F32Le, Compression::Zlib);
        assert_eq!(assembler.expected_bytes(), usize::MAX);

        let err = assembler.assemble(&raw(deflate(&[0u8; 16]).unwrap())).unwrap_err();
        assert!(matches!(
            err,
            AssemblyError::ShapeMismatch {
                expected: usize::MAX,
                actual: 16
            }
        ));
    }

    #[test]
    fn truncated_zlib_stream_is_rejected() {
        let mut rng = StdRng::seed_from_u64(3);
        let noise: Vec<u8> = (0..1600).map(|_| rng.gen()).collect();
        let mut compressed = deflate(&noise).unwrap();
        compressed.truncate(compressed.len() / 2);
        assert!(ground_unit().assemble(&raw(compressed)).is_err());
    }

    #[test]
    fn round_trip_is_bit_identical() {
        let mut rng = StdRng::seed_from_u64(7);
        for (timesteps, channels) in [(1, 1), (100, 4), (37, 5)] {
            let shape = WindowShape::new(timesteps, channels);
            let samples: Vec<f32> = (0..shape.len()).map(|_| rng.gen_range(-1e3..1e3)).collect();
            let original = SampleWindow::from_samples(shape, samples).unwrap();
            let bytes = original.to_bytes(SampleFormat::F32Le);

            let assembler = FrameAssembler::new(shape, SampleFormat::F32Le, Compression::Zlib);
            let window = assembler.assemble(&raw(deflate(&bytes).unwrap())).unwrap();

            assert_eq!(window.to_bytes(SampleFormat::F32Le), bytes);
            assert_eq!(window, original);
        }
    }

    #[test]
    fn uncompressed_i16_frames() {
        let shape = WindowShape::new(2, 5);
        let assembler = FrameAssembler::new(shape, SampleFormat::I16Le, Compression::None);
        let bytes: Vec<u8> = (0..10i16).flat_map(|v| (v - 5).to_le_bytes()).collect();

        let window = assembler.assemble(&raw(bytes)).unwrap();

        assert_eq!(window.row(0), Some(&[-5.0, -4.0, -3.0, -2.0, -1.0][..]));
        assert!(assembler.assemble(&raw(vec![0; 19])).is_err());
    }

    #[test]
    fn every_wrong_length_is_rejected() {
        let shape = WindowShape::new(3, 2);
        let assembler = FrameAssembler::new(shape, SampleFormat::F32Le, Compression::None);
        for len in (0..64).filter(|&len| len != 24) {
            assert!(matches!(
                assembler.assemble(&raw(vec![0; len])),
                Err(AssemblyError::ShapeMismatch { expected: 24, .. })
            ));
        }
        assert!(assembler.assemble(&raw(vec![0; 24])).is_ok());
    }
}
