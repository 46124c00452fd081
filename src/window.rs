//! Fixed-shape sample windows, the unit of work handed to the classifier.
//!
//! A [SampleWindow] holds `timesteps x channels` samples in row-major order,
//! so `samples[t * channels + c]` is channel `c` at timestep `t`. This is
//! the layout the headband packs its buffers in, and the layout a
//! `(1, timesteps, channels)` sequence model expects.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest window, in decoded bytes, a configuration may ask for.
pub const MAX_WINDOW_BYTES: usize = 16 * 1024 * 1024;

/// The `(timesteps, channels)` shape every window on a stream must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowShape {
    /// Number of rows (time samples) in a window
    pub timesteps: usize,
    /// Number of columns (electrodes) in a window
    pub channels: usize,
}

impl WindowShape {
    /// Makes a new shape. Both dimensions must be non-zero for the shape to
    /// be usable, see [WindowShape::is_valid].
    pub const fn new(timesteps: usize, channels: usize) -> Self {
        Self {
            timesteps,
            channels,
        }
    }

    /// Number of elements in a window of this shape, saturating at
    /// `usize::MAX`.
    pub const fn len(&self) -> usize {
        self.timesteps.saturating_mul(self.channels)
    }

    /// True when the shape holds no elements.
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A shape is valid when neither dimension is zero.
    pub const fn is_valid(&self) -> bool {
        self.timesteps > 0 && self.channels > 0
    }

    /// Number of bytes a window of this shape occupies on the wire, or
    /// `None` if that does not fit a `usize`.
    pub const fn byte_len(&self, format: SampleFormat) -> Option<usize> {
        match self.timesteps.checked_mul(self.channels) {
            Some(len) => len.checked_mul(format.size()),
            None => None,
        }
    }
}

impl Default for WindowShape {
    /// 100 timesteps of 4 channels, the shape the pedal model was trained on.
    fn default() -> Self {
        Self::new(100, 4)
    }
}

impl fmt::Display for WindowShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.timesteps, self.channels)
    }
}

/// The element type of the samples on the wire. Both are little-endian.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleFormat {
    /// 32-bit IEEE floats, what the ground unit receives
    #[default]
    F32Le,
    /// 16-bit signed ADC counts, what the EMG headband notifies
    I16Le,
}

impl SampleFormat {
    /// Size of one element in bytes.
    pub const fn size(&self) -> usize {
        match self {
            SampleFormat::F32Le => 4,
            SampleFormat::I16Le => 2,
        }
    }
}

/// A `timesteps x channels` block of samples, stored row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleWindow {
    shape: WindowShape,
    samples: Vec<f32>,
}

impl SampleWindow {
    /// Wraps `samples` as a window of `shape`. Returns `None` if the number
    /// of samples does not match the shape exactly.
    pub fn from_samples(shape: WindowShape, samples: Vec<f32>) -> Option<Self> {
        (shape.is_valid() && samples.len() == shape.len()).then_some(Self { shape, samples })
    }

    /// A window of `shape` filled with zeros.
    pub fn zeros(shape: WindowShape) -> Self {
        Self {
            shape,
            samples: vec![0.0; shape.len()],
        }
    }

    /// Decodes a window from its wire bytes. Returns `None` unless `bytes`
    /// holds exactly `shape.byte_len(format)` bytes.
    pub fn from_bytes(shape: WindowShape, format: SampleFormat, bytes: &[u8]) -> Option<Self> {
        if !shape.is_valid() || shape.byte_len(format) != Some(bytes.len()) {
            return None;
        }

        let samples = match format {
            SampleFormat::F32Le => bytes
                .chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            SampleFormat::I16Le => bytes
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32)
                .collect(),
        };

        Some(Self { shape, samples })
    }

    /// Encodes the window into its wire bytes. Encoding to
    /// [SampleFormat::I16Le] rounds and saturates each sample.
    pub fn to_bytes(&self, format: SampleFormat) -> Vec<u8> {
        match format {
            SampleFormat::F32Le => self.samples.iter().flat_map(|s| s.to_le_bytes()).collect(),
            SampleFormat::I16Le => self
                .samples
                .iter()
                .flat_map(|s| (s.round() as i16).to_le_bytes())
                .collect(),
        }
    }

    /// The window's shape.
    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    /// All samples in row-major order.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// The sample of `channel` at `timestep`, if both are in range.
    pub fn get(&self, timestep: usize, channel: usize) -> Option<f32> {
        if timestep >= self.shape.timesteps || channel >= self.shape.channels {
            return None;
        }
        Some(self.samples[timestep * self.shape.channels + channel])
    }

    /// One timestep across all channels.
    pub fn row(&self, timestep: usize) -> Option<&[f32]> {
        let width = self.shape.channels;
        self.samples.get(timestep * width..(timestep + 1) * width)
    }

    /// One channel across all timesteps.
    pub fn channel(&self, channel: usize) -> impl Iterator<Item = f32> + '_ {
        let width = self.shape.channels;
        let skip = if channel < width {
            channel
        } else {
            self.samples.len()
        };
        self.samples.iter().skip(skip).step_by(width.max(1)).copied()
    }

    /// Consumes the window, returning its samples.
    pub fn into_samples(self) -> Vec<f32> {
        self.samples
    }
}
