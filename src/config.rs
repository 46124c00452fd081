//! Receiver configuration, read from a [ron] file. Every field has a
//! default, so a file only needs the fields it changes:
//!
//! ```ron
//! (
//!     endpoint: Serial(path: "/dev/rfcomm0", baud_rate: 115200),
//!     window: (timesteps: 50, channels: 8),
//!     actuator: (pin: 18, output: Log),
//! )
//! ```

use crate::actuator::{LabelMap, SysfsGpio};
use crate::assembler::{Compression, FrameAssembler};
use crate::framing::Framing;
use crate::pipeline::MAX_QUEUE_DEPTH;
use crate::transport::ListenerOptions;
use crate::window::{SampleFormat, WindowShape, MAX_WINDOW_BYTES};

use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;

/// Where the receiver listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endpoint {
    /// A TCP listening socket
    Tcp {
        /// Address to bind, such as `0.0.0.0:5000`
        address: String,
    },
    /// A serial device; `/dev/rfcommN` for a bound Bluetooth RFCOMM channel
    Serial {
        /// Device path
        path: PathBuf,
        /// Line speed
        baud_rate: u32,
    },
}

impl Default for Endpoint {
    fn default() -> Self {
        Endpoint::Tcp {
            address: "0.0.0.0:5000".to_owned(),
        }
    }
}

/// What one window looks like on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Rows per window
    pub timesteps: usize,
    /// Columns per window
    pub channels: usize,
    /// Sample encoding
    pub format: SampleFormat,
    /// Payload compression
    pub compression: Compression,
}

impl Default for WindowConfig {
    fn default() -> Self {
        let shape = WindowShape::default();
        Self {
            timesteps: shape.timesteps,
            channels: shape.channels,
            format: SampleFormat::default(),
            compression: Compression::default(),
        }
    }
}

impl WindowConfig {
    /// The configured window shape.
    pub fn shape(&self) -> WindowShape {
        WindowShape::new(self.timesteps, self.channels)
    }
}

/// Settings of the built-in envelope classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Ascending activation thresholds; n thresholds give n + 1 classes
    pub thresholds: Vec<f32>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            thresholds: vec![2.0],
        }
    }
}

/// Where pin levels are written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputConfig {
    /// Linux sysfs GPIO
    Sysfs {
        /// Usually `/sys/class/gpio`
        root: PathBuf,
    },
    /// Log level changes only
    Log,
}

impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig::Sysfs {
            root: PathBuf::from(SysfsGpio::DEFAULT_ROOT),
        }
    }
}

/// The pedal output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// GPIO line driven by the classification
    pub pin: u32,
    /// Label to level mapping
    pub map: LabelMap,
    /// Output backend
    pub output: OutputConfig,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            pin: 12,
            map: LabelMap::default(),
            output: OutputConfig::default(),
        }
    }
}

/// Everything the receiver needs to run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Where to listen
    pub endpoint: Endpoint,
    /// Longest wait for a peer or a frame, 0 waits forever
    pub timeout_ms: u64,
    /// Frames above this many bytes are dropped
    pub max_frame_bytes: usize,
    /// How the stream is cut into frames
    pub framing: Framing,
    /// Window layout
    pub window: WindowConfig,
    /// Envelope classifier settings
    pub classifier: ClassifierConfig,
    /// Output pin settings
    pub actuator: ActuatorConfig,
    /// 0 runs the stages in sequence, 1 or 2 pipelines them
    pub queue_depth: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            timeout_ms: 5000,
            max_frame_bytes: 64 * 1024,
            framing: Framing::default(),
            window: WindowConfig::default(),
            classifier: ClassifierConfig::default(),
            actuator: ActuatorConfig::default(),
            queue_depth: 0,
        }
    }
}

/// Errors loading, printing or checking a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        /// File that was asked for
        path: PathBuf,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// The file is not valid RON for a config
    #[error("malformed config: {0}")]
    Parse(#[from] ron::de::SpannedError),
    /// The config could not be serialised
    #[error("cannot write config: {0}")]
    Write(#[from] ron::Error),
    /// The values parse but cannot work together
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl PipelineConfig {
    /// Reads and validates a config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_ron(&text)
    }

    /// Parses and validates RON text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Self = ron::de::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Pretty-prints the config as RON.
    pub fn to_ron(&self) -> Result<String, ConfigError> {
        Ok(ron::ser::to_string_pretty(
            self,
            ron::ser::PrettyConfig::default(),
        )?)
    }

    /// Checks values that parse fine but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let shape = self.window.shape();
        if !shape.is_valid() {
            return invalid(format!("window shape {} has a zero dimension", shape));
        }
        let window_bytes = match shape.byte_len(self.window.format) {
            Some(len) if len <= MAX_WINDOW_BYTES => len,
            _ => {
                return invalid(format!(
                    "window shape {} is above the limit of {} bytes",
                    shape, MAX_WINDOW_BYTES
                ))
            }
        };
        if self.max_frame_bytes == 0 {
            return invalid("max_frame_bytes must be positive".to_owned());
        }
        if self.window.compression == Compression::None && self.max_frame_bytes < window_bytes {
            return invalid(format!(
                "max_frame_bytes {} is smaller than one uncompressed window",
                self.max_frame_bytes
            ));
        }
        if self.queue_depth > MAX_QUEUE_DEPTH {
            return invalid(format!(
                "queue_depth {} is above the maximum of {}",
                self.queue_depth, MAX_QUEUE_DEPTH
            ));
        }
        if let Some(t) = self.classifier.thresholds.iter().find(|t| !t.is_finite()) {
            return invalid(format!("classifier threshold {} is not finite", t));
        }
        if let Endpoint::Serial { baud_rate, .. } = self.endpoint {
            if baud_rate == 0 {
                return invalid("baud_rate must be positive".to_owned());
            }
            if self.framing == Framing::UntilClose {
                return invalid("UntilClose framing needs a TCP endpoint; a serial line never closes".to_owned());
            }
        }
        Ok(())
    }

    /// `timeout_ms` as a wait limit, `None` for forever.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    /// Options for the transport listener.
    pub fn listener_options(&self) -> ListenerOptions {
        ListenerOptions {
            timeout: self.timeout(),
            framing: self.framing,
            max_frame_bytes: self.max_frame_bytes,
        }
    }

    /// A frame assembler for the configured window.
    pub fn assembler(&self) -> FrameAssembler {
        FrameAssembler::new(
            self.window.shape(),
            self.window.format,
            self.window.compression,
        )
    }
}
