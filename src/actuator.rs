//! The Actuator Bridge: label in, one digital write out.

use crate::inference::ClassificationResult;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fmt, fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

/// A digital pin level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Level {
    /// Effect off
    Low,
    /// Effect on
    High,
}

impl From<bool> for Level {
    fn from(high: bool) -> Self {
        if high {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<Level> for bool {
    fn from(level: Level) -> Self {
        level == Level::High
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "LOW"),
            Level::High => write!(f, "HIGH"),
        }
    }
}

/// Why a label did not reach the pin.
#[derive(Debug, Error)]
pub enum ActuatorError {
    /// The label map has no level for this label
    #[error("no output level mapped for label {0}")]
    UnmappedLabel(usize),
    /// Writing to the output failed
    #[error("pin {pin}: {source}")]
    Io {
        /// Pin being written
        pin: u32,
        /// Underlying error
        #[source]
        source: io::Error,
    },
}

/// Hardware that can drive a digital pin.
pub trait DigitalOutput {
    /// Drives `pin` to `level`.
    fn set_output(&mut self, pin: u32, level: Level) -> Result<(), ActuatorError>;
}

impl<O: DigitalOutput + ?Sized> DigitalOutput for Box<O> {
    fn set_output(&mut self, pin: u32, level: Level) -> Result<(), ActuatorError> {
        (**self).set_output(pin, level)
    }
}

/// How labels translate into pin levels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelMap {
    /// Label 0 is LOW, every other label is HIGH
    #[default]
    Binary,
    /// Explicit lookup; labels missing from `levels` use `fallback`
    Table {
        /// Level per label
        levels: BTreeMap<usize, Level>,
        /// Level for every other label, if any
        fallback: Option<Level>,
    },
}

impl LabelMap {
    /// The level `label` maps to.
    pub fn level_for(&self, label: usize) -> Result<Level, ActuatorError> {
        match self {
            LabelMap::Binary => Ok(Level::from(label != 0)),
            LabelMap::Table { levels, fallback } => levels
                .get(&label)
                .copied()
                .or(*fallback)
                .ok_or(ActuatorError::UnmappedLabel(label)),
        }
    }
}

/// Drives one pin of a [DigitalOutput] from classification labels.
pub struct ActuatorBridge<O> {
    output: O,
    pin: u32,
    map: LabelMap,
    last: Option<Level>,
}

impl<O: DigitalOutput> ActuatorBridge<O> {
    /// A bridge writing to `pin` of `output`. Nothing is written until the
    /// first label arrives.
    pub fn new(output: O, pin: u32, map: LabelMap) -> Self {
        Self {
            output,
            pin,
            map,
            last: None,
        }
    }

    /// The driven pin.
    pub fn pin(&self) -> u32 {
        self.pin
    }

    /// The level most recently written successfully.
    pub fn last_level(&self) -> Option<Level> {
        self.last
    }

    /// The underlying output.
    pub fn output(&self) -> &O {
        &self.output
    }

    /// Maps `label` to a level and writes it to the pin.
    pub fn apply(&mut self, label: usize) -> Result<Level, ActuatorError> {
        let level = self.map.level_for(label)?;
        self.output.set_output(self.pin, level)?;
        if self.last != Some(level) {
            debug!("pin {} : {} (label {})", self.pin, level, label);
        }
        self.last = Some(level);
        Ok(level)
    }

    /// [ActuatorBridge::apply] for a classifier's result.
    pub fn apply_result(&mut self, result: &ClassificationResult) -> Result<Level, ActuatorError> {
        self.apply(result.label())
    }

    /// Drives the pin LOW if the last write left it HIGH.
    pub fn release(&mut self) -> Result<(), ActuatorError> {
        if self.last == Some(Level::High) {
            self.output.set_output(self.pin, Level::Low)?;
            self.last = Some(Level::Low);
            info!("pin {} : released to {}", self.pin, Level::Low);
        }
        Ok(())
    }
}

/// Linux sysfs GPIO (`/sys/class/gpio`). Pins are exported and configured
/// as outputs on first use; on drop every pin touched is driven LOW and
/// unexported again.
pub struct SysfsGpio {
    root: PathBuf,
    exported: Vec<u32>,
}

impl SysfsGpio {
    /// Where the kernel mounts the sysfs GPIO class.
    pub const DEFAULT_ROOT: &'static str = "/sys/class/gpio";

    /// A GPIO tree at `root`. No pin is touched until it is first driven.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            exported: Vec::new(),
        }
    }

    /// Claims `pin` right away and drives it LOW.
    pub fn open(root: impl Into<PathBuf>, pin: u32) -> Result<Self, ActuatorError> {
        let mut gpio = Self::new(root);
        gpio.set_output(pin, Level::Low)?;
        Ok(gpio)
    }

    fn pin_dir(&self, pin: u32) -> PathBuf {
        self.root.join(format!("gpio{}", pin))
    }

    fn write(path: &Path, value: &str, pin: u32) -> Result<(), ActuatorError> {
        fs::write(path, value).map_err(|source| ActuatorError::Io { pin, source })
    }

    fn export(&mut self, pin: u32) -> Result<(), ActuatorError> {
        if !self.pin_dir(pin).exists() {
            Self::write(&self.root.join("export"), &pin.to_string(), pin)?;
        }
        Self::write(&self.pin_dir(pin).join("direction"), "out", pin)?;
        self.exported.push(pin);
        info!("gpio{} : exported as output", pin);
        Ok(())
    }
}

impl DigitalOutput for SysfsGpio {
    fn set_output(&mut self, pin: u32, level: Level) -> Result<(), ActuatorError> {
        if !self.exported.contains(&pin) {
            self.export(pin)?;
        }
        let value = if bool::from(level) { "1" } else { "0" };
        Self::write(&self.pin_dir(pin).join("value"), value, pin)
    }
}

impl Drop for SysfsGpio {
    fn drop(&mut self) {
        for pin in std::mem::take(&mut self.exported) {
            let released = Self::write(&self.pin_dir(pin).join("value"), "0", pin)
                .and_then(|_| Self::write(&self.root.join("unexport"), &pin.to_string(), pin));
            match released {
                Ok(()) => info!("gpio{} : released", pin),
                Err(e) => warn!("gpio{} : release failed: {}", pin, e),
            }
        }
    }
}

/// An output that only logs, for running without hardware.
#[derive(Debug, Default)]
pub struct LogOutput {
    levels: BTreeMap<u32, Level>,
}

impl LogOutput {
    /// An output with every pin unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// The level `pin` was last driven to.
    pub fn level(&self, pin: u32) -> Option<Level> {
        self.levels.get(&pin).copied()
    }
}

impl DigitalOutput for LogOutput {
    fn set_output(&mut self, pin: u32, level: Level) -> Result<(), ActuatorError> {
        if self.levels.insert(pin, level) != Some(level) {
            info!("pin {} -> {}", pin, level);
        }
        Ok(())
    }
}
