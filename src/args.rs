//! Commandline argument parsers using clap for the receiver and the emitter

use crate::config::{Endpoint, OutputConfig, PipelineConfig};
use crate::framing::Framing;
use crate::simulator::Target;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// Receives EMG windows, classifies them and drives the pedal pin
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct ReceiverArgs {
    #[command(subcommand)]
    /// Which task to perform
    pub command: ReceiverCommand,
}

/// Tasks the receiver can perform
#[derive(Debug, Subcommand, Clone)]
pub enum ReceiverCommand {
    /// Receive windows, classify them and drive the pedal pin
    #[command(about)]
    Listen(ListenCommand),

    /// List serial devices, Bluetooth RFCOMM bindings included
    #[command(about)]
    Ports,

    /// Print the effective configuration in RON
    #[command(about)]
    Config(ListenCommand),
}

/// Where to listen and how to process what arrives
#[derive(Debug, Args, Clone)]
pub struct ListenCommand {
    /// RON configuration file; command line options override it
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Listen on a TCP address, such as 0.0.0.0:5000
    #[arg(long, conflicts_with = "serial")]
    pub tcp: Option<String>,

    /// Read from a serial device, such as /dev/rfcomm0
    #[arg(long)]
    pub serial: Option<PathBuf>,

    /// Baud rate of the serial device
    #[arg(long, default_value_t = 115200)]
    pub baud: u32,

    /// Wait timeout for peers and frames in milliseconds, 0 for forever
    #[arg(short, long)]
    pub timeout_ms: Option<u64>,

    /// Number of timesteps in a window
    #[arg(long)]
    pub timesteps: Option<usize>,

    /// Number of channels in a window
    #[arg(long)]
    pub channels: Option<usize>,

    /// Activation thresholds of the envelope classifier
    #[arg(long)]
    #[clap(num_args = 1..)]
    pub thresholds: Option<Vec<f32>>,

    /// Output pin driven by the classification
    #[arg(short, long)]
    pub pin: Option<u32>,

    /// Log pin changes instead of writing to GPIO
    #[arg(long)]
    pub dry_run: bool,

    /// Run the stages on their own threads with queues this deep (1 or 2)
    #[arg(long)]
    pub queue_depth: Option<usize>,

    /// Treat everything up to a disconnect as one frame
    #[arg(long)]
    pub until_close: bool,
}

impl ListenCommand {
    /// Applies the command line options on top of `config`.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(address) = &self.tcp {
            config.endpoint = Endpoint::Tcp {
                address: address.clone(),
            };
        }
        if let Some(path) = &self.serial {
            config.endpoint = Endpoint::Serial {
                path: path.clone(),
                baud_rate: self.baud,
            };
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.timeout_ms = timeout_ms;
        }
        if let Some(timesteps) = self.timesteps {
            config.window.timesteps = timesteps;
        }
        if let Some(channels) = self.channels {
            config.window.channels = channels;
        }
        if let Some(thresholds) = &self.thresholds {
            config.classifier.thresholds = thresholds.clone();
        }
        if let Some(pin) = self.pin {
            config.actuator.pin = pin;
        }
        if self.dry_run {
            config.actuator.output = OutputConfig::Log;
        }
        if let Some(queue_depth) = self.queue_depth {
            config.queue_depth = queue_depth;
        }
        if self.until_close {
            config.framing = Framing::UntilClose;
        }
    }
}

/// Sends synthetic EMG windows to a biopedal receiver
#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
pub struct EmitterArgs {
    /// Send to a TCP address, such as 127.0.0.1:5000
    #[arg(long, conflicts_with = "serial", required_unless_present = "serial")]
    pub tcp: Option<String>,

    /// Send to a serial device
    #[arg(long)]
    pub serial: Option<PathBuf>,

    /// Baud rate of the serial device
    #[arg(long, default_value_t = 115200)]
    pub baud: u32,

    /// Number of windows to send, forever if not given
    #[arg(short = 'n', long)]
    pub count: Option<u32>,

    /// Milliseconds between windows
    #[arg(short, long, default_value_t = 200)]
    pub interval_ms: u64,

    /// Number of timesteps in a window
    #[arg(long, default_value_t = 100)]
    pub timesteps: usize,

    /// Number of channels in a window
    #[arg(long, default_value_t = 4)]
    pub channels: usize,

    /// Every n-th window is an activation burst, 0 for never
    #[arg(long, default_value_t = 4)]
    pub burst_every: u32,

    /// Peak of the carrier sine; use ADC counts with --i16
    #[arg(long, default_value_t = 1.0)]
    pub amplitude: f32,

    /// Peak of the uniform noise on every sample
    #[arg(long, default_value_t = 0.1)]
    pub noise: f32,

    /// Seed for a repeatable signal
    #[arg(long)]
    pub seed: Option<u64>,

    /// Send 16-bit samples instead of 32-bit floats
    #[arg(long)]
    pub i16: bool,

    /// Send samples without zlib compression
    #[arg(long)]
    pub raw: bool,

    /// Open a new connection for every window, with no framing
    #[arg(long)]
    pub until_close: bool,
}

impl EmitterArgs {
    /// Where to send, `None` if neither `--tcp` nor `--serial` was given.
    pub fn target(&self) -> Option<Target> {
        match (&self.tcp, &self.serial) {
            (Some(address), _) => Some(Target::Tcp {
                address: address.clone(),
            }),
            (None, Some(path)) => Some(Target::Serial {
                path: path.clone(),
                baud_rate: self.baud,
            }),
            (None, None) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::WindowShape;

    #[test]
    fn listen_overrides_config() {
        let args = ReceiverArgs::parse_from([
            "biopedal",
            "listen",
            "--serial",
            "/dev/rfcomm0",
            "--baud",
            "9600",
            "--channels",
            "8",
            "--thresholds",
            "1.5",
            "4",
            "--dry-run",
            "--queue-depth",
            "1",
        ]);
        let ReceiverCommand::Listen(listen) = args.command else {
            panic!("expected listen");
        };

        let mut config = PipelineConfig::default();
        listen.apply(&mut config);

        assert_eq!(
            config.endpoint,
            Endpoint::Serial {
                path: PathBuf::from("/dev/rfcomm0"),
                baud_rate: 9600
            }
        );
        assert_eq!(config.window.shape(), WindowShape::new(100, 8));
        assert_eq!(config.classifier.thresholds, vec![1.5, 4.0]);
        assert_eq!(config.actuator.output, OutputConfig::Log);
        assert_eq!(config.queue_depth, 1);
        assert_eq!(config.actuator.pin, 12);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn until_close_over_serial_fails_validation() {
        let args = ReceiverArgs::parse_from(["biopedal", "listen", "--serial", "/dev/rfcomm0", "--until-close"]);
        let ReceiverCommand::Listen(listen) = args.command else {
            panic!("expected listen");
        };
        let mut config = PipelineConfig::default();
        listen.apply(&mut config);

        assert_eq!(config.framing, Framing::UntilClose);
        assert!(config.validate().is_err());
    }

    #[test]
    fn tcp_and_serial_conflict() {
        assert!(ReceiverArgs::try_parse_from([
            "biopedal",
            "listen",
            "--tcp",
            "0.0.0.0:1",
            "--serial",
            "/dev/ttyUSB0"
        ])
        .is_err());
    }

    #[test]
    fn emitter_needs_a_target() {
        assert!(EmitterArgs::try_parse_from(["emitter"]).is_err());
        let args = EmitterArgs::try_parse_from(["emitter", "--tcp", "127.0.0.1:5000", "-n", "3"]).unwrap();
        assert_eq!(
            args.target(),
            Some(Target::Tcp {
                address: "127.0.0.1:5000".to_owned()
            })
        );
        assert_eq!(args.count, Some(3));
        assert_eq!(args.interval_ms, 200);
    }
}
