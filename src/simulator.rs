//! A stand-in for the headband: synthetic windows and a sender that streams
//! them to a receiver.
//!
//! The signal is a sine carrier per channel plus uniform noise. Every
//! `burst_every`-th window is an activation burst, its amplitude scaled by
//! `burst_gain`, so an envelope classifier sees a rest/active pattern.

use crate::assembler::{deflate, Compression};
use crate::framing::{encode_frame, Framing};
use crate::stop::StopSignal;
use crate::window::{SampleFormat, SampleWindow, WindowShape};

use log::{debug, info, warn};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serial2::SerialPort;
use std::{
    f32::consts::PI,
    io::{self, Write},
    net::TcpStream,
    path::PathBuf,
    time::{Duration, Instant},
};

/// Shape of the synthetic signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignalSettings {
    /// Samples per second per channel
    pub sample_rate_hz: f32,
    /// Frequency of the carrier sine
    pub carrier_hz: f32,
    /// Peak of the carrier sine
    pub amplitude: f32,
    /// Peak of the uniform noise added to every sample
    pub noise: f32,
    /// Every n-th window is a burst, 0 for never
    pub burst_every: u32,
    /// Amplitude multiplier of a burst window
    pub burst_gain: f32,
}

impl SignalSettings {
    /// Rejects settings that cannot produce a signal: a non-positive sample
    /// rate, a negative noise level or any non-finite value.
    pub fn validate(&self) -> Result<(), String> {
        let values = [
            ("sample rate", self.sample_rate_hz),
            ("carrier", self.carrier_hz),
            ("amplitude", self.amplitude),
            ("noise", self.noise),
            ("burst gain", self.burst_gain),
        ];
        if let Some((name, value)) = values.iter().find(|(_, v)| !v.is_finite()) {
            return Err(format!("{} must be finite, got {}", name, value));
        }
        if self.sample_rate_hz <= 0.0 {
            return Err(format!("sample rate must be positive, got {}", self.sample_rate_hz));
        }
        if self.noise < 0.0 {
            return Err(format!("noise must not be negative, got {}", self.noise));
        }
        Ok(())
    }
}

impl Default for SignalSettings {
    fn default() -> Self {
        Self {
            sample_rate_hz: 500.0,
            carrier_hz: 10.0,
            amplitude: 1.0,
            noise: 0.1,
            burst_every: 4,
            burst_gain: 5.0,
        }
    }
}

/// Produces synthetic windows forever.
pub struct SignalGenerator {
    shape: WindowShape,
    settings: SignalSettings,
    rng: StdRng,
    sample: u64,
    window: u32,
}

impl SignalGenerator {
    /// A generator seeded from `seed`, or from the OS if there is none.
    pub fn new(shape: WindowShape, settings: SignalSettings, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            shape,
            settings,
            rng,
            sample: 0,
            window: 0,
        }
    }

    /// True if window number `index` (counting from 0) is a burst.
    pub fn is_burst(&self, index: u32) -> bool {
        let every = self.settings.burst_every;
        every > 0 && index % every == every - 1
    }

    /// The next window of the signal.
    pub fn next_window(&mut self) -> SampleWindow {
        let SignalSettings {
            sample_rate_hz,
            carrier_hz,
            amplitude,
            noise,
            burst_gain,
            ..
        } = self.settings;
        let gain = if self.is_burst(self.window) { burst_gain } else { 1.0 };
        let channels = self.shape.channels;

        let mut samples = Vec::with_capacity(self.shape.len());
        for t in 0..self.shape.timesteps as u64 {
            let phase = 2.0 * PI * carrier_hz * (self.sample + t) as f32 / sample_rate_hz;
            for c in 0..channels {
                let offset = PI * c as f32 / channels as f32;
                let jitter = if noise > 0.0 && noise.is_finite() {
                    self.rng.gen_range(-noise..noise)
                } else {
                    0.0
                };
                samples.push(gain * (amplitude * (phase + offset).sin() + jitter));
            }
        }

        self.sample += self.shape.timesteps as u64;
        self.window += 1;
        SampleWindow::from_samples(self.shape, samples).unwrap_or_else(|| SampleWindow::zeros(self.shape))
    }
}

impl Iterator for SignalGenerator {
    type Item = SampleWindow;
    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_window())
    }
}

/// Where the emitter sends windows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// A receiver listening on TCP
    Tcp {
        /// Receiver address, such as `127.0.0.1:5000`
        address: String,
    },
    /// A serial device
    Serial {
        /// Device path
        path: PathBuf,
        /// Line speed
        baud_rate: u32,
    },
}

impl Target {
    fn connect(&self) -> io::Result<Box<dyn Write>> {
        match self {
            Target::Tcp { address } => {
                let stream = TcpStream::connect(address)?;
                stream.set_nodelay(true)?;
                Ok(Box::new(stream))
            }
            Target::Serial { path, baud_rate } => Ok(Box::new(SerialPort::open(path, *baud_rate)?)),
        }
    }
}

/// Streams windows to a [Target] at a fixed rate.
#[derive(Debug, Clone)]
pub struct Emitter {
    /// Where windows go
    pub target: Target,
    /// Sample encoding
    pub format: SampleFormat,
    /// Payload compression
    pub compression: Compression,
    /// Length-prefixed, or one connection per window
    pub framing: Framing,
    /// Time between windows
    pub interval: Duration,
}

impl Emitter {
    /// The wire bytes of one window.
    pub fn encode(&self, window: &SampleWindow) -> io::Result<Vec<u8>> {
        let raw = window.to_bytes(self.format);
        let payload = match self.compression {
            Compression::Zlib => deflate(&raw)?,
            Compression::None => raw,
        };
        match self.framing {
            Framing::LengthPrefixed => encode_frame(&payload),
            Framing::UntilClose => Ok(payload),
        }
    }

    /// Sends one window. In [Framing::UntilClose] mode every window gets a
    /// connection of its own; otherwise `connection` is reused, and opened
    /// if there is none.
    fn send(&self, connection: &mut Option<Box<dyn Write>>, bytes: &[u8]) -> io::Result<()> {
        if self.framing == Framing::UntilClose {
            let mut stream = self.target.connect()?;
            stream.write_all(bytes)?;
            return stream.flush();
        }

        let stream = match connection.take() {
            Some(stream) => stream,
            None => self.target.connect()?,
        };
        let stream = connection.insert(stream);
        stream.write_all(bytes)?;
        stream.flush()
    }

    /// Sends `count` windows from `generator` (forever if `None`) or until
    /// `stop` fires. Windows that cannot be sent are logged and skipped, and
    /// the connection is reopened for the next one. Returns how many were
    /// sent.
    pub fn run(
        &self,
        generator: &mut SignalGenerator,
        count: Option<u32>,
        stop: &StopSignal,
    ) -> io::Result<u32> {
        if self.framing == Framing::UntilClose && matches!(self.target, Target::Serial { .. }) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "a serial line cannot be closed after every window",
            ));
        }

        info!("emitter : sending to {:?} every {:?}", self.target, self.interval);
        let started = Instant::now();
        let mut connection = None;
        let mut sent = 0;
        let mut index = 0;

        while count.map_or(true, |count| index < count) && !stop.is_stopped() {
            let burst = generator.is_burst(index);
            let bytes = self.encode(&generator.next_window())?;
            match self.send(&mut connection, &bytes) {
                Ok(()) => {
                    sent += 1;
                    debug!("emitter : window {} sent ({} bytes, burst {})", index, bytes.len(), burst);
                }
                Err(e) => {
                    warn!("emitter : window {} not sent: {}", index, e);
                    connection = None;
                }
            }

            index += 1;
            if let Some(wait) = (started + self.interval * index).checked_duration_since(Instant::now()) {
                spin_sleep::sleep(wait);
            }
        }

        info!("emitter : terminated after {} of {} windows.", sent, index);
        Ok(sent)
    }
}
