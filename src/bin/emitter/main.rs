//! A synthetic headband. Streams generated sample windows to a receiver so
//! the pipeline can be run without hardware.

use biopedal::{
    args::EmitterArgs,
    assembler::Compression,
    framing::Framing,
    simulator::{Emitter, SignalGenerator, SignalSettings},
    stop::StopSignal,
    window::{SampleFormat, WindowShape, MAX_WINDOW_BYTES},
};

use clap::Parser;
use log::{error, warn};
use std::{process::ExitCode, time::Duration};

// Example:
// cargo run --bin emitter -- --tcp 127.0.0.1:5000 -n 20 --seed 1

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = EmitterArgs::parse();

    let Some(target) = args.target() else {
        error!("emitter : no target given");
        return ExitCode::FAILURE;
    };
    let shape = WindowShape::new(args.timesteps, args.channels);
    if !shape.is_valid() {
        error!("emitter : window shape {} has a zero dimension", shape);
        return ExitCode::FAILURE;
    }
    if !matches!(shape.byte_len(SampleFormat::F32Le), Some(len) if len <= MAX_WINDOW_BYTES) {
        error!("emitter : window shape {} is above the limit of {} bytes", shape, MAX_WINDOW_BYTES);
        return ExitCode::FAILURE;
    }

    let settings = SignalSettings {
        amplitude: args.amplitude,
        noise: args.noise,
        burst_every: args.burst_every,
        ..SignalSettings::default()
    };
    if let Err(e) = settings.validate() {
        error!("emitter : {}", e);
        return ExitCode::FAILURE;
    }
    let mut generator = SignalGenerator::new(shape, settings, args.seed);

    let emitter = Emitter {
        target,
        format: if args.i16 {
            SampleFormat::I16Le
        } else {
            SampleFormat::F32Le
        },
        compression: if args.raw {
            Compression::None
        } else {
            Compression::Zlib
        },
        framing: if args.until_close {
            Framing::UntilClose
        } else {
            Framing::LengthPrefixed
        },
        interval: Duration::from_millis(args.interval_ms),
    };

    let stop = StopSignal::from_process_signals().unwrap_or_else(|e| {
        warn!("cannot install signal handlers: {}", e);
        StopSignal::new()
    });

    match emitter.run(&mut generator, args.count, &stop) {
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            error!("emitter : {}", e);
            ExitCode::FAILURE
        }
    }
}
