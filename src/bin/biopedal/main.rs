//! The ground unit: receives sample windows, classifies them and drives the
//! pedal's effect switch.

use biopedal::{
    actuator::{ActuatorBridge, ActuatorError, DigitalOutput, LogOutput, SysfsGpio},
    args::{ListenCommand, ReceiverArgs, ReceiverCommand},
    config::{ConfigError, Endpoint, OutputConfig, PipelineConfig},
    inference::{EnvelopeClassifier, InferenceEngine},
    pipeline::{Pipeline, PipelineError},
    stop::StopSignal,
    transport::{Listener, SerialTransport, TcpTransport, Transport},
};

use clap::Parser;
use log::{error, info, warn};
use serial2::SerialPort;
use std::process::ExitCode;

// Example:
// cargo run --bin biopedal -- listen --tcp 0.0.0.0:5000 --dry-run
// cargo run --bin biopedal -- listen --serial /dev/rfcomm0 --pin 12

const EXIT_CONFIG: u8 = 1;
const EXIT_BIND: u8 = 2;
const EXIT_STAGE: u8 = 3;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = ReceiverArgs::parse();

    match args.command {
        ReceiverCommand::Listen(listen) => run_listen(&listen),
        ReceiverCommand::Ports => list_ports(),
        ReceiverCommand::Config(listen) => match load_config(&listen).and_then(|c| c.to_ron()) {
            Ok(text) => {
                println!("{}", text);
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("config : {}", e);
                ExitCode::from(EXIT_CONFIG)
            }
        },
    }
}

/// The config file, if any, with the command line applied on top.
fn load_config(listen: &ListenCommand) -> Result<PipelineConfig, ConfigError> {
    let mut config = match &listen.config {
        Some(path) => PipelineConfig::from_path(path)?,
        None => PipelineConfig::default(),
    };
    listen.apply(&mut config);
    config.validate()?;
    Ok(config)
}

fn run_listen(listen: &ListenCommand) -> ExitCode {
    let config = match load_config(listen) {
        Ok(config) => config,
        Err(e) => {
            error!("config : {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let stop = StopSignal::from_process_signals().unwrap_or_else(|e| {
        warn!("cannot install signal handlers, stop with kill -9: {}", e);
        StopSignal::new()
    });

    let output = match open_output(&config) {
        Ok(output) => output,
        Err(e) => {
            error!("actuator : {}", e);
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let result = match &config.endpoint {
        Endpoint::Tcp { address } => run(TcpTransport::new(address.as_str()), &config, output, &stop),
        Endpoint::Serial { path, baud_rate } => run(
            SerialTransport::new(path.clone(), *baud_rate),
            &config,
            output,
            &stop,
        ),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ PipelineError::Bind(_)) => {
            error!("listener : {}", e);
            ExitCode::from(EXIT_BIND)
        }
        Err(e @ PipelineError::StagePanicked(_)) => {
            error!("pipeline : {}", e);
            ExitCode::from(EXIT_STAGE)
        }
    }
}

fn open_output(config: &PipelineConfig) -> Result<Box<dyn DigitalOutput + Send>, ActuatorError> {
    Ok(match &config.actuator.output {
        OutputConfig::Sysfs { root } => Box::new(SysfsGpio::open(root.clone(), config.actuator.pin)?),
        OutputConfig::Log => Box::new(LogOutput::new()),
    })
}

fn run<T: Transport>(
    transport: T,
    config: &PipelineConfig,
    output: Box<dyn DigitalOutput + Send>,
    stop: &StopSignal,
) -> Result<(), PipelineError> {
    let shape = config.window.shape();
    info!(
        "biopedal : serving {} with {} windows, {:?} framing, pin {}",
        transport.describe(),
        shape,
        config.framing,
        config.actuator.pin
    );

    let engine = InferenceEngine::new(
        Box::new(EnvelopeClassifier::new(config.classifier.thresholds.clone())),
        shape,
    );
    let bridge = ActuatorBridge::new(output, config.actuator.pin, config.actuator.map.clone());

    Pipeline::new(
        Listener::new(transport, config.listener_options()),
        config.assembler(),
        engine,
        bridge,
    )
    .with_queue_depth(config.queue_depth)
    .run(stop)?;

    info!("biopedal : terminated.");
    Ok(())
}

fn list_ports() -> ExitCode {
    match SerialPort::available_ports() {
        Ok(ports) => {
            println!("Available devices:");
            for port in ports {
                println!("\t{}", port.to_string_lossy());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("cannot list serial devices: {}", e);
            ExitCode::FAILURE
        }
    }
}
