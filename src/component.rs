//! Defines the Component trait, used by each stage of the pipeline when it
//! runs on its own thread. Each stage consumes data from the preceding
//! stage, processes it, and passes the result on to the next one.

use crate::actuator::ActuatorError;

use log::{info, warn};
use std::sync::mpsc::{Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use thiserror::Error;

/// Errors a Component can hit while cleaning up.
#[derive(Debug, Error)]
pub enum ComponentError {
    /// Releasing the output pin failed
    #[error("actuator: {0}")]
    Actuator(#[from] ActuatorError),
}

///
/// A stage of the pipeline: assembly, inference, or actuation. Anything that
/// runs on a pipeline thread implements Component.
///
pub trait Component: ToString {
    /// What the stage receives
    type InData;
    /// What the stage passes on
    type OutData;

    /// Converts an input into an output, or `None` if the input was dropped
    fn convert(&mut self, input: Self::InData) -> Option<Self::OutData>;

    /// Cleans up at termination of pipeline
    fn finalize(&mut self) -> Result<(), ComponentError>;
}

/// Runs the given Component on its own thread. Every input received is
/// converted and, unless dropped, sent on to `output`. The last stage of a
/// pipeline has no output.
///
/// The thread ends once every sender of `input` is gone, after finalizing
/// the component.
pub fn run_component<C>(
    mut component: C,
    input: Receiver<C::InData>,
    output: Option<SyncSender<C::OutData>>,
) -> JoinHandle<()>
where
    C: Component + Send + 'static,
    C::InData: Send + 'static,
    C::OutData: Send + 'static,
{
    thread::spawn(move || {
        while let Ok(data) = input.recv() {
            let Some(out_data) = component.convert(data) else {
                continue;
            };
            if let Some(output) = &output {
                if let Err(error) = output.send(out_data) {
                    warn!("{} : received error {}.", component.to_string(), error);
                    break;
                }
            }
        }

        if let Err(component_error) = component.finalize() {
            warn!(
                "{} : error during terminating : {component_error}.",
                component.to_string(),
            );
        }
        info!("{} : terminated.", component.to_string());
    })
}
