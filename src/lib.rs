//! biopedal is the host side of a biosignal-controlled guitar pedal. A
//! headband samples EEG/EMG electrodes, packs the samples into fixed-shape
//! windows and streams them, zlib-compressed, over Bluetooth RFCOMM, a
//! serial line or TCP. The ground unit receives each window, checks its
//! shape, classifies it and switches the pedal's effect pin on the result.
//!
//! The receiver is a single loop of four stages:
//!
//! ```text
//! transport::Listener -> assembler::FrameAssembler
//!     -> inference::InferenceEngine -> actuator::ActuatorBridge
//! ```
//!
//! [pipeline::Pipeline] wires them together, either one after the other on
//! one thread or as [component::Component]s on threads of their own. The
//! [simulator] stands in for the headband.

#![warn(missing_docs)]

pub mod actuator;
pub mod args;
pub mod assembler;
pub mod component;
pub mod config;
pub mod framing;
pub mod inference;
pub mod pipeline;
pub mod simulator;
pub mod stop;
pub mod transport;
pub mod window;
