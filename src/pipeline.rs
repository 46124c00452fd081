//! The acquisition-inference loop: Transport Listener -> Frame Assembler ->
//! Inference Engine -> Actuator Bridge.
//!
//! With a queue depth of 0 the stages run one after the other on the
//! calling thread, one window in flight. With a depth of 1 or 2 each stage
//! after the listener runs as a [Component] on its own thread, joined by
//! bounded queues; a full queue blocks the listener.
//!
//! Only a bind failure ends the loop with an error. Anything that goes
//! wrong with a single frame is logged with a `reason=` code and the loop
//! moves on.

use crate::actuator::{ActuatorBridge, DigitalOutput, Level};
use crate::assembler::{AssemblyError, FrameAssembler};
use crate::component::{run_component, Component, ComponentError};
use crate::inference::{ClassificationResult, InferenceEngine};
use crate::stop::StopSignal;
use crate::transport::{Listener, RawFrame, Transport, TransportError, POLL_INTERVAL};
use crate::window::SampleWindow;

use log::{debug, info, warn};
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::sync_channel,
        Arc,
    },
    thread,
};
use thiserror::Error;

/// Deepest queue allowed between pipelined stages.
pub const MAX_QUEUE_DEPTH: usize = 2;

/// Why a frame never made it to the output pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The payload was not valid zlib
    Decompress,
    /// The payload did not hold exactly one window
    Shape,
    /// The frame was over the size limit
    Oversize,
    /// The session ended part way through the frame
    Truncated,
    /// The classifier failed or panicked
    Classifier,
    /// The pin could not be driven
    Actuator,
}

impl DropReason {
    /// The `reason=` code used in log lines.
    pub fn code(&self) -> &'static str {
        match self {
            DropReason::Decompress => "decompress",
            DropReason::Shape => "shape",
            DropReason::Oversize => "oversize",
            DropReason::Truncated => "truncated",
            DropReason::Classifier => "classifier",
            DropReason::Actuator => "actuator",
        }
    }
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Counters shared by every stage of one pipeline.
#[derive(Debug, Default)]
pub struct PipelineStats {
    sessions: AtomicU64,
    frames: AtomicU64,
    windows: AtomicU64,
    classified: AtomicU64,
    actuated: AtomicU64,
    dropped: [AtomicU64; 6],
}

impl PipelineStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn slot(reason: DropReason) -> usize {
        match reason {
            DropReason::Decompress => 0,
            DropReason::Shape => 1,
            DropReason::Oversize => 2,
            DropReason::Truncated => 3,
            DropReason::Classifier => 4,
            DropReason::Actuator => 5,
        }
    }

    /// Counts a dropped frame and writes its log line.
    fn drop_frame(&self, stage: &str, seq: Option<u64>, reason: DropReason, error: &dyn fmt::Display) {
        Self::bump(&self.dropped[Self::slot(reason)]);
        match seq {
            Some(seq) => warn!("{} : dropped frame seq={} reason={} : {}", stage, seq, reason, error),
            None => warn!("{} : dropped frame reason={} : {}", stage, reason, error),
        }
    }

    /// Frames dropped for `reason` so far.
    pub fn dropped(&self, reason: DropReason) -> u64 {
        self.dropped[Self::slot(reason)].load(Ordering::Relaxed)
    }

    /// Reads every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        StatsSnapshot {
            sessions: load(&self.sessions),
            frames: load(&self.frames),
            windows: load(&self.windows),
            classified: load(&self.classified),
            actuated: load(&self.actuated),
            dropped: self.dropped.iter().map(load).sum(),
        }
    }
}

/// A point-in-time copy of [PipelineStats].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Peers accepted
    pub sessions: u64,
    /// Complete frames read off the wire
    pub frames: u64,
    /// Frames assembled into windows
    pub windows: u64,
    /// Windows the classifier labelled
    pub classified: u64,
    /// Labels written to the pin
    pub actuated: u64,
    /// Frames dropped for any reason
    pub dropped: u64,
}

impl StatsSnapshot {
    /// Frames that have gone all the way through, one way or another.
    pub fn settled(&self) -> u64 {
        self.actuated + self.dropped
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sessions={} frames={} windows={} classified={} actuated={} dropped={}",
            self.sessions, self.frames, self.windows, self.classified, self.actuated, self.dropped
        )
    }
}

/// Failures that end [Pipeline::run].
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The endpoint could not be bound
    #[error(transparent)]
    Bind(TransportError),
    /// A stage thread panicked; holds the stage name
    #[error("{0} stage panicked")]
    StagePanicked(String),
}

/// Decompresses and reshapes frames.
pub struct AssembleStage {
    assembler: FrameAssembler,
    stats: Arc<PipelineStats>,
}

impl Component for AssembleStage {
    type InData = RawFrame;
    type OutData = (u64, SampleWindow);

    fn convert(&mut self, frame: RawFrame) -> Option<(u64, SampleWindow)> {
        match self.assembler.assemble(&frame) {
            Ok(window) => {
                PipelineStats::bump(&self.stats.windows);
                Some((frame.seq, window))
            }
            Err(e) => {
                let reason = match e {
                    AssemblyError::Decompression(_) => DropReason::Decompress,
                    AssemblyError::ShapeMismatch { .. } => DropReason::Shape,
                };
                self.stats
                    .drop_frame(&self.to_string(), Some(frame.seq), reason, &e);
                None
            }
        }
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl fmt::Display for AssembleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assembler")
    }
}

/// Runs the classifier.
pub struct ClassifyStage {
    engine: InferenceEngine,
    stats: Arc<PipelineStats>,
}

impl Component for ClassifyStage {
    type InData = (u64, SampleWindow);
    type OutData = (u64, ClassificationResult);

    fn convert(&mut self, (seq, window): (u64, SampleWindow)) -> Option<(u64, ClassificationResult)> {
        match self.engine.classify(&window) {
            Ok(result) => {
                PipelineStats::bump(&self.stats.classified);
                Some((seq, result))
            }
            Err(e) => {
                self.stats
                    .drop_frame(&self.to_string(), Some(seq), DropReason::Classifier, &e);
                None
            }
        }
    }

    fn finalize(&mut self) -> Result<(), ComponentError> {
        Ok(())
    }
}

impl fmt::Display for ClassifyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inference")
    }
}

/// Drives the output pin.
pub struct ActuateStage<O> {
    bridge: ActuatorBridge<O>,
    stats: Arc<PipelineStats>,
}

impl<O: DigitalOutput> Component for ActuateStage<O> {
    type InData = (u64, ClassificationResult);
    type OutData = Level;

    fn convert(&mut self, (seq, result): (u64, ClassificationResult)) -> Option<Level> {
        match self.bridge.apply_result(&result) {
            Ok(level) => {
                PipelineStats::bump(&self.stats.actuated);
                Some(level)
            }
            Err(e) => {
                self.stats
                    .drop_frame(&self.to_string(), Some(seq), DropReason::Actuator, &e);
                None
            }
        }
    }

    /// Leaves the pedal switched off.
    fn finalize(&mut self) -> Result<(), ComponentError> {
        Ok(self.bridge.release()?)
    }
}

impl<O> fmt::Display for ActuateStage<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "actuator")
    }
}

/// One receiver: a listener and the three processing stages.
pub struct Pipeline<T: Transport, O> {
    listener: Listener<T>,
    assemble: AssembleStage,
    classify: ClassifyStage,
    actuate: ActuateStage<O>,
    queue_depth: usize,
    stats: Arc<PipelineStats>,
}

impl<T, O> Pipeline<T, O>
where
    T: Transport,
    O: DigitalOutput + Send + 'static,
{
    /// Puts the stages together, sequential until
    /// [Pipeline::with_queue_depth] says otherwise.
    pub fn new(
        listener: Listener<T>,
        assembler: FrameAssembler,
        engine: InferenceEngine,
        bridge: ActuatorBridge<O>,
    ) -> Self {
        let stats = Arc::new(PipelineStats::default());
        Self {
            listener,
            assemble: AssembleStage {
                assembler,
                stats: stats.clone(),
            },
            classify: ClassifyStage {
                engine,
                stats: stats.clone(),
            },
            actuate: ActuateStage {
                bridge,
                stats: stats.clone(),
            },
            queue_depth: 0,
            stats,
        }
    }

    /// 0 runs every stage on the calling thread; 1 or 2 runs the stages on
    /// their own threads with queues that deep. Larger values are clamped.
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.min(MAX_QUEUE_DEPTH);
        self
    }

    /// Live counters, readable while the pipeline runs.
    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Runs until `stop` fires. Fails only if the endpoint cannot be bound.
    pub fn run(self, stop: &StopSignal) -> Result<StatsSnapshot, PipelineError> {
        let stats = self.stats.clone();
        if self.queue_depth == 0 {
            self.run_sequential(stop)?;
        } else {
            self.run_pipelined(stop)?;
        }
        let snapshot = stats.snapshot();
        info!("pipeline : {}", snapshot);
        Ok(snapshot)
    }

    fn run_sequential(self, stop: &StopSignal) -> Result<(), PipelineError> {
        let Pipeline {
            mut listener,
            mut assemble,
            mut classify,
            mut actuate,
            stats,
            ..
        } = self;

        info!("pipeline : sequential");
        let served = serve(&mut listener, stop, &stats, |frame| {
            let _level = assemble
                .convert(frame)
                .and_then(|window| classify.convert(window))
                .and_then(|result| actuate.convert(result));
            true
        });

        if let Err(e) = actuate.finalize() {
            warn!("{} : error during terminating : {}.", actuate, e);
        }
        served
    }

    fn run_pipelined(self, stop: &StopSignal) -> Result<(), PipelineError> {
        let Pipeline {
            mut listener,
            assemble,
            classify,
            actuate,
            queue_depth,
            stats,
        } = self;

        info!("pipeline : pipelined, queue depth {}", queue_depth);
        let (frame_tx, frame_rx) = sync_channel(queue_depth);
        let (window_tx, window_rx) = sync_channel(queue_depth);
        let (result_tx, result_rx) = sync_channel(queue_depth);

        let handles = [
            ("assembler", run_component(assemble, frame_rx, Some(window_tx))),
            ("inference", run_component(classify, window_rx, Some(result_tx))),
            ("actuator", run_component(actuate, result_rx, None)),
        ];

        let served = serve(&mut listener, stop, &stats, |frame| {
            frame_tx.send(frame).is_ok()
        });

        // Closing the head queue lets each stage drain and finalize in turn.
        drop(frame_tx);
        let mut panicked = None;
        for (name, handle) in handles {
            if handle.join().is_err() {
                warn!("{} : thread panicked", name);
                panicked.get_or_insert(name);
            }
        }

        served?;
        match panicked {
            Some(name) => Err(PipelineError::StagePanicked(name.to_owned())),
            None => Ok(()),
        }
    }
}

/// The listener side of the loop: accept a peer, read its frames until it
/// goes away, accept the next one. `handle` gets every frame and returns
/// false once the rest of the pipeline is gone.
fn serve<T: Transport>(
    listener: &mut Listener<T>,
    stop: &StopSignal,
    stats: &PipelineStats,
    mut handle: impl FnMut(RawFrame) -> bool,
) -> Result<(), PipelineError> {
    listener.listen().map_err(PipelineError::Bind)?;

    'accept: while !stop.is_stopped() {
        let mut session = match listener.accept_one(stop) {
            Ok(session) => session,
            Err(TransportError::Stopped) => break,
            Err(e) if e.is_retryable() => {
                debug!("listener : still waiting for a peer ({})", e);
                continue;
            }
            Err(e) => {
                warn!("listener : accept failed: {}", e);
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };
        PipelineStats::bump(&stats.sessions);

        loop {
            match listener.read_frame(&mut session, stop) {
                Ok(frame) => {
                    PipelineStats::bump(&stats.frames);
                    debug!("{} : frame seq={} ({} bytes)", session.peer(), frame.seq, frame.len());
                    if !handle(frame) {
                        warn!("listener : pipeline stages are gone, stopping");
                        break 'accept;
                    }
                }
                Err(e @ TransportError::FrameTooLarge { .. }) => {
                    stats.drop_frame(session.peer(), None, DropReason::Oversize, &e);
                }
                Err(e @ TransportError::Truncated { .. }) => {
                    stats.drop_frame(session.peer(), None, DropReason::Truncated, &e);
                    break;
                }
                Err(TransportError::Timeout(timeout)) => {
                    debug!("{} : no frame within {:?}", session.peer(), timeout);
                }
                Err(TransportError::EndOfStream) | Err(TransportError::Stopped) => break,
                Err(e) => {
                    warn!("{} : session ended: {}", session.peer(), e);
                    break;
                }
            }
        }
        listener.disconnect(session);
    }

    listener.close();
    Ok(())
}
