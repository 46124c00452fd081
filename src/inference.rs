//! The Inference Engine, an adapter around whatever classifier was loaded
//! at startup.
//!
//! The pipeline only needs a [Classifier]: something that turns a window
//! into a [ClassificationResult]. How the model is stored or evaluated is
//! the classifier's business.

use crate::window::{SampleWindow, WindowShape};

use log::debug;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use thiserror::Error;

/// The predicted class of one window, and the per-class scores it was
/// picked from.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationResult {
    label: usize,
    scores: Vec<f32>,
}

impl ClassificationResult {
    /// Picks the highest score as the label (the first one on ties). Fails
    /// on an empty score vector or a NaN score.
    pub fn from_scores(scores: Vec<f32>) -> Result<Self, ClassifierError> {
        if scores.iter().any(|s| s.is_nan()) {
            return Err(ClassifierError::InvalidResult("NaN score".to_owned()));
        }
        let label = scores
            .iter()
            .enumerate()
            .fold(None, |best: Option<(usize, f32)>, (i, &s)| match best {
                Some((_, b)) if b >= s => best,
                _ => Some((i, s)),
            })
            .map(|(i, _)| i)
            .ok_or_else(|| ClassifierError::InvalidResult("no scores".to_owned()))?;

        Ok(Self { label, scores })
    }

    /// Pairs an explicit label with its scores. The label must index into
    /// the scores.
    pub fn new(label: usize, scores: Vec<f32>) -> Result<Self, ClassifierError> {
        if label >= scores.len() {
            return Err(ClassifierError::InvalidResult(format!(
                "label {} out of range for {} classes",
                label,
                scores.len()
            )));
        }
        Ok(Self { label, scores })
    }

    /// Index of the predicted class.
    pub fn label(&self) -> usize {
        self.label
    }

    /// One score per class.
    pub fn scores(&self) -> &[f32] {
        &self.scores
    }

    /// Score of the chosen label.
    pub fn confidence(&self) -> f32 {
        self.scores[self.label]
    }
}

/// Why a window did not get a label.
#[derive(Debug, Error)]
pub enum ClassifierError {
    /// The window does not have the model's input shape
    #[error("window shape {got} does not match the model input {expected}")]
    ShapeRejected {
        /// Shape the model takes
        expected: WindowShape,
        /// Shape of the window
        got: WindowShape,
    },
    /// The classifier reported an error
    #[error("classifier failed: {0}")]
    Failed(String),
    /// The classifier panicked; holds the panic message
    #[error("classifier panicked: {0}")]
    Panicked(String),
    /// The result has no scores, a NaN score or an out of range label
    #[error("classifier returned an invalid result: {0}")]
    InvalidResult(String),
}

/// A loaded model. Classifiers are expected to be deterministic and free of
/// side effects.
pub trait Classifier {
    /// Labels one window.
    fn classify(&self, window: &SampleWindow) -> Result<ClassificationResult, ClassifierError>;
}

impl<F> Classifier for F
where
    F: Fn(&SampleWindow) -> Result<ClassificationResult, ClassifierError>,
{
    fn classify(&self, window: &SampleWindow) -> Result<ClassificationResult, ClassifierError> {
        self(window)
    }
}

/// Runs a [Classifier] on windows of one fixed shape.
pub struct InferenceEngine {
    classifier: Box<dyn Classifier + Send>,
    shape: WindowShape,
}

impl InferenceEngine {
    /// An engine feeding windows of `shape` to `classifier`.
    pub fn new(classifier: Box<dyn Classifier + Send>, shape: WindowShape) -> Self {
        Self { classifier, shape }
    }

    /// The model's input shape.
    pub fn shape(&self) -> WindowShape {
        self.shape
    }

    /// Classifies one window. The classifier is never called with a window
    /// of the wrong shape, and a panic inside it is caught and reported as
    /// [ClassifierError::Panicked].
    pub fn classify(&self, window: &SampleWindow) -> Result<ClassificationResult, ClassifierError> {
        if window.shape() != self.shape {
            return Err(ClassifierError::ShapeRejected {
                expected: self.shape,
                got: window.shape(),
            });
        }

        let result = catch_unwind(AssertUnwindSafe(|| self.classifier.classify(window)))
            .map_err(|payload| ClassifierError::Panicked(panic_message(payload.as_ref())))??;

        // Re-check, classifiers can build results by hand.
        let result = ClassificationResult::new(result.label, result.scores)?;
        debug!(
            "classified window as {} (confidence {:.3})",
            result.label(),
            result.confidence()
        );
        Ok(result)
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Classifies by the EMG activation envelope: the mean absolute value of
/// every sample in the window. The label is the number of thresholds the
/// envelope exceeds, so `[t]` gives rest/active and `[t1, t2]` gives three
/// intensity levels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeClassifier {
    thresholds: Vec<f32>,
}

impl EnvelopeClassifier {
    /// Thresholds are sorted ascending; NaNs are discarded.
    pub fn new(mut thresholds: Vec<f32>) -> Self {
        thresholds.retain(|t| !t.is_nan());
        thresholds.sort_by(f32::total_cmp);
        Self { thresholds }
    }

    /// Number of labels this classifier can produce.
    pub fn classes(&self) -> usize {
        self.thresholds.len() + 1
    }

    /// Mean absolute value of the window.
    pub fn envelope(window: &SampleWindow) -> f32 {
        let samples = window.samples();
        if samples.is_empty() {
            return 0.0;
        }
        samples.iter().map(|s| s.abs()).sum::<f32>() / samples.len() as f32
    }
}

impl Classifier for EnvelopeClassifier {
    fn classify(&self, window: &SampleWindow) -> Result<ClassificationResult, ClassifierError> {
        let envelope = Self::envelope(window);
        if !envelope.is_finite() {
            return Err(ClassifierError::Failed(format!(
                "non-finite envelope {}",
                envelope
            )));
        }
        let label = self.thresholds.iter().filter(|&&t| envelope > t).count();
        let mut scores = vec![0.0; self.classes()];
        scores[label] = 1.0;
        ClassificationResult::new(label, scores)
    }
}
