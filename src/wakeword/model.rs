//! # Detection Models
//!
//! The scoring seam of the pipeline. Each model consumes one 16kHz frame
//! and emits a confidence in `[0.0, 1.0]`. Several models can run side by
//! side (one per wake phrase); the detector picks the best score over the
//! threshold per frame.
//!
//! The bundled [`EnergyModel`] is a stand-in that scores frames by RMS
//! energy. It keeps the pipeline fully exercisable without neural model
//! weights, and is the `"default"` entry in the model table.

use std::collections::HashMap;
use tracing::{error, warn};

/// One wake word scorer. `score` is called once per frame, in order, so
/// implementations may keep internal streaming state (hence `&mut`).
pub trait WakeWordModel: Send {
    fn name(&self) -> &str;

    fn score(&mut self, frame: &[i16]) -> Result<f32, String>;
}

/// RMS-energy scorer: loud sustained audio approaches 1.0, silence is 0.0.
pub struct EnergyModel {
    name: String,
}

impl EnergyModel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl WakeWordModel for EnergyModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&mut self, frame: &[i16]) -> Result<f32, String> {
        if frame.is_empty() {
            return Ok(0.0);
        }
        let sum_sq: f64 = frame.iter().map(|&s| (s as f64) * (s as f64)).sum();
        let rms = (sum_sq / frame.len() as f64).sqrt();
        Ok((rms / i16::MAX as f64).min(1.0) as f32)
    }
}

fn builtin(name: &str) -> Option<Box<dyn WakeWordModel>> {
    match name {
        "default" => Some(Box::new(EnergyModel::new("default"))),
        _ => None,
    }
}

/// A detection fired by [`ModelSet::best_over_threshold`].
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub wake_word: String,
    pub confidence: f32,
}

/// The loaded models plus each one's most recent score.
pub struct ModelSet {
    models: Vec<Box<dyn WakeWordModel>>,
    scores: HashMap<String, f32>,
}

impl ModelSet {
    /// Load the named models. Unknown names are skipped with a warning; if
    /// nothing loads, the default model is substituted so detection never
    /// silently disappears.
    pub fn load(names: &[String]) -> Self {
        let mut models = Vec::new();
        for name in names {
            match builtin(name) {
                Some(model) => models.push(model),
                None => warn!("Unknown wake word model '{}', skipping", name),
            }
        }

        if models.is_empty() {
            warn!("No wake word models loaded, falling back to default");
            models.push(builtin("default").unwrap());
        }

        let scores = models.iter().map(|m| (m.name().to_string(), 0.0)).collect();
        Self { models, scores }
    }

    /// Score one frame with every model. A model failure is logged and its
    /// previous score kept; one broken model never stalls the others.
    pub fn predict(&mut self, frame: &[i16]) -> &HashMap<String, f32> {
        for model in &mut self.models {
            match model.score(frame) {
                Ok(score) => {
                    self.scores.insert(model.name().to_string(), score);
                }
                Err(err) => {
                    error!("Wake word model '{}' failed: {}", model.name(), err);
                }
            }
        }
        &self.scores
    }

    /// Best current score at or above the threshold, if any.
    pub fn best_over_threshold(&self, threshold: f32) -> Option<Detection> {
        self.scores
            .iter()
            .filter(|(_, &score)| score >= threshold)
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(name, &score)| Detection {
                wake_word: name.clone(),
                confidence: score,
            })
    }

    pub fn scores(&self) -> &HashMap<String, f32> {
        &self.scores
    }
}
