//! Weighted completion arithmetic.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepWeight {
    pub name: String,
    pub weight: f64,
}

impl StepWeight {
    pub fn new(name: impl Into<String>, weight: f64) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Phase weights and the ordered steps of each phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressWeights {
    pub transcription_weight: u32,
    pub graph_weight: u32,
    pub transcription_steps: Vec<StepWeight>,
    pub graph_steps: Vec<StepWeight>,
}

impl Default for ProgressWeights {
    fn default() -> Self {
        Self {
            transcription_weight: 20,
            graph_weight: 80,
            transcription_steps: vec![
                StepWeight::new("download", 10.0),
                StepWeight::new("transcribe", 70.0),
                StepWeight::new("align", 20.0),
            ],
            graph_steps: vec![
                StepWeight::new("entities", 25.0),
                StepWeight::new("properties", 25.0),
                StepWeight::new("scenes", 25.0),
                StepWeight::new("images", 25.0),
            ],
        }
    }
}

impl ProgressWeights {
    pub fn with_phase_weights(mut self, transcription: u32, graph: u32) -> Result<Self> {
        if transcription + graph == 0 {
            return Err(Error::config("phase weights must not both be zero"));
        }
        self.transcription_weight = transcription;
        self.graph_weight = graph;
        Ok(self)
    }

    /// Transcription phase percent: finished steps plus `sub_progress` of the current one.
    pub fn transcription_percent(&self, step: &str, sub_progress: f64) -> Result<f64> {
        phase_percent(&self.transcription_steps, step, sub_progress)
    }

    /// Graph phase percent.
    ///
    /// With `total_chapters > 0` each chapter is an equal share: `chapter`
    /// (0-based) chapters count as done and the current chapter adds its
    /// step-based part of one share.
    pub fn graph_percent(
        &self,
        step: &str,
        step_progress: f64,
        chapter: u32,
        total_chapters: u32,
    ) -> Result<f64> {
        let within = phase_percent(&self.graph_steps, step, step_progress)?;
        if total_chapters == 0 {
            return Ok(within);
        }

        let share = 100.0 / total_chapters as f64;
        let done = chapter.min(total_chapters) as f64;
        Ok((done * share + within / 100.0 * share).clamp(0.0, 100.0))
    }

    /// Blend both phases into the 0-100 completion.
    pub fn completion(&self, transcription_percent: f64, graph_percent: f64) -> u32 {
        let t = self.transcription_weight as f64 * clamp_percent(transcription_percent) / 100.0;
        let g = self.graph_weight as f64 * clamp_percent(graph_percent) / 100.0;
        (t + g).round().clamp(0.0, 100.0) as u32
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

fn phase_percent(steps: &[StepWeight], step: &str, sub_progress: f64) -> Result<f64> {
    let total: f64 = steps.iter().map(|s| s.weight).sum();
    if total <= 0.0 {
        return Ok(0.0);
    }

    let index = steps
        .iter()
        .position(|s| s.name == step)
        .ok_or_else(|| Error::validation(format!("unknown progress step '{}'", step)))?;

    let before: f64 = steps[..index].iter().map(|s| s.weight).sum();
    let current = steps[index].weight * clamp_percent(sub_progress) / 100.0;
    Ok(((before + current) * 100.0 / total).clamp(0.0, 100.0))
}
