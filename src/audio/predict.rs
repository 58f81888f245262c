use serde::{Deserialize, Serialize};

use crate::audio::features::AggregatedResult;
use crate::error::{EngineError, Result};

const SLOW_BPM: f32 = 90.0;
const FAST_BPM: f32 = 130.0;
const LOW_ENERGY: f32 = 0.005;
const HIGH_ENERGY: f32 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TempoClass {
    Slow,
    Moderate,
    Fast,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mood {
    Happy,
    Calm,
    Tense,
    Melancholic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_level: Option<Level>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo_class: Option<TempoClass>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mood: Option<Mood>,
    /// 0..1, from tempo proximity to 120 BPM and loudness
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub danceability: Option<f32>,
    /// Mean confidence of the inputs that were present
    pub confidence: f32,
}

/// Heuristic labels over whatever families the analysis produced. Fails only
/// when there is nothing to work from.
pub fn predict(analysis: &AggregatedResult) -> Result<Prediction> {
    let energy = analysis
        .spectral
        .as_ref()
        .and_then(|s| s.energy)
        .map(|e| e.mean);
    let tempo = analysis.tempo;
    let key = analysis.key.as_ref();

    if energy.is_none() && tempo.is_none() && key.is_none() {
        return Err(EngineError::Validation(
            "prediction needs spectral energy, tempo or key".into(),
        ));
    }

    let energy_level = energy.map(|e| {
        if e < LOW_ENERGY {
            Level::Low
        } else if e < HIGH_ENERGY {
            Level::Medium
        } else {
            Level::High
        }
    });

    let tempo_class = tempo.map(|t| {
        if t.bpm < SLOW_BPM {
            TempoClass::Slow
        } else if t.bpm < FAST_BPM {
            TempoClass::Moderate
        } else {
            TempoClass::Fast
        }
    });

    let lively = matches!(energy_level, Some(Level::High)) || matches!(tempo_class, Some(TempoClass::Fast));
    let mood = key.map(|k| match (k.is_minor(), lively) {
        (false, true) => Mood::Happy,
        (false, false) => Mood::Calm,
        (true, true) => Mood::Tense,
        (true, false) => Mood::Melancholic,
    });

    let danceability = tempo.map(|t| {
        let pulse = (1.0 - (t.bpm - 120.0).abs() / 80.0).clamp(0.0, 1.0) * t.confidence;
        let drive = energy.map_or(0.5, |e| (e / HIGH_ENERGY).clamp(0.0, 1.0));
        0.6 * pulse + 0.4 * drive
    });

    let mut confidences = Vec::new();
    if let Some(t) = tempo {
        confidences.push(t.confidence);
    }
    if let Some(k) = key {
        // aggregated key confidence is a vote mass; normalize by voters
        confidences.push((k.confidence / k.support.max(1) as f32).min(1.0));
    }
    if energy.is_some() {
        confidences.push(1.0);
    }
    let confidence = confidences.iter().sum::<f32>() / confidences.len() as f32;

    Ok(Prediction {
        energy_level,
        tempo_class,
        mood,
        danceability,
        confidence,
    })
}
