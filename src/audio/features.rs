use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};
use crate::pipeline::chunking::ChunkDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Feature {
    Spectral,
    Tempo,
    Key,
    Mfcc,
    Melody,
    Harmonic,
}

impl Feature {
    pub const ALL: [Feature; 6] = [
        Feature::Spectral,
        Feature::Tempo,
        Feature::Key,
        Feature::Mfcc,
        Feature::Melody,
        Feature::Harmonic,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Spectral => "spectral",
            Feature::Tempo => "tempo",
            Feature::Key => "key",
            Feature::Mfcc => "mfcc",
            Feature::Melody => "melody",
            Feature::Harmonic => "harmonic",
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Feature {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Feature::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown feature '{}'. Valid features: {}",
                    s,
                    Feature::ALL.map(Feature::as_str).join(", ")
                )
            })
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Feature>", into = "Vec<Feature>")]
pub struct FeatureSet(u8);

impl FeatureSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn all() -> Self {
        Feature::ALL.into_iter().collect()
    }

    pub fn with(mut self, feature: Feature) -> Self {
        self.insert(feature);
        self
    }

    pub fn insert(&mut self, feature: Feature) {
        self.0 |= feature.bit();
    }

    pub fn contains(&self, feature: Feature) -> bool {
        self.0 & feature.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_subset_of(&self, other: FeatureSet) -> bool {
        self.0 & !other.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        Feature::ALL.into_iter().filter(|f| self.contains(*f))
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        let mut set = FeatureSet::empty();
        for f in iter {
            set.insert(f);
        }
        set
    }
}

impl From<Vec<Feature>> for FeatureSet {
    fn from(features: Vec<Feature>) -> Self {
        features.into_iter().collect()
    }
}

impl From<FeatureSet> for Vec<Feature> {
    fn from(set: FeatureSet) -> Self {
        set.iter().collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisParams {
    pub frame_size: usize,
    pub hop_size: usize,
    pub mfcc_coefficients: usize,
    pub features: FeatureSet,
}

impl Default for AnalysisParams {
    fn default() -> Self {
        Self {
            frame_size: 2048,
            hop_size: 1024,
            mfcc_coefficients: 13,
            features: FeatureSet::all(),
        }
    }
}

impl AnalysisParams {
    pub fn validate(&self) -> Result<()> {
        if self.frame_size < 64 || self.frame_size > 65_536 {
            return Err(EngineError::Validation(format!(
                "frame size {} outside 64..=65536",
                self.frame_size
            )));
        }
        if self.hop_size == 0 || self.hop_size > self.frame_size {
            return Err(EngineError::Validation(format!(
                "hop size {} must be in 1..={}",
                self.hop_size, self.frame_size
            )));
        }
        if self.features.is_empty() {
            return Err(EngineError::Validation("no features requested".into()));
        }
        if self.features.contains(Feature::Mfcc)
            && !(1..=40).contains(&self.mfcc_coefficients)
        {
            return Err(EngineError::Validation(format!(
                "mfcc coefficient count {} outside 1..=40",
                self.mfcc_coefficients
            )));
        }
        Ok(())
    }
}

/// A caller's analysis request. Moved into the unit on dispatch.
#[derive(Clone, Debug)]
pub struct AnalysisRequest {
    pub request_id: String,
    /// Channel 0 samples, normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub duration_seconds: f32,
    pub params: AnalysisParams,
}

impl AnalysisRequest {
    pub fn new(samples: Vec<f32>, sample_rate: u32, params: AnalysisParams) -> Self {
        let duration_seconds = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f32 / sample_rate as f32
        };
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            samples,
            sample_rate,
            channels: 1,
            duration_seconds,
            params,
        }
    }

    pub fn with_channels(mut self, channels: u16) -> Self {
        self.channels = channels;
        self
    }

    /// Rejects malformed requests before anything is sent to a unit.
    pub fn validate(&self) -> Result<()> {
        if self.request_id.is_empty() {
            return Err(EngineError::Validation("missing request id".into()));
        }
        if self.samples.is_empty() {
            return Err(EngineError::Validation("empty audio samples".into()));
        }
        if self.sample_rate == 0 {
            return Err(EngineError::Validation("invalid sample rate".into()));
        }
        if !self.duration_seconds.is_finite() || self.duration_seconds <= 0.0 {
            return Err(EngineError::Validation(format!(
                "invalid duration {}",
                self.duration_seconds
            )));
        }
        if let Some(pos) = self.samples.iter().position(|s| !s.is_finite()) {
            return Err(EngineError::Validation(format!(
                "non-finite sample at index {pos}"
            )));
        }
        self.params.validate()
    }
}

/// Summary of one scalar feature over the frames of a segment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeatureStat {
    pub mean: f32,
    pub min: f32,
    pub max: f32,
}

impl FeatureStat {
    pub fn from_values(values: &[f32]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let sum: f64 = values.iter().map(|&v| v as f64).sum();
        Some(Self {
            mean: (sum / values.len() as f64) as f32,
            min: values.iter().copied().fold(f32::INFINITY, f32::min),
            max: values.iter().copied().fold(f32::NEG_INFINITY, f32::max),
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpectralStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub centroid: Option<FeatureStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolloff: Option<FeatureStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flux: Option<FeatureStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<FeatureStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brightness: Option<FeatureStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roughness: Option<FeatureStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spread: Option<FeatureStat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zcr: Option<FeatureStat>,
}

impl SpectralStats {
    pub fn is_empty(&self) -> bool {
        self.fields().iter().all(|f| f.is_none())
    }

    pub(crate) fn fields(&self) -> [Option<FeatureStat>; 8] {
        [
            self.centroid,
            self.rolloff,
            self.flux,
            self.energy,
            self.brightness,
            self.roughness,
            self.spread,
            self.zcr,
        ]
    }

    pub(crate) fn from_fields(fields: [Option<FeatureStat>; 8]) -> Self {
        let [centroid, rolloff, flux, energy, brightness, roughness, spread, zcr] = fields;
        Self {
            centroid,
            rolloff,
            flux,
            energy,
            brightness,
            roughness,
            spread,
            zcr,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TempoEstimate {
    pub bpm: f32,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyEstimate {
    /// Key label, e.g. "C major" or "A minor"
    pub key: String,
    /// Per-chunk: estimator confidence. Aggregated: accumulated confidence mass.
    pub confidence: f32,
    /// Number of chunks that voted for this key
    #[serde(default = "one")]
    pub support: usize,
}

fn one() -> usize {
    1
}

impl KeyEstimate {
    pub fn new(key: impl Into<String>, confidence: f32) -> Self {
        Self {
            key: key.into(),
            confidence,
            support: 1,
        }
    }

    pub fn is_minor(&self) -> bool {
        self.key.ends_with("minor") || self.key.ends_with('m')
    }
}

/// One pitch reading; `frequency == 0.0` marks an unvoiced frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PitchPoint {
    /// Seconds from the start of the whole signal
    pub time: f64,
    pub frequency: f32,
    pub confidence: f32,
}

impl PitchPoint {
    pub fn is_voiced(&self) -> bool {
        self.frequency > 0.0
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MelodyContour {
    pub points: Vec<PitchPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_frequency: Option<f32>,
    pub voiced_ratio: f32,
}

impl MelodyContour {
    pub fn from_points(points: Vec<PitchPoint>) -> Self {
        let voiced: Vec<f32> = points
            .iter()
            .filter(|p| p.is_voiced())
            .map(|p| p.frequency)
            .collect();
        let mean_frequency = if voiced.is_empty() {
            None
        } else {
            Some(voiced.iter().map(|&f| f as f64).sum::<f64>() as f32 / voiced.len() as f32)
        };
        let voiced_ratio = if points.is_empty() {
            0.0
        } else {
            voiced.len() as f32 / points.len() as f32
        };
        Self {
            points,
            mean_frequency,
            voiced_ratio,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChordEvent {
    pub time: f64,
    /// Chord label, e.g. "C" or "Am"
    pub label: String,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarmonicProgression {
    pub events: Vec<ChordEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant_chord: Option<String>,
}

impl HarmonicProgression {
    /// Builds a progression from time-ordered events. The dominant chord is
    /// the label with the largest confidence mass (ties to the smaller
    /// label); runs of one chord collapse into the run's first event.
    pub fn from_events(events: Vec<ChordEvent>) -> Self {
        let mut mass: BTreeMap<&str, f32> = BTreeMap::new();
        for e in &events {
            *mass.entry(e.label.as_str()).or_insert(0.0) += e.confidence;
        }
        let mut dominant: Option<(&str, f32)> = None;
        for (label, m) in mass {
            match dominant {
                Some((_, best)) if m <= best => {}
                _ => dominant = Some((label, m)),
            }
        }
        let dominant_chord = dominant.map(|(label, _)| label.to_string());

        Self {
            events: collapse_repeats(events),
            dominant_chord,
        }
    }
}

fn collapse_repeats(events: Vec<ChordEvent>) -> Vec<ChordEvent> {
    let mut collapsed: Vec<ChordEvent> = Vec::with_capacity(events.len());
    for event in events {
        match collapsed.last_mut() {
            Some(last) if last.label == event.label => {
                last.confidence = last.confidence.max(event.confidence);
            }
            _ => collapsed.push(event),
        }
    }
    collapsed
}

/// Output of one chunk (or one whole-file pass). Sparse: only requested
/// features that succeeded are populated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialResult {
    pub chunk: ChunkDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectral: Option<SpectralStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<TempoEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfcc: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub melody: Option<MelodyContour>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harmonic: Option<HarmonicProgression>,
}

impl PartialResult {
    pub fn empty(chunk: ChunkDescriptor) -> Self {
        Self {
            chunk,
            spectral: None,
            tempo: None,
            key: None,
            mfcc: None,
            melody: None,
            harmonic: None,
        }
    }

    pub fn features(&self) -> FeatureSet {
        let mut set = FeatureSet::empty();
        if self.spectral.is_some() {
            set.insert(Feature::Spectral);
        }
        if self.tempo.is_some() {
            set.insert(Feature::Tempo);
        }
        if self.key.is_some() {
            set.insert(Feature::Key);
        }
        if self.mfcc.is_some() {
            set.insert(Feature::Mfcc);
        }
        if self.melody.is_some() {
            set.insert(Feature::Melody);
        }
        if self.harmonic.is_some() {
            set.insert(Feature::Harmonic);
        }
        set
    }

    pub fn retain(&mut self, requested: FeatureSet) {
        if !requested.contains(Feature::Spectral) {
            self.spectral = None;
        }
        if !requested.contains(Feature::Tempo) {
            self.tempo = None;
        }
        if !requested.contains(Feature::Key) {
            self.key = None;
        }
        if !requested.contains(Feature::Mfcc) {
            self.mfcc = None;
        }
        if !requested.contains(Feature::Melody) {
            self.melody = None;
        }
        if !requested.contains(Feature::Harmonic) {
            self.harmonic = None;
        }
    }
}

/// Final merged analysis. Absent families mean "unknown", never zero.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spectral: Option<SpectralStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempo: Option<TempoEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<KeyEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mfcc: Option<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub melody: Option<MelodyContour>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub harmonic: Option<HarmonicProgression>,
}

impl AggregatedResult {
    pub fn is_empty(&self) -> bool {
        self.spectral.is_none()
            && self.tempo.is_none()
            && self.key.is_none()
            && self.mfcc.is_none()
            && self.melody.is_none()
            && self.harmonic.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisReport {
    #[serde(flatten)]
    pub result: AggregatedResult,
    pub duration: f32,
    pub sample_rate: u32,
    pub channels: u16,
    pub analysis_timestamp: DateTime<Utc>,
}

impl AnalysisReport {
    pub fn new(result: AggregatedResult, duration: f32, sample_rate: u32, channels: u16) -> Self {
        Self {
            result,
            duration,
            sample_rate,
            channels,
            analysis_timestamp: Utc::now(),
        }
    }
}
