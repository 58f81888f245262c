use std::collections::{BTreeMap, HashMap};

use crate::audio::features::{
    AggregatedResult, ChordEvent, FeatureStat, HarmonicProgression, KeyEstimate, MelodyContour,
    PartialResult, PitchPoint, SpectralStats, TempoEstimate,
};
use crate::pipeline::chunking::ChunkDescriptor;

/// Merges streaming (or per-pass) partial results. An empty input yields an
/// empty record.
pub fn merge_streaming_results(partials: &[PartialResult]) -> AggregatedResult {
    let mut ordered: Vec<&PartialResult> = partials.iter().collect();
    // Total order: duplicate chunks still land in one place whatever the input order
    ordered.sort_by_cached_key(|p| {
        (
            p.chunk.index,
            p.chunk.start_sample,
            p.chunk.end_sample,
            serde_json::to_string(p).unwrap_or_default(),
        )
    });

    AggregatedResult {
        spectral: merge_spectral(&ordered),
        tempo: merge_tempo(&ordered),
        key: merge_key(&ordered),
        mfcc: merge_mfcc(&ordered),
        melody: merge_melody(&ordered),
        harmonic: merge_harmonic(&ordered),
    }
}

fn merge_spectral(ordered: &[&PartialResult]) -> Option<SpectralStats> {
    let mut per_field: [Vec<FeatureStat>; 8] = Default::default();
    for stats in ordered.iter().filter_map(|p| p.spectral.as_ref()) {
        for (slot, field) in per_field.iter_mut().zip(stats.fields()) {
            if let Some(stat) = field {
                slot.push(stat);
            }
        }
    }

    let merged = SpectralStats::from_fields(per_field.map(|stats| merge_stat(&stats)));
    (!merged.is_empty()).then_some(merged)
}

fn merge_stat(stats: &[FeatureStat]) -> Option<FeatureStat> {
    if stats.is_empty() {
        return None;
    }
    let sum: f64 = stats.iter().map(|s| s.mean as f64).sum();
    Some(FeatureStat {
        mean: (sum / stats.len() as f64) as f32,
        min: stats.iter().map(|s| s.min).fold(f32::INFINITY, f32::min),
        max: stats.iter().map(|s| s.max).fold(f32::NEG_INFINITY, f32::max),
    })
}

/// The single most confident chunk read wins; ties go to the earliest chunk.
fn merge_tempo(ordered: &[&PartialResult]) -> Option<TempoEstimate> {
    let mut best: Option<TempoEstimate> = None;
    for tempo in ordered.iter().filter_map(|p| p.tempo) {
        match best {
            Some(current) if tempo.confidence <= current.confidence => {}
            _ => best = Some(tempo),
        }
    }
    best
}

/// Confidence-mass vote: `votes[key] += confidence`. Ties go to the
/// lexicographically smallest label.
fn merge_key(ordered: &[&PartialResult]) -> Option<KeyEstimate> {
    let mut votes: BTreeMap<&str, (f32, usize)> = BTreeMap::new();
    for key in ordered.iter().filter_map(|p| p.key.as_ref()) {
        let entry = votes.entry(key.key.as_str()).or_insert((0.0, 0));
        entry.0 += key.confidence;
        entry.1 += 1;
    }

    let mut winner: Option<(&str, f32, usize)> = None;
    for (label, (mass, support)) in votes {
        match winner {
            Some((_, best, _)) if mass <= best => {}
            _ => winner = Some((label, mass, support)),
        }
    }

    winner.map(|(label, mass, support)| KeyEstimate {
        key: label.to_string(),
        confidence: mass,
        support,
    })
}

/// Element-wise mean over vectors of the reference length. The reference is
/// the most common length; ties go to the length seen first in chunk order.
fn merge_mfcc(ordered: &[&PartialResult]) -> Option<Vec<f32>> {
    let vectors: Vec<&Vec<f32>> = ordered
        .iter()
        .filter_map(|p| p.mfcc.as_ref())
        .filter(|v| !v.is_empty())
        .collect();

    // length -> (count, first position)
    let mut lengths: HashMap<usize, (usize, usize)> = HashMap::new();
    for (pos, v) in vectors.iter().enumerate() {
        lengths.entry(v.len()).or_insert((0, pos)).0 += 1;
    }
    let reference = lengths
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(len, _)| len)?;

    let matching: Vec<&Vec<f32>> = vectors
        .into_iter()
        .filter(|v| v.len() == reference)
        .collect();
    if matching.len() < ordered.iter().filter(|p| p.mfcc.is_some()).count() {
        log::debug!(
            "MFCC merge: excluded {} vector(s) not of length {}",
            ordered.iter().filter(|p| p.mfcc.is_some()).count() - matching.len(),
            reference
        );
    }

    let mut sums = vec![0.0f64; reference];
    for v in &matching {
        for (acc, &c) in sums.iter_mut().zip(v.iter()) {
            *acc += c as f64;
        }
    }
    let n = matching.len() as f64;
    Some(sums.into_iter().map(|s| (s / n) as f32).collect())
}

/// True when an earlier chunk than `owner` (among those that reported) also
/// covers `time`; that chunk's reading is kept instead.
fn shadowed(time: f64, owner: &ChunkDescriptor, reporters: &[ChunkDescriptor]) -> bool {
    reporters
        .iter()
        .any(|c| c.index < owner.index && c.covers_time(time))
}

fn merge_melody(ordered: &[&PartialResult]) -> Option<MelodyContour> {
    let reporters: Vec<ChunkDescriptor> = ordered
        .iter()
        .filter(|p| p.melody.is_some())
        .map(|p| p.chunk)
        .collect();
    if reporters.is_empty() {
        return None;
    }

    let mut points: Vec<PitchPoint> = ordered
        .iter()
        .filter_map(|p| p.melody.as_ref().map(|m| (p.chunk, m)))
        .flat_map(|(chunk, m)| {
            let reporters = &reporters;
            m.points
                .iter()
                .filter(move |pt| !shadowed(pt.time, &chunk, reporters))
                .copied()
        })
        .collect();
    points.sort_by(|a, b| a.time.total_cmp(&b.time));

    Some(MelodyContour::from_points(points))
}

fn merge_harmonic(ordered: &[&PartialResult]) -> Option<HarmonicProgression> {
    let reporters: Vec<ChunkDescriptor> = ordered
        .iter()
        .filter(|p| p.harmonic.is_some())
        .map(|p| p.chunk)
        .collect();
    if reporters.is_empty() {
        return None;
    }

    let mut events: Vec<ChordEvent> = Vec::new();
    for p in ordered {
        if let Some(h) = &p.harmonic {
            events.extend(
                h.events
                    .iter()
                    .filter(|e| !shadowed(e.time, &p.chunk, &reporters))
                    .cloned(),
            );
        }
    }
    events.sort_by(|a, b| a.time.total_cmp(&b.time));

    Some(HarmonicProgression::from_events(events))
}
