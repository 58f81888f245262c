use crate::audio::features::{
    AnalysisParams, ChordEvent, Feature, FeatureStat, HarmonicProgression, KeyEstimate,
    MelodyContour, PartialResult, PitchPoint, SpectralStats, TempoEstimate,
};
use crate::backend::{Backend, BackendError, Handle, WindowKind};
use crate::pipeline::chunking::ChunkDescriptor;

/// Frames of chroma pooled into one chord reading
const HARMONIC_BLOCK_FRAMES: usize = 8;

const PROGRESS_STEP: f32 = 0.05;

/// Per-family state while walking the frames of one segment. `None` means the
/// family was not requested or has already failed.
struct Accumulators {
    spectral: Option<[Vec<f32>; 8]>,
    envelope: Option<Vec<f32>>,
    chroma: Option<[f32; 12]>,
    mfcc: Option<(Vec<f32>, usize)>,
    pitches: Option<Vec<PitchPoint>>,
    chords: Option<ChordBlocks>,
}

#[derive(Default)]
struct ChordBlocks {
    events: Vec<ChordEvent>,
    block: [f32; 12],
    frames: usize,
    start: f64,
}

impl Accumulators {
    fn new(params: &AnalysisParams) -> Self {
        let on = |f: Feature| params.features.contains(f);
        Self {
            spectral: on(Feature::Spectral).then(Default::default),
            envelope: on(Feature::Tempo).then(Vec::new),
            chroma: on(Feature::Key).then_some([0.0; 12]),
            mfcc: on(Feature::Mfcc).then(|| (vec![0.0; params.mfcc_coefficients], 0)),
            pitches: on(Feature::Melody).then(Vec::new),
            chords: on(Feature::Harmonic).then(ChordBlocks::default),
        }
    }
}

/// Runs `f` against a live accumulator. A failure is logged and disables the
/// family for the rest of the segment.
fn update<T>(
    slot: &mut Option<T>,
    feature: Feature,
    chunk: usize,
    f: impl FnOnce(&mut T) -> Result<(), BackendError>,
) {
    if let Some(acc) = slot.as_mut() {
        if let Err(e) = f(acc) {
            log::warn!("Chunk {}: {} extraction failed: {}", chunk, feature, e);
            *slot = None;
        }
    }
}

/// Extracts every requested feature family from one segment.
pub fn analyze_segment(
    backend: &dyn Backend,
    samples: &[f32],
    sample_rate: u32,
    chunk: ChunkDescriptor,
    params: &AnalysisParams,
    progress: &mut dyn FnMut(&str, f32),
) -> Result<PartialResult, BackendError> {
    if samples.is_empty() || sample_rate == 0 {
        return Err(BackendError::InvalidInput("empty segment".into()));
    }

    let frame_size = params.frame_size;
    let hop = params.hop_size;
    let sr = sample_rate;

    // Segments shorter than one frame are zero padded to a single frame
    let padded;
    let samples = if samples.len() < frame_size {
        padded = {
            let mut v = samples.to_vec();
            v.resize(frame_size, 0.0);
            v
        };
        &padded[..]
    } else {
        samples
    };
    let total_frames = (samples.len() - frame_size) / hop + 1;

    log::debug!(
        "Chunk {}: {} frames of {} (hop {}) on {} backend",
        chunk.index,
        total_frames,
        frame_size,
        hop,
        backend.name()
    );

    let mut acc = Accumulators::new(params);
    let mut previous: Option<Handle<'_>> = None;
    let mut next_report = PROGRESS_STEP;
    let idx = chunk.index;

    // Pass 1: per-frame features
    progress("frames", 0.0);
    for n in 0..total_frames {
        let pos = n * hop;
        let time = chunk.start_time + pos as f64 / sr as f64;

        let frame = Handle::vector(backend, &samples[pos..pos + frame_size])?;
        let spectrum = frame.windowed(WindowKind::Hann)?.spectrum()?;

        let flux = previous
            .as_ref()
            .map(|prev| backend.spectral_flux(prev.id(), spectrum.id()));

        update(&mut acc.spectral, Feature::Spectral, idx, |fields| {
            let id = spectrum.id();
            fields[0].push(backend.spectral_centroid(id, sr)?);
            fields[1].push(backend.spectral_rolloff(id, sr)?);
            if let Some(flux) = &flux {
                fields[2].push(flux.clone()?);
            }
            fields[3].push(backend.energy(frame.id())?);
            fields[4].push(backend.brightness(id, sr)?);
            fields[5].push(backend.roughness(id, sr)?);
            fields[6].push(backend.spectral_spread(id, sr)?);
            fields[7].push(backend.zero_crossing_rate(frame.id())?);
            Ok(())
        });

        update(&mut acc.envelope, Feature::Tempo, idx, |env| {
            if let Some(flux) = &flux {
                env.push(flux.clone()?);
            }
            Ok(())
        });

        let chroma = (acc.chroma.is_some() || acc.chords.is_some())
            .then(|| backend.chroma(spectrum.id(), sr));

        update(&mut acc.chroma, Feature::Key, idx, |sum| {
            if let Some(chroma) = &chroma {
                let chroma = chroma.clone()?;
                sum.iter_mut().zip(chroma).for_each(|(s, c)| *s += c);
            }
            Ok(())
        });

        update(&mut acc.chords, Feature::Harmonic, idx, |blocks| {
            if let Some(chroma) = &chroma {
                let chroma = chroma.clone()?;
                if blocks.frames == 0 {
                    blocks.start = time;
                }
                blocks.block.iter_mut().zip(chroma).for_each(|(s, c)| *s += c);
                blocks.frames += 1;
                if blocks.frames == HARMONIC_BLOCK_FRAMES {
                    flush_chord_block(backend, blocks)?;
                }
            }
            Ok(())
        });

        update(&mut acc.mfcc, Feature::Mfcc, idx, |(sum, count)| {
            let coeffs = backend.mfcc(spectrum.id(), sr, params.mfcc_coefficients)?;
            sum.iter_mut().zip(coeffs).for_each(|(s, c)| *s += c);
            *count += 1;
            Ok(())
        });

        update(&mut acc.pitches, Feature::Melody, idx, |points| {
            let reading = backend.pitch(frame.id(), sr)?;
            points.push(PitchPoint {
                time,
                frequency: reading.frequency,
                confidence: reading.confidence,
            });
            Ok(())
        });

        previous = Some(spectrum);

        let done = (n + 1) as f32 / total_frames as f32;
        if done >= next_report {
            progress("frames", done);
            next_report = done + PROGRESS_STEP;
        }
    }
    drop(previous);

    // Pass 2: segment-level estimates
    progress("summary", 0.0);
    let mut result = PartialResult::empty(chunk);

    if let Some(fields) = acc.spectral {
        let stats = SpectralStats::from_fields(fields.map(|v| FeatureStat::from_values(&v)));
        result.spectral = (!stats.is_empty()).then_some(stats);
    }

    if let Some(env) = acc.envelope.take() {
        let frame_rate = sr as f32 / hop as f32;
        let mut slot = Some(env);
        update(&mut slot, Feature::Tempo, idx, |env| {
            let handle = Handle::vector(backend, env)?;
            let reading = backend.tempo(handle.id(), frame_rate)?;
            result.tempo = Some(TempoEstimate {
                bpm: reading.bpm,
                confidence: reading.confidence,
            });
            Ok(())
        });
    }

    let mut key_slot = acc.chroma;
    update(&mut key_slot, Feature::Key, idx, |sum| {
        let reading = backend.key(sum)?;
        result.key = Some(KeyEstimate::new(reading.label, reading.confidence));
        Ok(())
    });

    if let Some((sum, count)) = acc.mfcc {
        if count > 0 {
            result.mfcc = Some(sum.into_iter().map(|s| s / count as f32).collect());
        }
    }

    if let Some(points) = acc.pitches {
        result.melody = Some(MelodyContour::from_points(points));
    }

    let mut chord_slot = acc.chords;
    update(&mut chord_slot, Feature::Harmonic, idx, |blocks| {
        if blocks.frames > 0 {
            flush_chord_block(backend, blocks)?;
        }
        Ok(())
    });
    if let Some(blocks) = chord_slot {
        result.harmonic = Some(HarmonicProgression::from_events(blocks.events));
    }

    progress("summary", 1.0);
    Ok(result)
}

fn flush_chord_block(backend: &dyn Backend, blocks: &mut ChordBlocks) -> Result<(), BackendError> {
    let block = std::mem::take(&mut blocks.block);
    blocks.frames = 0;
    // silent blocks carry no chord
    if block.iter().all(|&c| c <= f32::EPSILON) {
        return Ok(());
    }
    let reading = backend.chord(&block)?;
    blocks.events.push(ChordEvent {
        time: blocks.start,
        label: reading.label,
        confidence: reading.confidence,
    });
    Ok(())
}
