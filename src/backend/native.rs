use rayon::prelude::*;
use rustfft::{num_complex::Complex, FftPlanner};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use super::tonal::TonalTemplates;
use super::{
    Backend, BackendError, BackendFactory, HandleId, PitchReading, TempoReading, TonalReading,
    WindowKind,
};

const ROLLOFF_FRACTION: f32 = 0.85;
const BRIGHTNESS_CUTOFF_HZ: f32 = 1500.0;
const MEL_FILTERS: usize = 40;
const MIN_PITCH_HZ: f32 = 60.0;
const MAX_PITCH_HZ: f32 = 1000.0;
const YIN_THRESHOLD: f32 = 0.15;
const VOICING_CONFIDENCE: f32 = 0.5;
const MIN_BPM: f32 = 60.0;
const MAX_BPM: f32 = 200.0;

enum Slot {
    Vector(Vec<f32>),
    Spectrum { magnitudes: Vec<f32>, fft_size: usize },
}

impl Slot {
    fn kind(&self) -> &'static str {
        match self {
            Slot::Vector(_) => "vector",
            Slot::Spectrum { .. } => "spectrum",
        }
    }
}

#[derive(Default)]
struct Arena {
    next_id: HandleId,
    slots: HashMap<HandleId, Slot>,
}

impl Arena {
    fn insert(&mut self, slot: Slot) -> HandleId {
        self.next_id = self.next_id.wrapping_add(1);
        while self.slots.contains_key(&self.next_id) || self.next_id == 0 {
            self.next_id = self.next_id.wrapping_add(1);
        }
        self.slots.insert(self.next_id, slot);
        self.next_id
    }
}

struct MelBank {
    /// (first bin, weights) per filter
    filters: Vec<(usize, Vec<f32>)>,
}

impl MelBank {
    fn new(bins: usize, fft_size: usize, sample_rate: u32) -> Self {
        let hz_to_mel = |hz: f32| 2595.0 * (1.0 + hz / 700.0).log10();
        let mel_to_hz = |mel: f32| 700.0 * (10f32.powf(mel / 2595.0) - 1.0);

        let max_mel = hz_to_mel(sample_rate as f32 / 2.0);
        let edges: Vec<f32> = (0..MEL_FILTERS + 2)
            .map(|i| mel_to_hz(max_mel * i as f32 / (MEL_FILTERS + 1) as f32))
            .map(|hz| hz * fft_size as f32 / sample_rate as f32)
            .collect();

        let filters = edges
            .windows(3)
            .map(|w| {
                let (lo, center, hi) = (w[0], w[1], w[2]);
                let first = lo.floor().max(0.0) as usize;
                let last = (hi.ceil() as usize).min(bins.saturating_sub(1));
                let weights = (first..=last)
                    .map(|bin| {
                        let b = bin as f32;
                        if b <= lo || b >= hi {
                            0.0
                        } else if b <= center {
                            (b - lo) / (center - lo).max(f32::EPSILON)
                        } else {
                            (hi - b) / (hi - center).max(f32::EPSILON)
                        }
                    })
                    .collect();
                (first, weights)
            })
            .collect();

        Self { filters }
    }
}

/// rustfft-backed implementation of [`Backend`]. Lives on one unit thread.
pub struct NativeBackend {
    planner: RefCell<FftPlanner<f32>>,
    windows: RefCell<HashMap<(WindowKind, usize), Rc<Vec<f32>>>>,
    mel_banks: RefCell<HashMap<(usize, u32), Rc<MelBank>>>,
    arena: RefCell<Arena>,
    templates: TonalTemplates,
    ready: Cell<bool>,
}

impl NativeBackend {
    /// First startup phase: plans the FFT and window for `frame_size`.
    pub fn load_assets(frame_size: usize) -> Result<Self, BackendError> {
        if frame_size < 2 {
            return Err(BackendError::Load(format!("unusable frame size {frame_size}")));
        }
        let backend = Self {
            planner: RefCell::new(FftPlanner::new()),
            windows: RefCell::new(HashMap::new()),
            mel_banks: RefCell::new(HashMap::new()),
            arena: RefCell::new(Arena::default()),
            templates: TonalTemplates::new(),
            ready: Cell::new(false),
        };
        backend.planner.borrow_mut().plan_fft_forward(frame_size);
        backend.window_table(WindowKind::Hann, frame_size);
        log::debug!("Native backend assets loaded (frame size {})", frame_size);
        Ok(backend)
    }

    fn ensure_ready(&self) -> Result<(), BackendError> {
        if self.ready.get() {
            Ok(())
        } else {
            Err(BackendError::Runtime("warm_up has not completed".into()))
        }
    }

    fn window_table(&self, kind: WindowKind, size: usize) -> Rc<Vec<f32>> {
        self.windows
            .borrow_mut()
            .entry((kind, size))
            .or_insert_with(|| Rc::new(window(kind, size)))
            .clone()
    }

    fn mel_bank(&self, bins: usize, fft_size: usize, sample_rate: u32) -> Rc<MelBank> {
        self.mel_banks
            .borrow_mut()
            .entry((fft_size, sample_rate))
            .or_insert_with(|| Rc::new(MelBank::new(bins, fft_size, sample_rate)))
            .clone()
    }

    fn store(&self, slot: Slot) -> HandleId {
        self.arena.borrow_mut().insert(slot)
    }

    fn with_vector<T>(
        &self,
        id: HandleId,
        f: impl FnOnce(&[f32]) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        self.ensure_ready()?;
        let arena = self.arena.borrow();
        match arena.slots.get(&id) {
            Some(Slot::Vector(v)) => f(v),
            Some(other) => Err(BackendError::WrongKind {
                id,
                found: other.kind(),
                expected: "vector",
            }),
            None => Err(BackendError::InvalidHandle(id)),
        }
    }

    fn with_spectrum<T>(
        &self,
        id: HandleId,
        f: impl FnOnce(&[f32], usize) -> Result<T, BackendError>,
    ) -> Result<T, BackendError> {
        self.ensure_ready()?;
        let arena = self.arena.borrow();
        match arena.slots.get(&id) {
            Some(Slot::Spectrum { magnitudes, fft_size }) => f(magnitudes, *fft_size),
            Some(other) => Err(BackendError::WrongKind {
                id,
                found: other.kind(),
                expected: "spectrum",
            }),
            None => Err(BackendError::InvalidHandle(id)),
        }
    }
}

impl Backend for NativeBackend {
    fn name(&self) -> &str {
        "native"
    }

    fn warm_up(&self) -> Result<(), BackendError> {
        let size = 256;
        let fft = self.planner.borrow_mut().plan_fft_forward(size);
        let mut impulse = vec![Complex::new(0.0f32, 0.0); size];
        impulse[1] = Complex::new(1.0, 0.0);
        fft.process(&mut impulse);
        if impulse.iter().any(|c| !c.norm().is_finite()) {
            return Err(BackendError::Runtime("FFT self-test produced non-finite output".into()));
        }
        self.ready.set(true);
        Ok(())
    }

    fn vector(&self, data: &[f32]) -> Result<HandleId, BackendError> {
        self.ensure_ready()?;
        Ok(self.store(Slot::Vector(data.to_vec())))
    }

    fn windowed(&self, frame: HandleId, kind: WindowKind) -> Result<HandleId, BackendError> {
        let out = self.with_vector(frame, |v| {
            let table = self.window_table(kind, v.len());
            Ok(v.iter().zip(table.iter()).map(|(s, w)| s * w).collect())
        })?;
        Ok(self.store(Slot::Vector(out)))
    }

    fn spectrum(&self, frame: HandleId) -> Result<HandleId, BackendError> {
        let (magnitudes, fft_size) = self.with_vector(frame, |v| {
            let n = v.len();
            if n < 2 {
                return Err(BackendError::InvalidInput(format!("frame of {n} samples")));
            }
            let fft = self.planner.borrow_mut().plan_fft_forward(n);
            let mut buffer: Vec<Complex<f32>> = v.iter().map(|&s| Complex::new(s, 0.0)).collect();
            fft.process(&mut buffer);
            Ok((buffer[..=n / 2].iter().map(|c| c.norm()).collect::<Vec<f32>>(), n))
        })?;
        Ok(self.store(Slot::Spectrum { magnitudes, fft_size }))
    }

    fn read(&self, handle: HandleId) -> Result<Vec<f32>, BackendError> {
        self.ensure_ready()?;
        match self.arena.borrow().slots.get(&handle) {
            Some(Slot::Vector(v)) => Ok(v.clone()),
            Some(Slot::Spectrum { magnitudes, .. }) => Ok(magnitudes.clone()),
            None => Err(BackendError::InvalidHandle(handle)),
        }
    }

    fn spectral_centroid(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError> {
        self.with_spectrum(spectrum, |mags, fft_size| {
            Ok(centroid(mags, bin_hz(fft_size, sample_rate)))
        })
    }

    fn spectral_rolloff(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError> {
        self.with_spectrum(spectrum, |mags, fft_size| {
            let total: f32 = mags.iter().map(|m| m * m).sum();
            if total <= 1e-10 {
                return Ok(0.0);
            }
            let target = total * ROLLOFF_FRACTION;
            let mut cumulative = 0.0;
            for (i, m) in mags.iter().enumerate() {
                cumulative += m * m;
                if cumulative >= target {
                    return Ok(i as f32 * bin_hz(fft_size, sample_rate));
                }
            }
            Ok((mags.len() - 1) as f32 * bin_hz(fft_size, sample_rate))
        })
    }

    fn spectral_spread(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError> {
        self.with_spectrum(spectrum, |mags, fft_size| {
            let hz = bin_hz(fft_size, sample_rate);
            let total: f32 = mags.iter().sum();
            if total <= 1e-10 {
                return Ok(0.0);
            }
            let c = centroid(mags, hz);
            let var: f32 = mags
                .iter()
                .enumerate()
                .map(|(i, &m)| {
                    let d = i as f32 * hz - c;
                    d * d * m
                })
                .sum::<f32>()
                / total;
            Ok(var.sqrt())
        })
    }

    fn spectral_flux(&self, previous: HandleId, current: HandleId) -> Result<f32, BackendError> {
        let prev = self.with_spectrum(previous, |mags, _| Ok(mags.to_vec()))?;
        self.with_spectrum(current, |mags, _| {
            if mags.len() != prev.len() {
                return Err(BackendError::InvalidInput(format!(
                    "spectrum sizes differ ({} vs {})",
                    prev.len(),
                    mags.len()
                )));
            }
            Ok(mags
                .iter()
                .zip(prev.iter())
                .map(|(cur, prev)| (cur - prev).max(0.0))
                .sum())
        })
    }

    fn brightness(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError> {
        self.with_spectrum(spectrum, |mags, fft_size| {
            let hz = bin_hz(fft_size, sample_rate);
            let total: f32 = mags.iter().map(|m| m * m).sum();
            if total <= 1e-10 {
                return Ok(0.0);
            }
            let high: f32 = mags
                .iter()
                .enumerate()
                .filter(|(i, _)| *i as f32 * hz >= BRIGHTNESS_CUTOFF_HZ)
                .map(|(_, m)| m * m)
                .sum();
            Ok(high / total)
        })
    }

    fn roughness(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError> {
        self.with_spectrum(spectrum, |mags, fft_size| {
            Ok(roughness(mags, bin_hz(fft_size, sample_rate)))
        })
    }

    fn energy(&self, frame: HandleId) -> Result<f32, BackendError> {
        self.with_vector(frame, |v| {
            if v.is_empty() {
                return Ok(0.0);
            }
            Ok(v.iter().map(|s| s * s).sum::<f32>() / v.len() as f32)
        })
    }

    fn zero_crossing_rate(&self, frame: HandleId) -> Result<f32, BackendError> {
        self.with_vector(frame, |v| {
            if v.len() < 2 {
                return Ok(0.0);
            }
            let crossings = v.windows(2).filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0)).count();
            Ok(crossings as f32 / (v.len() - 1) as f32)
        })
    }

    fn mfcc(
        &self,
        spectrum: HandleId,
        sample_rate: u32,
        coefficients: usize,
    ) -> Result<Vec<f32>, BackendError> {
        if coefficients == 0 || coefficients > MEL_FILTERS {
            return Err(BackendError::InvalidInput(format!(
                "{coefficients} coefficients requested, at most {MEL_FILTERS} available"
            )));
        }
        self.with_spectrum(spectrum, |mags, fft_size| {
            let bank = self.mel_bank(mags.len(), fft_size, sample_rate);
            let log_energies: Vec<f32> = bank
                .filters
                .iter()
                .map(|(first, weights)| {
                    let e: f32 = weights
                        .iter()
                        .zip(&mags[*first..])
                        .map(|(w, m)| w * m * m)
                        .sum();
                    (e + 1e-10).ln()
                })
                .collect();

            let m = log_energies.len() as f32;
            Ok((0..coefficients)
                .map(|k| {
                    log_energies
                        .iter()
                        .enumerate()
                        .map(|(j, &e)| {
                            e * (std::f32::consts::PI * k as f32 * (j as f32 + 0.5) / m).cos()
                        })
                        .sum()
                })
                .collect())
        })
    }

    fn chroma(&self, spectrum: HandleId, sample_rate: u32) -> Result<[f32; 12], BackendError> {
        self.with_spectrum(spectrum, |mags, fft_size| {
            let hz = bin_hz(fft_size, sample_rate);
            let mut chroma = [0.0f32; 12];
            for (i, &m) in mags.iter().enumerate().skip(1) {
                let f = i as f32 * hz;
                if !(27.5..=5000.0).contains(&f) {
                    continue;
                }
                let midi = (12.0 * (f / 440.0).log2()).round() as i32 + 69;
                chroma[midi.rem_euclid(12) as usize] += m * m;
            }
            let peak = chroma.iter().copied().fold(0.0f32, f32::max);
            if peak > 1e-10 {
                chroma.iter_mut().for_each(|c| *c /= peak);
            }
            Ok(chroma)
        })
    }

    fn pitch(&self, frame: HandleId, sample_rate: u32) -> Result<PitchReading, BackendError> {
        self.with_vector(frame, |v| Ok(yin(v, sample_rate)))
    }

    fn tempo(&self, envelope: HandleId, frame_rate: f32) -> Result<TempoReading, BackendError> {
        self.with_vector(envelope, |env| {
            if frame_rate <= 0.0 {
                return Err(BackendError::InvalidInput(format!("frame rate {frame_rate}")));
            }
            let min_lag = ((60.0 * frame_rate / MAX_BPM).floor() as usize).max(1);
            let max_lag = (60.0 * frame_rate / MIN_BPM).ceil() as usize;
            if env.len() <= max_lag + 1 {
                return Err(BackendError::InvalidInput(format!(
                    "onset envelope of {} frames is too short for tempo estimation",
                    env.len()
                )));
            }

            let mean = env.iter().sum::<f32>() / env.len() as f32;
            let centered: Vec<f32> = env.iter().map(|e| e - mean).collect();
            let r0 = centered.iter().map(|e| e * e).sum::<f32>() / centered.len() as f32;
            if r0 <= 1e-12 {
                return Err(BackendError::InvalidInput("flat onset envelope".into()));
            }

            let correlations: Vec<(usize, f32)> = (min_lag..=max_lag)
                .into_par_iter()
                .map(|lag| {
                    let n = centered.len() - lag;
                    let r: f32 = centered[..n]
                        .iter()
                        .zip(&centered[lag..])
                        .map(|(a, b)| a * b)
                        .sum();
                    (lag, r / n as f32)
                })
                .collect();

            let peak = correlations
                .iter()
                .map(|(_, r)| *r)
                .fold(f32::NEG_INFINITY, f32::max);
            // multiples of the beat period correlate as well as the period
            // itself, so take the shortest lag close to the peak
            let (pos, &(lag, best)) = correlations
                .iter()
                .enumerate()
                .find(|(_, (_, r))| *r >= 0.9 * peak)
                .ok_or_else(|| BackendError::InvalidInput("empty lag range".into()))?;

            // parabolic refinement around the peak
            let mut refined = lag as f32;
            if pos > 0 && pos + 1 < correlations.len() {
                let (l, c, r) = (correlations[pos - 1].1, best, correlations[pos + 1].1);
                let denom = l - 2.0 * c + r;
                if denom.abs() > 1e-12 {
                    refined += (0.5 * (l - r) / denom).clamp(-0.5, 0.5);
                }
            }

            Ok(TempoReading {
                bpm: 60.0 * frame_rate / refined,
                confidence: (best / r0).clamp(0.0, 1.0),
            })
        })
    }

    fn key(&self, chroma: &[f32; 12]) -> Result<TonalReading, BackendError> {
        self.ensure_ready()?;
        self.templates
            .detect_key(chroma)
            .map(|(label, confidence)| TonalReading { label, confidence })
            .ok_or_else(|| BackendError::InvalidInput("no tonal content".into()))
    }

    fn chord(&self, chroma: &[f32; 12]) -> Result<TonalReading, BackendError> {
        self.ensure_ready()?;
        self.templates
            .detect_chord(chroma)
            .map(|(label, confidence)| TonalReading { label, confidence })
            .ok_or_else(|| BackendError::InvalidInput("no tonal content".into()))
    }

    fn release(&self, handle: HandleId) -> bool {
        self.arena.borrow_mut().slots.remove(&handle).is_some()
    }

    fn release_all(&self) -> usize {
        let mut arena = self.arena.borrow_mut();
        let count = arena.slots.len();
        arena.slots.clear();
        count
    }

    fn live_handles(&self) -> usize {
        self.arena.borrow().slots.len()
    }
}

/// Loads a [`NativeBackend`] on each unit thread.
#[derive(Clone, Debug)]
pub struct NativeFactory {
    pub frame_size: usize,
}

impl NativeFactory {
    pub fn new(frame_size: usize) -> Self {
        Self { frame_size }
    }
}

impl Default for NativeFactory {
    fn default() -> Self {
        Self::new(2048)
    }
}

impl BackendFactory for NativeFactory {
    fn load(&self) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(NativeBackend::load_assets(self.frame_size)?))
    }
}

fn bin_hz(fft_size: usize, sample_rate: u32) -> f32 {
    sample_rate as f32 / fft_size as f32
}

fn window(kind: WindowKind, size: usize) -> Vec<f32> {
    if size < 2 {
        return vec![1.0; size];
    }
    let denom = (size - 1) as f32;
    (0..size)
        .map(|i| {
            let x = 2.0 * std::f32::consts::PI * i as f32 / denom;
            match kind {
                WindowKind::Hann => 0.5 * (1.0 - x.cos()),
                WindowKind::Hamming => 0.54 - 0.46 * x.cos(),
                WindowKind::Blackman => 0.42 - 0.5 * x.cos() + 0.08 * (2.0 * x).cos(),
            }
        })
        .collect()
}

fn centroid(mags: &[f32], hz: f32) -> f32 {
    let total: f32 = mags.iter().sum();
    if total <= 1e-10 {
        return 0.0;
    }
    mags.iter()
        .enumerate()
        .map(|(i, &m)| i as f32 * hz * m)
        .sum::<f32>()
        / total
}

/// Sensory dissonance of the strongest spectral peaks (Plomp-Levelt curve,
/// Sethares parameterization), normalized by peak energy.
fn roughness(mags: &[f32], hz: f32) -> f32 {
    let max = mags.iter().copied().fold(0.0f32, f32::max);
    if max <= 1e-10 || mags.len() < 3 {
        return 0.0;
    }
    let mut peaks: Vec<(f32, f32)> = (1..mags.len() - 1)
        .filter(|&i| mags[i] > mags[i - 1] && mags[i] >= mags[i + 1] && mags[i] > 0.1 * max)
        .map(|i| (i as f32 * hz, mags[i]))
        .collect();
    peaks.sort_by(|a, b| b.1.total_cmp(&a.1));
    peaks.truncate(16);

    let mut total = 0.0;
    for (i, &(f1, a1)) in peaks.iter().enumerate() {
        for &(f2, a2) in &peaks[i + 1..] {
            let f_min = f1.min(f2);
            let s = 0.24 / (0.0207 * f_min + 18.96);
            let df = (f2 - f1).abs();
            total += a1 * a2 * ((-3.5 * s * df).exp() - (-5.75 * s * df).exp());
        }
    }
    let energy: f32 = peaks.iter().map(|(_, a)| a * a).sum();
    if energy <= 1e-10 {
        0.0
    } else {
        total / energy
    }
}

/// YIN fundamental estimate over one time-domain frame.
fn yin(frame: &[f32], sample_rate: u32) -> PitchReading {
    let unvoiced = PitchReading {
        frequency: 0.0,
        confidence: 0.0,
    };
    let sr = sample_rate as f32;
    let min_lag = (sr / MAX_PITCH_HZ).floor().max(2.0) as usize;
    let max_lag = ((sr / MIN_PITCH_HZ).ceil() as usize).min(frame.len() / 2);
    if max_lag <= min_lag {
        return unvoiced;
    }
    if frame.iter().map(|s| s * s).sum::<f32>() < 1e-8 {
        return unvoiced;
    }

    let width = frame.len() - max_lag;
    let mut diff = vec![0.0f32; max_lag + 1];
    for (lag, d) in diff.iter_mut().enumerate().skip(1) {
        *d = frame[..width]
            .iter()
            .zip(&frame[lag..lag + width])
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
    }

    // cumulative mean normalized difference
    let mut cmnd = vec![1.0f32; max_lag + 1];
    let mut running = 0.0;
    for lag in 1..=max_lag {
        running += diff[lag];
        cmnd[lag] = if running > 0.0 {
            diff[lag] * lag as f32 / running
        } else {
            1.0
        };
    }

    let mut chosen = None;
    let mut lag = min_lag;
    while lag <= max_lag {
        if cmnd[lag] < YIN_THRESHOLD {
            while lag < max_lag && cmnd[lag + 1] < cmnd[lag] {
                lag += 1;
            }
            chosen = Some(lag);
            break;
        }
        lag += 1;
    }
    let lag = chosen.unwrap_or_else(|| {
        (min_lag..=max_lag)
            .min_by(|&a, &b| cmnd[a].total_cmp(&cmnd[b]))
            .unwrap_or(min_lag)
    });

    let confidence = (1.0 - cmnd[lag]).clamp(0.0, 1.0);
    PitchReading {
        frequency: if confidence >= VOICING_CONFIDENCE {
            sr / lag as f32
        } else {
            0.0
        },
        confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Handle;
    use approx::assert_relative_eq;
    use std::f32::consts::PI;

    fn ready(frame_size: usize) -> NativeBackend {
        let backend = NativeBackend::load_assets(frame_size).unwrap();
        backend.warm_up().unwrap();
        backend
    }

    fn sine(freq: f32, sr: u32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sr as f32).sin() * 0.5)
            .collect()
    }

    #[test]
    fn calls_before_warm_up_are_refused() {
        let backend = NativeBackend::load_assets(512).unwrap();
        assert!(matches!(backend.vector(&[0.0; 4]), Err(BackendError::Runtime(_))));
        backend.warm_up().unwrap();
        assert!(backend.vector(&[0.0; 4]).is_ok());
        assert_eq!(backend.release_all(), 1);
    }

    #[test]
    fn centroid_of_a_sine_is_its_frequency() {
        let backend = ready(2048);
        let sr = 16_000;
        let frame = Handle::vector(&backend, &sine(1000.0, sr, 2048)).unwrap();
        let spectrum = frame.windowed(WindowKind::Hann).unwrap().spectrum().unwrap();
        let c = backend.spectral_centroid(spectrum.id(), sr).unwrap();
        assert_relative_eq!(c, 1000.0, epsilon = 30.0);

        let chroma = backend.chroma(spectrum.id(), sr).unwrap();
        // 1000 Hz is closest to B5
        let strongest = chroma
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(strongest, 11);
    }

    #[test]
    fn yin_tracks_a_voiced_tone() {
        let backend = ready(2048);
        let sr = 16_000;
        let frame = Handle::vector(&backend, &sine(220.0, sr, 2048)).unwrap();
        let reading = backend.pitch(frame.id(), sr).unwrap();
        assert!(reading.confidence > 0.8);
        assert_relative_eq!(reading.frequency, 220.0, epsilon = 3.0);

        let silence = Handle::vector(&backend, &[0.0; 2048]).unwrap();
        assert_eq!(backend.pitch(silence.id(), sr).unwrap().frequency, 0.0);
    }

    #[test]
    fn tempo_from_periodic_envelope() {
        let backend = ready(1024);
        // 10 Hz envelope frame rate, pulse every 5 frames = 120 BPM
        let env: Vec<f32> = (0..200).map(|i| if i % 5 == 0 { 1.0 } else { 0.0 }).collect();
        let handle = Handle::vector(&backend, &env).unwrap();
        let reading = backend.tempo(handle.id(), 10.0).unwrap();
        assert_relative_eq!(reading.bpm, 120.0, epsilon = 2.0);
        assert!(reading.confidence > 0.5);

        let short = Handle::vector(&backend, &[1.0, 0.0, 1.0]).unwrap();
        assert!(backend.tempo(short.id(), 10.0).is_err());
    }

    #[test]
    fn mfcc_has_requested_length() {
        let backend = ready(1024);
        let frame = Handle::vector(&backend, &sine(440.0, 8000, 1024)).unwrap();
        let spectrum = frame.spectrum().unwrap();
        let coeffs = backend.mfcc(spectrum.id(), 8000, 13).unwrap();
        assert_eq!(coeffs.len(), 13);
        assert!(coeffs.iter().all(|c| c.is_finite()));
        assert!(backend.mfcc(spectrum.id(), 8000, 64).is_err());
    }

    #[test]
    fn wrong_handle_kinds_are_rejected() {
        let backend = ready(256);
        let frame = Handle::vector(&backend, &[0.1; 256]).unwrap();
        assert!(matches!(
            backend.spectral_centroid(frame.id(), 8000),
            Err(BackendError::WrongKind { .. })
        ));
        assert!(matches!(backend.energy(9999), Err(BackendError::InvalidHandle(9999))));
    }
}
