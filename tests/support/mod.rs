#![allow(dead_code)]

use cadence::backend::{
    Backend, BackendError, BackendFactory, HandleId, NativeBackend, PitchReading, TempoReading,
    TonalReading, WindowKind,
};
use cadence::{AnalysisParams, FeatureSet};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::time::Duration;

/// A frame starting with this sample blocks on the gate, then panics
pub const PANIC_SENTINEL: f32 = f32::MAX;
/// A frame starting with this sample fails with a runtime error
pub const ERROR_SENTINEL: f32 = f32::MIN;
/// A frame starting with this sample stalls for [`SLOW_DELAY`], then succeeds
pub const SLOW_SENTINEL: f32 = 1234.5;
pub const SLOW_DELAY: Duration = Duration::from_millis(2500);

pub const SAMPLE_RATE: u32 = 4000;

pub fn params() -> AnalysisParams {
    AnalysisParams {
        frame_size: 512,
        hop_size: 256,
        mfcc_coefficients: 13,
        features: FeatureSet::all(),
    }
}

pub fn tone(seconds: f32) -> Vec<f32> {
    (0..(seconds * SAMPLE_RATE as f32) as usize)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let gate = if (t * 2.0).fract() < 0.3 { 1.0 } else { 0.2 };
            (2.0 * std::f32::consts::PI * 330.0 * t).sin() * 0.4 * gate
        })
        .collect()
}

/// Handles for steering a [`FlakyFactory`] from the test thread.
pub struct Faults {
    /// Receives one message each time a unit reaches the panic sentinel
    pub entered: Receiver<()>,
    release: Sender<()>,
}

impl Faults {
    /// Lets one blocked unit proceed to its panic.
    pub fn release(&self) {
        self.release.send(()).unwrap();
    }

    pub fn wait_entered(&self) {
        self.entered
            .recv_timeout(Duration::from_secs(10))
            .expect("unit never reached the panic sentinel");
    }
}

pub struct FlakyFactory {
    frame_size: usize,
    entered: Sender<()>,
    gate: Receiver<()>,
}

impl FlakyFactory {
    pub fn new(frame_size: usize) -> (Self, Faults) {
        let (entered_tx, entered_rx) = unbounded();
        let (release_tx, release_rx) = unbounded();
        (
            Self {
                frame_size,
                entered: entered_tx,
                gate: release_rx,
            },
            Faults {
                entered: entered_rx,
                release: release_tx,
            },
        )
    }
}

impl BackendFactory for FlakyFactory {
    fn load(&self) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(FlakyBackend {
            inner: NativeBackend::load_assets(self.frame_size)?,
            entered: self.entered.clone(),
            gate: self.gate.clone(),
        }))
    }
}

/// Loads fine, then never finishes warming up within any sane timeout.
pub struct HangingFactory;

impl BackendFactory for HangingFactory {
    fn load(&self) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(HangingBackend(NativeBackend::load_assets(512)?)))
    }
}

struct HangingBackend(NativeBackend);

/// Fails the asset load phase.
pub struct FailingFactory;

impl BackendFactory for FailingFactory {
    fn load(&self) -> Result<Box<dyn Backend>, BackendError> {
        Err(BackendError::Load("model assets missing".into()))
    }
}

pub struct FlakyBackend {
    inner: NativeBackend,
    entered: Sender<()>,
    gate: Receiver<()>,
}

macro_rules! delegate {
    ($field:tt) => {
        fn name(&self) -> &str {
            self.$field.name()
        }
        fn windowed(&self, frame: HandleId, window: WindowKind) -> Result<HandleId, BackendError> {
            self.$field.windowed(frame, window)
        }
        fn spectrum(&self, frame: HandleId) -> Result<HandleId, BackendError> {
            self.$field.spectrum(frame)
        }
        fn read(&self, handle: HandleId) -> Result<Vec<f32>, BackendError> {
            self.$field.read(handle)
        }
        fn spectral_centroid(&self, s: HandleId, sr: u32) -> Result<f32, BackendError> {
            self.$field.spectral_centroid(s, sr)
        }
        fn spectral_rolloff(&self, s: HandleId, sr: u32) -> Result<f32, BackendError> {
            self.$field.spectral_rolloff(s, sr)
        }
        fn spectral_spread(&self, s: HandleId, sr: u32) -> Result<f32, BackendError> {
            self.$field.spectral_spread(s, sr)
        }
        fn spectral_flux(&self, prev: HandleId, cur: HandleId) -> Result<f32, BackendError> {
            self.$field.spectral_flux(prev, cur)
        }
        fn brightness(&self, s: HandleId, sr: u32) -> Result<f32, BackendError> {
            self.$field.brightness(s, sr)
        }
        fn roughness(&self, s: HandleId, sr: u32) -> Result<f32, BackendError> {
            self.$field.roughness(s, sr)
        }
        fn energy(&self, frame: HandleId) -> Result<f32, BackendError> {
            self.$field.energy(frame)
        }
        fn zero_crossing_rate(&self, frame: HandleId) -> Result<f32, BackendError> {
            self.$field.zero_crossing_rate(frame)
        }
        fn mfcc(&self, s: HandleId, sr: u32, n: usize) -> Result<Vec<f32>, BackendError> {
            self.$field.mfcc(s, sr, n)
        }
        fn chroma(&self, s: HandleId, sr: u32) -> Result<[f32; 12], BackendError> {
            self.$field.chroma(s, sr)
        }
        fn pitch(&self, frame: HandleId, sr: u32) -> Result<PitchReading, BackendError> {
            self.$field.pitch(frame, sr)
        }
        fn tempo(&self, env: HandleId, rate: f32) -> Result<TempoReading, BackendError> {
            self.$field.tempo(env, rate)
        }
        fn key(&self, chroma: &[f32; 12]) -> Result<TonalReading, BackendError> {
            self.$field.key(chroma)
        }
        fn chord(&self, chroma: &[f32; 12]) -> Result<TonalReading, BackendError> {
            self.$field.chord(chroma)
        }
        fn release(&self, handle: HandleId) -> bool {
            self.$field.release(handle)
        }
        fn release_all(&self) -> usize {
            self.$field.release_all()
        }
        fn live_handles(&self) -> usize {
            self.$field.live_handles()
        }
    };
}

impl Backend for FlakyBackend {
    delegate!(inner);

    fn warm_up(&self) -> Result<(), BackendError> {
        self.inner.warm_up()
    }

    fn vector(&self, data: &[f32]) -> Result<HandleId, BackendError> {
        match data.first() {
            Some(&s) if s == PANIC_SENTINEL => {
                let _ = self.entered.send(());
                let _ = self.gate.recv();
                panic!("injected backend fault");
            }
            Some(&s) if s == ERROR_SENTINEL => {
                Err(BackendError::Runtime("injected backend error".into()))
            }
            Some(&s) if s == SLOW_SENTINEL => {
                std::thread::sleep(SLOW_DELAY);
                self.inner.vector(data)
            }
            _ => self.inner.vector(data),
        }
    }
}

impl Backend for HangingBackend {
    delegate!(0);

    fn warm_up(&self) -> Result<(), BackendError> {
        std::thread::sleep(Duration::from_secs(5));
        self.0.warm_up()
    }

    fn vector(&self, data: &[f32]) -> Result<HandleId, BackendError> {
        self.0.vector(data)
    }
}
