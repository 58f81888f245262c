pub mod native;
pub mod tonal;

use thiserror::Error;

pub use native::{NativeBackend, NativeFactory};

pub type HandleId = u32;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Asset load failed: {0}")]
    Load(String),

    #[error("Runtime not ready: {0}")]
    Runtime(String),

    #[error("Unknown handle #{0}")]
    InvalidHandle(HandleId),

    #[error("Handle #{id} is a {found}, expected a {expected}")]
    WrongKind {
        id: HandleId,
        found: &'static str,
        expected: &'static str,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WindowKind {
    Hann,
    Hamming,
    Blackman,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PitchReading {
    /// Fundamental in Hz, 0.0 when no periodicity was found
    pub frequency: f32,
    pub confidence: f32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TempoReading {
    pub bpm: f32,
    pub confidence: f32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TonalReading {
    pub label: String,
    pub confidence: f32,
}

/// Feature extraction surface of a loaded backend.
pub trait Backend {
    fn name(&self) -> &str;

    /// Second startup phase. Returns once the runtime can serve calls.
    fn warm_up(&self) -> Result<(), BackendError>;

    fn vector(&self, data: &[f32]) -> Result<HandleId, BackendError>;
    fn windowed(&self, frame: HandleId, window: WindowKind) -> Result<HandleId, BackendError>;
    fn spectrum(&self, frame: HandleId) -> Result<HandleId, BackendError>;
    fn read(&self, handle: HandleId) -> Result<Vec<f32>, BackendError>;

    fn spectral_centroid(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError>;
    fn spectral_rolloff(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError>;
    fn spectral_spread(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError>;
    fn spectral_flux(&self, previous: HandleId, current: HandleId) -> Result<f32, BackendError>;
    fn brightness(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError>;
    fn roughness(&self, spectrum: HandleId, sample_rate: u32) -> Result<f32, BackendError>;
    fn energy(&self, frame: HandleId) -> Result<f32, BackendError>;
    fn zero_crossing_rate(&self, frame: HandleId) -> Result<f32, BackendError>;

    fn mfcc(
        &self,
        spectrum: HandleId,
        sample_rate: u32,
        coefficients: usize,
    ) -> Result<Vec<f32>, BackendError>;
    fn chroma(&self, spectrum: HandleId, sample_rate: u32) -> Result<[f32; 12], BackendError>;
    fn pitch(&self, frame: HandleId, sample_rate: u32) -> Result<PitchReading, BackendError>;
    /// Tempo from an onset-strength envelope sampled at `frame_rate` Hz
    fn tempo(&self, envelope: HandleId, frame_rate: f32) -> Result<TempoReading, BackendError>;
    fn key(&self, chroma: &[f32; 12]) -> Result<TonalReading, BackendError>;
    fn chord(&self, chroma: &[f32; 12]) -> Result<TonalReading, BackendError>;

    /// Frees one handle. Returns false if it was not live.
    fn release(&self, handle: HandleId) -> bool;
    fn release_all(&self) -> usize;
    fn live_handles(&self) -> usize;
}

/// Loads backend assets (first startup phase). Shared by every unit of an
/// engine; each unit calls `load` on its own thread.
pub trait BackendFactory: Send + Sync + 'static {
    fn load(&self) -> Result<Box<dyn Backend>, BackendError>;
}

pub struct Handle<'b> {
    backend: &'b dyn Backend,
    id: HandleId,
}

impl<'b> Handle<'b> {
    pub fn vector(backend: &'b dyn Backend, data: &[f32]) -> Result<Self, BackendError> {
        let id = backend.vector(data)?;
        Ok(Self::adopt(backend, id))
    }

    /// Takes ownership of a raw id just returned by `backend`.
    pub fn adopt(backend: &'b dyn Backend, id: HandleId) -> Self {
        Self { backend, id }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn windowed(&self, window: WindowKind) -> Result<Handle<'b>, BackendError> {
        let id = self.backend.windowed(self.id, window)?;
        Ok(Handle::adopt(self.backend, id))
    }

    pub fn spectrum(&self) -> Result<Handle<'b>, BackendError> {
        let id = self.backend.spectrum(self.id)?;
        Ok(Handle::adopt(self.backend, id))
    }

    pub fn read(&self) -> Result<Vec<f32>, BackendError> {
        self.backend.read(self.id)
    }
}

impl Drop for Handle<'_> {
    fn drop(&mut self) {
        if !self.backend.release(self.id) {
            log::warn!("Handle #{} was already released", self.id);
        }
    }
}
