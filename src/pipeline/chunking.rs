use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// One window of the input signal, `[start_sample, end_sample)`.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkDescriptor {
    pub index: usize,
    pub start_sample: usize,
    pub end_sample: usize,
    pub start_time: f64,
    pub end_time: f64,
}

impl ChunkDescriptor {
    /// A single chunk spanning the whole signal, used for one-pass analysis.
    pub fn whole(total_samples: usize, sample_rate: u32) -> Self {
        Self::new(0, 0, total_samples, sample_rate)
    }

    fn new(index: usize, start: usize, end: usize, sample_rate: u32) -> Self {
        let sr = sample_rate.max(1) as f64;
        Self {
            index,
            start_sample: start,
            end_sample: end,
            start_time: start as f64 / sr,
            end_time: end as f64 / sr,
        }
    }

    pub fn len(&self) -> usize {
        self.end_sample - self.start_sample
    }

    pub fn is_empty(&self) -> bool {
        self.end_sample <= self.start_sample
    }

    pub fn covers_time(&self, time: f64) -> bool {
        time >= self.start_time && time < self.end_time
    }
}

/// Converts a duration in seconds to a sample count at `sample_rate`.
pub fn seconds_to_samples(seconds: f32, sample_rate: u32) -> usize {
    (seconds.max(0.0) as f64 * sample_rate as f64).round() as usize
}

/// Number of chunks needed to cover `total` samples:
/// `ceil((total - overlap) / (chunk_size - overlap))`, at least 1 for a
/// non-empty signal.
pub fn chunk_count(total: usize, chunk_size: usize, overlap: usize) -> usize {
    if total == 0 || chunk_size <= overlap {
        return 0;
    }
    let stride = chunk_size - overlap;
    if total <= overlap {
        return 1;
    }
    (total - overlap).div_ceil(stride)
}

/// Splits `total` samples into overlapping chunks of `chunk_size` with a
/// constant `overlap`. The final chunk is clipped to the signal end.
pub fn plan_chunks(
    total: usize,
    chunk_size: usize,
    overlap: usize,
    sample_rate: u32,
) -> Result<Vec<ChunkDescriptor>> {
    if chunk_size == 0 {
        return Err(EngineError::Validation("chunk size must be positive".into()));
    }
    if overlap >= chunk_size {
        return Err(EngineError::Validation(format!(
            "overlap ({overlap} samples) must be shorter than the chunk ({chunk_size} samples)"
        )));
    }

    let stride = chunk_size - overlap;
    let count = chunk_count(total, chunk_size, overlap);
    let chunks = (0..count)
        .map(|i| {
            let start = i * stride;
            let end = (start + chunk_size).min(total);
            ChunkDescriptor::new(i, start, end, sample_rate)
        })
        .collect();

    Ok(chunks)
}
