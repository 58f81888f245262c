use crossbeam_channel::{RecvError, Select};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::features::{AnalysisParams, PartialResult};
use crate::error::{EngineError, Result};
use crate::pipeline::chunking::{plan_chunks, seconds_to_samples, ChunkDescriptor};
use crate::worker::correlation::{JobOutcome, JobOutput, PendingReply};
use crate::worker::handle::ComputeUnit;
use crate::worker::protocol::{ChunkJob, WorkerRequest};

#[derive(Debug, Clone, PartialEq)]
pub struct StreamingOptions {
    pub chunk_seconds: f32,
    pub overlap_seconds: f32,
    /// Per-chunk deadline; a chunk that misses it is skipped
    pub chunk_timeout: Option<Duration>,
}

impl Default for StreamingOptions {
    fn default() -> Self {
        Self {
            chunk_seconds: 30.0,
            overlap_seconds: 5.0,
            chunk_timeout: Some(Duration::from_secs(120)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamProgress {
    pub percentage: f32,
    /// Chunks finished so far, skipped ones included
    pub current_chunk: usize,
    pub total_chunks: usize,
}

#[derive(Debug, Clone)]
pub struct StreamOutcome {
    /// Successful chunks in chunk-index order
    pub partials: Vec<PartialResult>,
    pub failed_chunks: Vec<usize>,
    pub total_chunks: usize,
}

struct InFlight {
    chunk: ChunkDescriptor,
    reply: PendingReply,
    deadline: Option<Instant>,
}

enum Slot {
    Idle,
    Running(InFlight),
    /// Timed out; the unit is still busy with it until its late reply lands
    Draining(InFlight),
}

impl Slot {
    fn job(&self) -> Option<&InFlight> {
        match self {
            Slot::Idle => None,
            Slot::Running(job) | Slot::Draining(job) => Some(job),
        }
    }
}

enum Event {
    Finished(usize, std::result::Result<JobOutcome, RecvError>),
    Expired,
}

/// Runs the chunks of one signal on a set of units, at most one chunk in
/// flight per unit. With a single unit this is plain sequential dispatch.
pub struct ChunkScheduler<'u> {
    units: &'u [ComputeUnit],
    options: StreamingOptions,
}

impl<'u> ChunkScheduler<'u> {
    pub fn new(units: &'u [ComputeUnit], options: StreamingOptions) -> Self {
        Self { units, options }
    }

    pub fn run(
        &self,
        source: Arc<[f32]>,
        sample_rate: u32,
        params: &AnalysisParams,
        on_progress: &mut dyn FnMut(StreamProgress),
    ) -> Result<StreamOutcome> {
        if self.units.is_empty() {
            return Err(EngineError::Validation("no compute units to schedule on".into()));
        }
        let chunk_size = seconds_to_samples(self.options.chunk_seconds, sample_rate);
        let overlap = seconds_to_samples(self.options.overlap_seconds, sample_rate);
        let chunks = plan_chunks(source.len(), chunk_size, overlap, sample_rate)?;
        let total = chunks.len();

        log::info!(
            "Streaming {} chunks ({:.1}s, {:.1}s overlap) over {} unit(s)",
            total,
            self.options.chunk_seconds,
            self.options.overlap_seconds,
            self.units.len()
        );

        let mut queue: VecDeque<ChunkDescriptor> = chunks.into();
        let mut slots: Vec<Slot> = self.units.iter().map(|_| Slot::Idle).collect();
        let mut partials = Vec::with_capacity(total);
        let mut failed = Vec::new();
        let mut completed = 0usize;

        loop {
            for (unit, slot) in self.units.iter().zip(slots.iter_mut()) {
                if !matches!(slot, Slot::Idle) {
                    continue;
                }
                let Some(chunk) = queue.pop_front() else {
                    break;
                };
                let request = WorkerRequest::AnalyzeChunk {
                    id: uuid::Uuid::new_v4().to_string(),
                    payload: ChunkJob {
                        chunk,
                        source: Arc::clone(&source),
                        sample_rate,
                        params: params.clone(),
                    },
                };
                let reply = unit.dispatch(request, false)?;
                *slot = Slot::Running(InFlight {
                    chunk,
                    deadline: self.options.chunk_timeout.map(|t| reply.dispatched_at() + t),
                    reply,
                });
            }

            let running = slots.iter().any(|s| matches!(s, Slot::Running(_)));
            if !running && queue.is_empty() {
                break;
            }

            let mut finished = Vec::new();
            match wait_any(&slots) {
                Event::Finished(index, outcome) => {
                    match std::mem::replace(&mut slots[index], Slot::Idle) {
                        Slot::Running(job) => finished.push((job.chunk.index, outcome)),
                        Slot::Draining(job) => self.drained(index, &job, outcome)?,
                        Slot::Idle => {}
                    }
                }
                Event::Expired => {
                    let now = Instant::now();
                    for slot in slots.iter_mut() {
                        let Slot::Running(job) = &*slot else {
                            continue;
                        };
                        if let Some(deadline) = job.deadline.filter(|d| *d <= now) {
                            let ms = deadline.duration_since(job.reply.dispatched_at()).as_millis();
                            let timeout = EngineError::Timeout {
                                operation: format!("chunk {}", job.chunk.index),
                                ms: ms as u64,
                            };
                            finished.push((job.chunk.index, Ok(Err(timeout))));
                            if let Slot::Running(job) = std::mem::replace(slot, Slot::Idle) {
                                *slot = Slot::Draining(job);
                            }
                        }
                    }
                }
            }

            for (chunk, outcome) in finished {
                match outcome {
                    Ok(Ok(JobOutput::Chunk(partial))) => partials.push(*partial),
                    Ok(Ok(other)) => {
                        log::warn!("Chunk {}: unexpected reply {:?}, skipping", chunk, other);
                        failed.push(chunk);
                    }
                    Ok(Err(e)) if e.is_unit_failure() => return Err(e),
                    Ok(Err(e)) => {
                        log::warn!("Chunk {} skipped: {}", chunk, e);
                        failed.push(chunk);
                    }
                    Err(RecvError) => {
                        return Err(EngineError::UnitCrashed(format!("chunk {chunk} was dropped")))
                    }
                }
                completed += 1;
                on_progress(StreamProgress {
                    percentage: completed as f32 / total as f32 * 100.0,
                    current_chunk: completed,
                    total_chunks: total,
                });
            }
        }

        let abandoned = slots.iter().filter(|s| matches!(s, Slot::Draining(_))).count();
        if abandoned > 0 {
            log::debug!("Leaving {} timed-out chunk(s) to finish in the background", abandoned);
        }

        partials.sort_by_key(|p| p.chunk.index);
        failed.sort_unstable();
        if !failed.is_empty() {
            log::warn!("{} of {} chunks skipped: {:?}", failed.len(), total, failed);
        }

        Ok(StreamOutcome {
            partials,
            failed_chunks: failed,
            total_chunks: total,
        })
    }

    /// A late reply for a timed-out chunk frees its unit again. Only a unit
    /// failure matters at this point.
    fn drained(
        &self,
        index: usize,
        job: &InFlight,
        outcome: std::result::Result<JobOutcome, RecvError>,
    ) -> Result<()> {
        let name = self.units[index].name();
        match outcome {
            Ok(Err(e)) if e.is_unit_failure() => Err(e),
            Err(RecvError) => Err(EngineError::UnitCrashed(format!(
                "{} dropped chunk {}",
                name, job.chunk.index
            ))),
            _ => {
                log::debug!("{}: late reply for chunk {} discarded", name, job.chunk.index);
                Ok(())
            }
        }
    }
}

/// Blocks until a running or draining chunk replies, or until the earliest
/// running deadline passes.
fn wait_any(slots: &[Slot]) -> Event {
    let live: Vec<(usize, &InFlight)> = slots
        .iter()
        .enumerate()
        .filter_map(|(i, s)| s.job().map(|job| (i, job)))
        .collect();
    let mut sel = Select::new();
    for (_, job) in &live {
        sel.recv(job.reply.completion_receiver());
    }

    let deadline = slots
        .iter()
        .filter_map(|s| match s {
            Slot::Running(job) => job.deadline,
            _ => None,
        })
        .min();
    let oper = match deadline {
        Some(d) => match sel.select_deadline(d) {
            Ok(oper) => oper,
            Err(_) => return Event::Expired,
        },
        None => sel.select(),
    };
    let (index, job) = live[oper.index()];
    Event::Finished(index, oper.recv(job.reply.completion_receiver()))
}
