use crossbeam_channel::{select, unbounded, Receiver, RecvTimeoutError, Sender};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::audio::features::{AnalysisReport, PartialResult};
use crate::error::{EngineError, Result};
use crate::worker::protocol::{JobValue, ProgressPayload};

#[derive(Debug, Clone)]
pub enum JobOutput {
    Report(Box<AnalysisReport>),
    Chunk(Box<PartialResult>),
    Value(JobValue),
}

pub type JobOutcome = std::result::Result<JobOutput, EngineError>;

pub struct PendingJob {
    pub request_id: String,
    completion: Sender<JobOutcome>,
    progress: Option<Sender<ProgressPayload>>,
    pub dispatched_at: Instant,
}

impl PendingJob {
    pub fn channel(request_id: impl Into<String>, observe_progress: bool) -> (Self, PendingReply) {
        let request_id = request_id.into();
        let (completion_tx, completion_rx) = crossbeam_channel::bounded(1);
        let (progress_tx, progress_rx) = if observe_progress {
            let (tx, rx) = unbounded();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let dispatched_at = Instant::now();
        let job = Self {
            request_id: request_id.clone(),
            completion: completion_tx,
            progress: progress_tx,
            dispatched_at,
        };
        let reply = PendingReply {
            request_id,
            completion: completion_rx,
            progress: progress_rx,
            dispatched_at,
        };
        (job, reply)
    }

    fn complete(self, outcome: JobOutcome) {
        // the caller may have stopped waiting
        if self.completion.send(outcome).is_err() {
            log::debug!("Reply for {} arrived after its caller left", self.request_id);
        }
    }
}

pub struct PendingReply {
    request_id: String,
    completion: Receiver<JobOutcome>,
    progress: Option<Receiver<ProgressPayload>>,
    dispatched_at: Instant,
}

impl PendingReply {
    pub fn id(&self) -> &str {
        &self.request_id
    }

    pub fn dispatched_at(&self) -> Instant {
        self.dispatched_at
    }

    pub fn completion_receiver(&self) -> &Receiver<JobOutcome> {
        &self.completion
    }

    pub fn wait(self) -> JobOutcome {
        self.completion.recv().unwrap_or_else(|_| Err(self.lost()))
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`. The job stays
    /// registered; a late reply is discarded.
    pub fn wait_timeout(&self, timeout: Duration) -> JobOutcome {
        match self.completion.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => Err(EngineError::Timeout {
                operation: format!("job {}", self.request_id),
                ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(self.lost()),
        }
    }

    /// Waits for completion, forwarding progress payloads to `on_progress` in
    /// arrival order. Every payload sent before completion is delivered.
    pub fn wait_with_progress(
        self,
        timeout: Option<Duration>,
        mut on_progress: impl FnMut(ProgressPayload),
    ) -> JobOutcome {
        let Some(progress) = self.progress.clone() else {
            return match timeout {
                Some(t) => self.wait_timeout(t),
                None => self.wait(),
            };
        };
        let deadline = timeout.map(|t| Instant::now() + t);
        let never = crossbeam_channel::never();

        loop {
            let timer = match deadline {
                Some(d) => crossbeam_channel::at(d),
                None => never.clone(),
            };
            select! {
                recv(progress) -> msg => {
                    if let Ok(payload) = msg {
                        on_progress(payload);
                    }
                }
                recv(self.completion) -> msg => {
                    progress.try_iter().for_each(&mut on_progress);
                    return msg.unwrap_or_else(|_| Err(self.lost()));
                }
                recv(timer) -> _ => {
                    return Err(EngineError::Timeout {
                        operation: format!("job {}", self.request_id),
                        ms: timeout.map_or(0, |t| t.as_millis() as u64),
                    });
                }
            }
        }
    }

    fn lost(&self) -> EngineError {
        EngineError::UnitCrashed(format!("reply channel for {} closed", self.request_id))
    }
}

/// Pending jobs keyed by request id. Each entry is removed exactly once.
#[derive(Default)]
pub struct JobTable {
    pending: HashMap<String, PendingJob>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, job: PendingJob) -> Result<()> {
        if self.pending.contains_key(&job.request_id) {
            return Err(EngineError::Validation(format!(
                "request id {} is already pending",
                job.request_id
            )));
        }
        self.pending.insert(job.request_id.clone(), job);
        Ok(())
    }

    pub fn resolve(&mut self, id: &str, output: JobOutput) -> bool {
        self.complete(id, Ok(output))
    }

    pub fn reject(&mut self, id: &str, error: EngineError) -> bool {
        self.complete(id, Err(error))
    }

    fn complete(&mut self, id: &str, outcome: JobOutcome) -> bool {
        match self.pending.remove(id) {
            Some(job) => {
                log::debug!(
                    "Job {} completed after {:.1?}",
                    id,
                    job.dispatched_at.elapsed()
                );
                job.complete(outcome);
                true
            }
            None => {
                log::warn!("Dropping reply for unknown request id {}", id);
                false
            }
        }
    }

    pub fn progress(&self, id: &str, payload: ProgressPayload) -> bool {
        match self.pending.get(id) {
            Some(job) => {
                if let Some(tx) = &job.progress {
                    let _ = tx.send(payload);
                }
                true
            }
            None => {
                log::warn!("Dropping progress for unknown request id {}", id);
                false
            }
        }
    }

    /// Rejects every pending job with `error`. Returns how many were flushed.
    pub fn flush_all(&mut self, error: EngineError) -> usize {
        let count = self.pending.len();
        for (_, job) in self.pending.drain() {
            job.complete(Err(error.clone()));
        }
        count
    }

    pub fn contains(&self, id: &str) -> bool {
        self.pending.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
