use crossbeam_channel::{Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::audio::analysis::analyze_segment;
use crate::audio::features::{AnalysisParams, AnalysisReport, PartialResult};
use crate::audio::predict::predict;
use crate::backend::{Backend, BackendError, BackendFactory};
use crate::pipeline::aggregate::merge_streaming_results;
use crate::pipeline::chunking::ChunkDescriptor;
use crate::worker::protocol::{
    AudioJob, ChunkJob, ErrorPayload, JobValue, ProgressPayload, WorkerReply, WorkerRequest,
};

/// Share of the whole-file progress bar spent in the frame pass
const FRAME_PASS_SHARE: f32 = 90.0;

pub(crate) struct UnitThread {
    pub name: String,
    pub factory: Arc<dyn BackendFactory>,
    pub requests: Receiver<WorkerRequest>,
    pub replies: Sender<WorkerReply>,
}

impl UnitThread {
    /// Serves requests until the request channel closes, the backend fails to
    /// start, or a job panics.
    pub fn run(self) {
        let mut backend: Option<Box<dyn Backend>> = None;

        for request in self.requests.iter() {
            log::trace!("{} <- {}", self.name, request.kind());
            if let WorkerRequest::Init = request {
                if backend.is_some() {
                    self.send(WorkerReply::WorkerReady);
                    continue;
                }
                match self.start_backend() {
                    Ok(b) => {
                        log::info!("{}: {} backend ready", self.name, b.name());
                        backend = Some(b);
                        self.send(WorkerReply::WorkerReady);
                    }
                    Err(payload) => {
                        log::error!("{}: backend failed to start: {}", self.name, payload.error);
                        self.send(WorkerReply::WorkerError { payload });
                        return;
                    }
                }
                continue;
            }

            let Some(b) = backend.as_deref() else {
                self.send(not_initialized(request));
                continue;
            };

            let kind = request.kind();
            match panic::catch_unwind(AssertUnwindSafe(|| self.handle_job(b, request))) {
                Ok(reply) => self.send(reply),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    log::error!("{}: {} job panicked: {}", self.name, kind, message);
                    self.send(WorkerReply::WorkerError {
                        payload: ErrorPayload::new(format!("job panicked: {message}")).at(kind),
                    });
                    return;
                }
            }

            let leaked = b.live_handles();
            if leaked > 0 {
                log::warn!(
                    "{}: {} job leaked {} backend handles, releasing",
                    self.name,
                    kind,
                    leaked
                );
                b.release_all();
            }
        }
        log::debug!("{}: request channel closed, exiting", self.name);
    }

    /// Both startup phases: asset load, then runtime warm-up.
    fn start_backend(&self) -> Result<Box<dyn Backend>, ErrorPayload> {
        let started = panic::catch_unwind(AssertUnwindSafe(|| {
            let backend = self
                .factory
                .load()
                .map_err(|e| ErrorPayload::new(e.to_string()).at("load"))?;
            backend
                .warm_up()
                .map_err(|e| ErrorPayload::new(e.to_string()).at("warm_up"))?;
            Ok(backend)
        }));
        started.unwrap_or_else(|panic| {
            Err(ErrorPayload::new(format!(
                "backend startup panicked: {}",
                panic_message(panic.as_ref())
            ))
            .at("load"))
        })
    }

    fn handle_job(&self, backend: &dyn Backend, request: WorkerRequest) -> WorkerReply {
        match request {
            WorkerRequest::Init => WorkerReply::WorkerReady,
            WorkerRequest::AnalyzeAudio { id, payload } => self.analyze_audio(backend, id, payload),
            WorkerRequest::AnalyzeChunk { id, payload } => analyze_chunk(backend, id, payload),
            WorkerRequest::Predict { id, payload } => match predict(&payload) {
                Ok(prediction) => WorkerReply::Result {
                    id,
                    payload: JobValue::Prediction(prediction),
                },
                Err(e) => WorkerReply::Error {
                    id,
                    payload: ErrorPayload::new(e.to_string()).at("predict"),
                },
            },
            WorkerRequest::Reset { id } => {
                let released = backend.release_all();
                log::info!("{}: reset released {} handles", self.name, released);
                WorkerReply::Result {
                    id,
                    payload: JobValue::Reset {
                        released_handles: released,
                    },
                }
            }
        }
    }

    fn analyze_audio(&self, backend: &dyn Backend, id: String, job: AudioJob) -> WorkerReply {
        if let Err(e) = job.params.validate() {
            return analysis_error(id, e.to_string(), "validation");
        }

        let chunk = ChunkDescriptor::whole(job.samples.len(), job.sample_rate);
        let mut completed: Vec<String> = Vec::new();
        let mut stage = String::new();

        let outcome = {
            let mut on_progress = |s: &str, fraction: f32| {
                if s != stage {
                    let finished = std::mem::replace(&mut stage, s.to_string());
                    if !finished.is_empty() {
                        completed.push(finished);
                    }
                }
                let percentage = match s {
                    "frames" => fraction * FRAME_PASS_SHARE,
                    _ => FRAME_PASS_SHARE + fraction * (100.0 - FRAME_PASS_SHARE),
                };
                self.send(WorkerReply::Progress {
                    id: id.clone(),
                    payload: ProgressPayload {
                        stage: s.to_string(),
                        percentage,
                        progress: percentage / 100.0,
                        current_step: s.to_string(),
                        completed_steps: completed.clone(),
                    },
                });
            };
            run_segment(backend, &job.samples, job.sample_rate, chunk, &job.params, &mut on_progress)
        };

        match outcome {
            Ok(partial) => {
                let result = merge_streaming_results(std::slice::from_ref(&partial));
                let duration = job.samples.len() as f32 / job.sample_rate as f32;
                WorkerReply::AnalysisComplete {
                    id,
                    payload: Box::new(AnalysisReport::new(
                        result,
                        duration,
                        job.sample_rate,
                        job.channels,
                    )),
                }
            }
            Err(e) if stage.is_empty() => analysis_error(id, e.to_string(), "setup"),
            Err(e) => analysis_error(id, e.to_string(), &stage),
        }
    }

    fn send(&self, reply: WorkerReply) {
        log::trace!("{} -> {}", self.name, reply.kind());
        if self.replies.send(reply).is_err() {
            log::debug!("{}: reply channel closed", self.name);
        }
    }
}

fn analyze_chunk(backend: &dyn Backend, id: String, job: ChunkJob) -> WorkerReply {
    let stage = format!("chunk {}", job.chunk.index);
    match run_segment(
        backend,
        job.samples(),
        job.sample_rate,
        job.chunk,
        &job.params,
        &mut |_, _| {},
    ) {
        Ok(partial) => WorkerReply::ChunkComplete {
            id,
            payload: Box::new(partial),
        },
        Err(e) => analysis_error(id, e.to_string(), &stage),
    }
}

/// Segment analysis with the requested-features filter applied.
fn run_segment(
    backend: &dyn Backend,
    samples: &[f32],
    sample_rate: u32,
    chunk: ChunkDescriptor,
    params: &AnalysisParams,
    progress: &mut dyn FnMut(&str, f32),
) -> Result<PartialResult, BackendError> {
    let mut partial = analyze_segment(backend, samples, sample_rate, chunk, params, progress)?;
    partial.retain(params.features);
    Ok(partial)
}

fn analysis_error(id: String, error: String, stage: &str) -> WorkerReply {
    WorkerReply::AnalysisError {
        id,
        payload: ErrorPayload::new(error).at(stage),
    }
}

fn not_initialized(request: WorkerRequest) -> WorkerReply {
    let payload = ErrorPayload::new("unit is not initialized");
    match request {
        WorkerRequest::AnalyzeAudio { id, .. } | WorkerRequest::AnalyzeChunk { id, .. } => {
            WorkerReply::AnalysisError { id, payload }
        }
        WorkerRequest::Predict { id, .. } | WorkerRequest::Reset { id } => {
            WorkerReply::Error { id, payload }
        }
        WorkerRequest::Init => WorkerReply::WorkerError { payload },
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::features::FeatureSet;
    use crate::backend::NativeFactory;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn spawn() -> (Sender<WorkerRequest>, Receiver<WorkerReply>) {
        let (req_tx, req_rx) = unbounded();
        let (rep_tx, rep_rx) = unbounded();
        let unit = UnitThread {
            name: "test-unit".into(),
            factory: Arc::new(NativeFactory::new(1024)),
            requests: req_rx,
            replies: rep_tx,
        };
        std::thread::spawn(move || unit.run());
        (req_tx, rep_rx)
    }

    fn recv(rx: &Receiver<WorkerReply>) -> WorkerReply {
        rx.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    #[test]
    fn jobs_before_init_get_an_error_reply() {
        let (tx, rx) = spawn();
        tx.send(WorkerRequest::Reset { id: "r".into() }).unwrap();
        match recv(&rx) {
            WorkerReply::Error { id, payload } => {
                assert_eq!(id, "r");
                assert!(payload.error.contains("not initialized"));
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[test]
    fn whole_file_job_reports_progress_then_completes() {
        let (tx, rx) = spawn();
        tx.send(WorkerRequest::Init).unwrap();
        assert!(matches!(recv(&rx), WorkerReply::WorkerReady));

        let samples: Vec<f32> = (0..16_000)
            .map(|i| (i as f32 * 0.3).sin() * 0.4)
            .collect();
        tx.send(WorkerRequest::AnalyzeAudio {
            id: "a1".into(),
            payload: AudioJob {
                samples,
                sample_rate: 8000,
                channels: 2,
                params: AnalysisParams {
                    frame_size: 1024,
                    hop_size: 512,
                    mfcc_coefficients: 13,
                    features: FeatureSet::all(),
                },
            },
        })
        .unwrap();

        let mut last = -1.0;
        loop {
            match recv(&rx) {
                WorkerReply::Progress { id, payload } => {
                    assert_eq!(id, "a1");
                    assert!(payload.percentage >= last);
                    last = payload.percentage;
                }
                WorkerReply::AnalysisComplete { id, payload } => {
                    assert_eq!(id, "a1");
                    assert_eq!(payload.channels, 2);
                    assert!((payload.duration - 2.0).abs() < 1e-6);
                    assert!(payload.result.spectral.is_some());
                    break;
                }
                other => panic!("unexpected {}", other.kind()),
            }
        }
        assert_eq!(last, 100.0);
    }

    #[test]
    fn reset_reports_released_handles() {
        let (tx, rx) = spawn();
        tx.send(WorkerRequest::Init).unwrap();
        recv(&rx);
        tx.send(WorkerRequest::Reset { id: "z".into() }).unwrap();
        match recv(&rx) {
            WorkerReply::Result { id, payload } => {
                assert_eq!(id, "z");
                assert_eq!(payload, JobValue::Reset { released_handles: 0 });
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }
}
