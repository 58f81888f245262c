pub mod capability;
pub mod status;

use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::features::{AggregatedResult, AnalysisParams, AnalysisReport, AnalysisRequest};
use crate::audio::predict::Prediction;
use crate::backend::BackendFactory;
use crate::error::{EngineError, Result};
use crate::pipeline::aggregate::merge_streaming_results;
use crate::pipeline::scheduler::{ChunkScheduler, StreamProgress, StreamingOptions};
use crate::worker::correlation::JobOutput;
use crate::worker::handle::ComputeUnit;
use crate::worker::protocol::{AudioJob, JobValue, ProgressPayload, WorkerRequest};

use capability::{CapabilityMode, DevicePolicy, DeviceProfile, Operation};
use status::{EngineState, EngineStatus, StatusManager};

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub units: usize,
    pub init_timeout: Duration,
    /// Deadline for whole-file, predict and reset jobs
    pub job_timeout: Option<Duration>,
    pub streaming: StreamingOptions,
    /// `analyze_auto` streams signals longer than this
    pub min_streaming_seconds: f32,
    pub params: AnalysisParams,
    pub policy: DevicePolicy,
    pub memory_gb: Option<f32>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            units: 1,
            init_timeout: Duration::from_secs(30),
            job_timeout: Some(Duration::from_secs(600)),
            streaming: StreamingOptions::default(),
            min_streaming_seconds: 60.0,
            params: AnalysisParams::default(),
            policy: DevicePolicy::default(),
            memory_gb: None,
        }
    }
}

pub struct AnalysisEngine {
    options: EngineOptions,
    factory: Arc<dyn BackendFactory>,
    status: Arc<StatusManager>,
    capability: CapabilityMode,
    units: Vec<ComputeUnit>,
    next_unit: AtomicUsize,
}

impl AnalysisEngine {
    /// Spawns the units without loading anything. The engine stays
    /// `Initializing` until [`initialize`](Self::initialize).
    pub fn new(options: EngineOptions, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let profile = DeviceProfile::detect(options.memory_gb);
        let capability = options.policy.evaluate(&profile);
        let count = options.units.max(1);
        if !capability.allows(Operation::AnalyzeStreaming, count) {
            log::warn!(
                "{:?} mode: streaming is unavailable with {} units",
                capability,
                count
            );
        }

        let status = Arc::new(StatusManager::new());
        let units = (0..count)
            .map(|i| {
                let unit = ComputeUnit::spawn(format!("unit-{i}"), Arc::clone(&factory))?;
                let status = Arc::clone(&status);
                let name = unit.name().to_string();
                unit.on_crash(move |msg| {
                    status.fail(format!("{name} crashed: {msg}"));
                });
                Ok(unit)
            })
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Engine created: {} unit(s), {} cores, {:?} mode",
            units.len(),
            profile.cores,
            capability
        );

        Ok(Self {
            options,
            factory,
            status,
            capability,
            units,
            next_unit: AtomicUsize::new(0),
        })
    }

    pub fn start(options: EngineOptions, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let engine = Self::new(options, factory)?;
        engine.initialize()?;
        Ok(engine)
    }

    /// Loads every unit's backend and waits for all of them to be ready.
    /// Any failure or timeout moves the engine to `Error`.
    pub fn initialize(&self) -> Result<()> {
        match self.status.state() {
            EngineState::Initializing => {}
            EngineState::Ready => return Ok(()),
            state => return Err(EngineError::NotReady(state)),
        }
        self.status
            .transition(EngineState::Loading, "loading backend assets")?;

        let started = Instant::now();
        let deadline = started + self.options.init_timeout;
        let result = self
            .units
            .iter()
            .try_for_each(|unit| unit.send_init())
            .and_then(|()| {
                self.units.iter().try_for_each(|unit| {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    unit.wait_ready(remaining).map_err(|e| match e {
                        EngineError::InitTimeout { .. } => EngineError::InitTimeout {
                            ms: self.options.init_timeout.as_millis() as u64,
                        },
                        other => other,
                    })
                })
            });

        match result {
            Ok(()) => {
                self.status.transition(
                    EngineState::Ready,
                    format!("{} unit(s) ready in {:.1?}", self.units.len(), started.elapsed()),
                )?;
                Ok(())
            }
            Err(e) => {
                self.status.fail(e.to_string());
                Err(e)
            }
        }
    }

    pub fn status(&self) -> EngineStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> Receiver<EngineStatus> {
        self.status.subscribe()
    }

    pub fn capability(&self) -> CapabilityMode {
        self.capability
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    fn ensure(&self, op: Operation) -> Result<()> {
        let state = self.status.state();
        if state != EngineState::Ready {
            return Err(EngineError::NotReady(state));
        }
        self.capability.check(op, self.units.len())
    }

    fn pick_unit(&self) -> Result<&ComputeUnit> {
        let n = self.next_unit.fetch_add(1, Ordering::Relaxed);
        self.units
            .get(n % self.units.len().max(1))
            .ok_or_else(|| EngineError::Validation("engine has no compute units".into()))
    }

    pub fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisReport> {
        self.analyze_with_progress(request, |_| {})
    }

    pub fn analyze_with_progress(
        &self,
        request: AnalysisRequest,
        on_progress: impl FnMut(ProgressPayload),
    ) -> Result<AnalysisReport> {
        self.ensure(Operation::Analyze)?;
        request.validate()?;

        let unit = self.pick_unit()?;
        log::info!(
            "Analyzing {} ({:.1}s) on {}",
            request.request_id,
            request.duration_seconds,
            unit.name()
        );
        let reply = unit.dispatch(
            WorkerRequest::AnalyzeAudio {
                id: request.request_id,
                payload: AudioJob {
                    samples: request.samples,
                    sample_rate: request.sample_rate,
                    channels: request.channels,
                    params: request.params,
                },
            },
            true,
        )?;

        match reply.wait_with_progress(self.options.job_timeout, on_progress)? {
            JobOutput::Report(report) => Ok(*report),
            other => Err(unexpected(other)),
        }
    }

    /// Chunked analysis. Chunks that fail or time out are skipped; the run
    /// fails if a unit dies or no chunk succeeds.
    pub fn analyze_streaming(
        &self,
        request: AnalysisRequest,
        mut on_progress: impl FnMut(StreamProgress),
    ) -> Result<AnalysisReport> {
        self.ensure(Operation::AnalyzeStreaming)?;
        request.validate()?;

        let AnalysisRequest {
            request_id,
            samples,
            sample_rate,
            channels,
            duration_seconds,
            params,
        } = request;
        let source: Arc<[f32]> = samples.into();

        let outcome = ChunkScheduler::new(&self.units, self.options.streaming.clone()).run(
            source,
            sample_rate,
            &params,
            &mut on_progress,
        )?;

        if outcome.partials.is_empty() {
            return Err(EngineError::Job {
                id: request_id,
                stage: Some("streaming".into()),
                message: format!("all {} chunks failed", outcome.total_chunks),
            });
        }
        log::info!(
            "Merging {} of {} chunks for {}",
            outcome.partials.len(),
            outcome.total_chunks,
            request_id
        );

        let result = merge_streaming_results(&outcome.partials);
        Ok(AnalysisReport::new(result, duration_seconds, sample_rate, channels))
    }

    /// Whether [`analyze_auto`](Self::analyze_auto) would stream this request.
    pub fn streams(&self, request: &AnalysisRequest) -> bool {
        request.duration_seconds > self.options.min_streaming_seconds
            && self
                .capability
                .allows(Operation::AnalyzeStreaming, self.units.len())
    }

    /// Streams long signals, analyzes short ones in one pass. Progress is
    /// reported as a percentage either way.
    pub fn analyze_auto(
        &self,
        request: AnalysisRequest,
        mut on_progress: impl FnMut(f32),
    ) -> Result<AnalysisReport> {
        if self.streams(&request) {
            self.analyze_streaming(request, |p| on_progress(p.percentage))
        } else {
            self.analyze_with_progress(request, |p| on_progress(p.percentage))
        }
    }

    pub fn predict(&self, analysis: &AggregatedResult) -> Result<Prediction> {
        self.ensure(Operation::Predict)?;
        let reply = self.pick_unit()?.dispatch(
            WorkerRequest::Predict {
                id: uuid::Uuid::new_v4().to_string(),
                payload: analysis.clone(),
            },
            false,
        )?;
        match self.wait(reply)? {
            JobOutput::Value(JobValue::Prediction(prediction)) => Ok(prediction),
            other => Err(unexpected(other)),
        }
    }

    pub fn reset(&self) -> Result<usize> {
        self.ensure(Operation::Reset)?;
        let replies = self
            .units
            .iter()
            .map(|unit| {
                unit.dispatch(
                    WorkerRequest::Reset {
                        id: uuid::Uuid::new_v4().to_string(),
                    },
                    false,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let mut released = 0;
        for reply in replies {
            match self.wait(reply)? {
                JobOutput::Value(JobValue::Reset { released_handles }) => {
                    released += released_handles
                }
                other => return Err(unexpected(other)),
            }
        }
        Ok(released)
    }

    fn wait(&self, reply: crate::worker::correlation::PendingReply) -> Result<JobOutput> {
        match self.options.job_timeout {
            Some(t) => reply.wait_timeout(t),
            None => reply.wait(),
        }
    }

    pub fn shutdown(mut self) {
        self.terminate_units();
    }

    fn terminate_units(&mut self) {
        for unit in &mut self.units {
            unit.terminate();
        }
        log::info!("Engine shut down ({} unit(s))", self.units.len());
        self.units.clear();
    }

    pub fn restart(self) -> Result<Self> {
        let options = self.options.clone();
        let factory = Arc::clone(&self.factory);
        self.shutdown();
        log::info!("Restarting engine");
        Self::start(options, factory)
    }
}

impl Drop for AnalysisEngine {
    fn drop(&mut self) {
        if !self.units.is_empty() {
            self.terminate_units();
        }
    }
}

fn unexpected(output: JobOutput) -> EngineError {
    EngineError::Protocol(format!("unexpected job output: {output:?}"))
}
