use crossbeam_channel::{bounded, select, unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::backend::BackendFactory;
use crate::error::{EngineError, Result};
use crate::worker::correlation::{JobOutput, JobTable, PendingJob, PendingReply};
use crate::worker::protocol::{ErrorPayload, WorkerReply, WorkerRequest};
use crate::worker::unit::UnitThread;

#[derive(Debug, Clone, PartialEq)]
pub enum UnitHealth {
    Starting,
    Ready,
    Failed(String),
    Terminated,
}

type CrashHook = Box<dyn Fn(&str) + Send>;

/// A crash hook to run once the lock is released.
struct CrashNotice(CrashHook, String);

impl CrashNotice {
    fn deliver(self) {
        (self.0)(&self.1);
    }
}

struct Shared {
    table: JobTable,
    health: UnitHealth,
    crash_hook: Option<CrashHook>,
}

impl Shared {
    /// Marks the unit dead and fails everything still pending. The hook is
    /// handed back so the caller can run it without holding the lock.
    fn fail(&mut self, name: &str, message: String) -> Option<CrashNotice> {
        if matches!(self.health, UnitHealth::Failed(_) | UnitHealth::Terminated) {
            return None;
        }
        let flushed = self.table.flush_all(EngineError::UnitCrashed(message.clone()));
        log::error!("{}: unit failed ({}), flushed {} pending jobs", name, message, flushed);
        self.health = UnitHealth::Failed(message.clone());
        self.crash_hook.take().map(|hook| CrashNotice(hook, message))
    }
}

pub struct ComputeUnit {
    name: String,
    requests: Option<Sender<WorkerRequest>>,
    shared: Arc<Mutex<Shared>>,
    ready: Receiver<std::result::Result<(), ErrorPayload>>,
    stop: Sender<()>,
    worker: Option<JoinHandle<()>>,
    router: Option<JoinHandle<()>>,
}

impl ComputeUnit {
    /// Starts the unit and router threads. The backend is not loaded until
    /// [`initialize`](Self::initialize).
    pub fn spawn(name: impl Into<String>, factory: Arc<dyn BackendFactory>) -> Result<Self> {
        let name = name.into();
        let (req_tx, req_rx) = unbounded();
        let (rep_tx, rep_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let (stop_tx, stop_rx) = bounded(1);

        let shared = Arc::new(Mutex::new(Shared {
            table: JobTable::new(),
            health: UnitHealth::Starting,
            crash_hook: None,
        }));

        let unit = UnitThread {
            name: name.clone(),
            factory,
            requests: req_rx,
            replies: rep_tx,
        };
        let worker = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || unit.run())
            .map_err(|e| EngineError::Initialization(format!("failed to spawn {name}: {e}")))?;

        let router = {
            let name = name.clone();
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{name}-router"))
                .spawn(move || route(&name, rep_rx, stop_rx, ready_tx, &shared))
                .map_err(|e| EngineError::Initialization(format!("failed to spawn router: {e}")))?
        };

        log::debug!("{}: spawned", name);
        Ok(Self {
            name,
            requests: Some(req_tx),
            shared,
            ready: ready_rx,
            stop: stop_tx,
            worker: Some(worker),
            router: Some(router),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Called once with the failure message when the unit dies.
    pub fn on_crash(&self, hook: impl Fn(&str) + Send + 'static) {
        self.shared.lock().crash_hook = Some(Box::new(hook));
    }

    pub fn send_init(&self) -> Result<()> {
        self.send(WorkerRequest::Init)
    }

    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        match self.ready.recv_timeout(timeout) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(payload)) => Err(EngineError::Initialization(match payload.stage {
                Some(stage) => format!("{} (during {})", payload.error, stage),
                None => payload.error,
            })),
            Err(RecvTimeoutError::Timeout) => Err(EngineError::InitTimeout {
                ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(EngineError::Initialization(format!(
                "{} exited before reporting ready",
                self.name
            ))),
        }
    }

    pub fn initialize(&self, timeout: Duration) -> Result<()> {
        self.send_init()?;
        self.wait_ready(timeout)
    }

    pub fn dispatch(&self, request: WorkerRequest, observe_progress: bool) -> Result<PendingReply> {
        let id = request
            .id()
            .ok_or_else(|| EngineError::Protocol(format!("{} is not a job", request.kind())))?
            .to_string();

        let reply = {
            let mut shared = self.shared.lock();
            match &shared.health {
                UnitHealth::Failed(msg) => return Err(EngineError::UnitCrashed(msg.clone())),
                UnitHealth::Terminated => return Err(EngineError::UnitTerminated),
                UnitHealth::Starting | UnitHealth::Ready => {}
            }
            let (job, reply) = PendingJob::channel(id.clone(), observe_progress);
            shared.table.register(job)?;
            reply
        };

        log::debug!("{}: dispatching {} {}", self.name, request.kind(), id);
        if let Err(e) = self.send(request) {
            self.shared.lock().table.reject(&id, e.clone());
        }
        Ok(reply)
    }

    pub fn health(&self) -> UnitHealth {
        self.shared.lock().health.clone()
    }

    pub fn pending_jobs(&self) -> usize {
        self.shared.lock().table.len()
    }

    /// Stops the unit. Pending jobs fail with [`EngineError::UnitTerminated`].
    pub fn terminate(&mut self) {
        {
            let mut shared = self.shared.lock();
            if !matches!(shared.health, UnitHealth::Terminated) {
                let flushed = shared.table.flush_all(EngineError::UnitTerminated);
                if flushed > 0 {
                    log::info!("{}: terminated with {} pending jobs", self.name, flushed);
                }
                shared.health = UnitHealth::Terminated;
            }
        }

        // closing the request channel ends the unit loop after its current job
        self.requests.take();
        let _ = self.stop.try_send(());
        if let Some(router) = self.router.take() {
            if router.join().is_err() {
                log::warn!("{}: router thread panicked", self.name);
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                log::debug!("{}: detaching busy unit thread", self.name);
            }
        }
    }

    fn send(&self, request: WorkerRequest) -> Result<()> {
        let tx = self.requests.as_ref().ok_or(EngineError::UnitTerminated)?;
        tx.send(request)
            .map_err(|_| EngineError::UnitCrashed(format!("{} request channel closed", self.name)))
    }
}

impl Drop for ComputeUnit {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn route(
    name: &str,
    replies: Receiver<WorkerReply>,
    stop: Receiver<()>,
    ready: Sender<std::result::Result<(), ErrorPayload>>,
    shared: &Mutex<Shared>,
) {
    loop {
        select! {
            recv(replies) -> msg => match msg {
                Ok(reply) => {
                    if let Some(notice) = handle_reply(name, reply, &ready, shared) {
                        notice.deliver();
                    }
                }
                Err(_) => {
                    let notice = shared.lock().fail(name, "unit thread exited".into());
                    if let Some(notice) = notice {
                        notice.deliver();
                    }
                    break;
                }
            },
            recv(stop) -> _ => break,
        }
    }
    log::debug!("{}: router stopped", name);
}

fn handle_reply(
    name: &str,
    reply: WorkerReply,
    ready: &Sender<std::result::Result<(), ErrorPayload>>,
    shared: &Mutex<Shared>,
) -> Option<CrashNotice> {
    let mut shared = shared.lock();
    match reply {
        WorkerReply::WorkerReady => {
            if shared.health == UnitHealth::Starting {
                shared.health = UnitHealth::Ready;
            }
            let _ = ready.try_send(Ok(()));
        }
        WorkerReply::WorkerError { payload } => {
            if shared.health == UnitHealth::Starting {
                let _ = ready.try_send(Err(payload.clone()));
            }
            return shared.fail(name, payload.error);
        }
        WorkerReply::Progress { id, payload } => {
            shared.table.progress(&id, payload);
        }
        WorkerReply::AnalysisComplete { id, payload } => {
            shared.table.resolve(&id, JobOutput::Report(payload));
        }
        WorkerReply::ChunkComplete { id, payload } => {
            shared.table.resolve(&id, JobOutput::Chunk(payload));
        }
        WorkerReply::Result { id, payload } => {
            shared.table.resolve(&id, JobOutput::Value(payload));
        }
        WorkerReply::AnalysisError { id, payload } | WorkerReply::Error { id, payload } => {
            let error = EngineError::Job {
                id: id.clone(),
                stage: payload.stage,
                message: payload.error,
            };
            shared.table.reject(&id, error);
        }
    }
    None
}
