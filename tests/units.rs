mod support;

use cadence::worker::correlation::{JobOutput, JobTable, PendingJob};
use cadence::worker::handle::{ComputeUnit, UnitHealth};
use cadence::worker::protocol::{AudioJob, JobValue, ProgressPayload, WorkerRequest};
use cadence::EngineError;
use crossbeam_channel::unbounded;
use std::sync::Arc;
use std::time::Duration;
use support::*;

fn audio_job(id: &str, samples: Vec<f32>) -> WorkerRequest {
    WorkerRequest::AnalyzeAudio {
        id: id.into(),
        payload: AudioJob {
            samples,
            sample_rate: SAMPLE_RATE,
            channels: 1,
            params: params(),
        },
    }
}

#[test]
fn crash_rejects_every_pending_job() {
    let (factory, faults) = FlakyFactory::new(512);
    let unit = ComputeUnit::spawn("crashy", Arc::new(factory)).unwrap();
    let (crash_tx, crash_rx) = unbounded();
    unit.on_crash(move |msg| {
        let _ = crash_tx.send(msg.to_string());
    });
    unit.initialize(Duration::from_secs(10)).unwrap();

    let mut poisoned = tone(1.0);
    poisoned[0] = PANIC_SENTINEL;
    let mut replies = vec![unit.dispatch(audio_job("job-0", poisoned), false).unwrap()];
    faults.wait_entered();
    for i in 1..4 {
        replies.push(unit.dispatch(audio_job(&format!("job-{i}"), tone(1.0)), false).unwrap());
    }
    assert_eq!(unit.pending_jobs(), 4);

    faults.release();
    for reply in replies {
        let id = reply.id().to_string();
        match reply.wait() {
            Err(EngineError::UnitCrashed(_)) => {}
            other => panic!("{id}: expected a crash, got {other:?}"),
        }
    }

    assert_eq!(unit.pending_jobs(), 0);
    assert!(matches!(unit.health(), UnitHealth::Failed(_)));
    let message = crash_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(message.contains("injected backend fault"));

    assert!(matches!(
        unit.dispatch(audio_job("late", tone(1.0)), false),
        Err(EngineError::UnitCrashed(_))
    ));
}

#[test]
fn terminate_rejects_pending_jobs() {
    let (factory, faults) = FlakyFactory::new(512);
    let mut unit = ComputeUnit::spawn("doomed", Arc::new(factory)).unwrap();
    unit.initialize(Duration::from_secs(10)).unwrap();

    let mut poisoned = tone(1.0);
    poisoned[0] = PANIC_SENTINEL;
    let busy = unit.dispatch(audio_job("busy", poisoned), false).unwrap();
    faults.wait_entered();
    let queued = unit.dispatch(audio_job("queued", tone(1.0)), false).unwrap();

    unit.terminate();
    assert_eq!(busy.wait().unwrap_err(), EngineError::UnitTerminated);
    assert_eq!(queued.wait().unwrap_err(), EngineError::UnitTerminated);
    assert_eq!(unit.health(), UnitHealth::Terminated);
    faults.release();
}

#[test]
fn replies_for_unknown_ids_are_ignored() {
    let mut table = JobTable::new();
    let (job, reply) = PendingJob::channel("known", true);
    table.register(job).unwrap();

    let value = JobOutput::Value(JobValue::Reset { released_handles: 3 });
    assert!(!table.resolve("stranger", value.clone()));
    assert!(!table.reject("stranger", EngineError::UnitTerminated));
    assert!(!table.progress(
        "stranger",
        ProgressPayload {
            stage: "frames".into(),
            percentage: 10.0,
            progress: 0.1,
            current_step: "frames".into(),
            completed_steps: Vec::new(),
        }
    ));
    assert!(table.contains("known"));
    assert_eq!(table.len(), 1);

    assert!(table.resolve("known", value));
    assert!(table.is_empty());
    match reply.wait() {
        Ok(JobOutput::Value(JobValue::Reset { released_handles })) => {
            assert_eq!(released_handles, 3)
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn timed_out_wait_leaves_the_job_registered() {
    let mut table = JobTable::new();
    let (job, reply) = PendingJob::channel("slow", false);
    table.register(job).unwrap();

    let err = reply.wait_timeout(Duration::from_millis(20)).unwrap_err();
    assert!(matches!(err, EngineError::Timeout { ms: 20, .. }));
    assert!(table.contains("slow"));

    // a late completion is still delivered to whoever waits next
    assert!(table.reject("slow", EngineError::UnitTerminated));
    assert_eq!(reply.wait().unwrap_err(), EngineError::UnitTerminated);
}
