mod support;

use cadence::pipeline::scheduler::ChunkScheduler;
use cadence::worker::handle::{ComputeUnit, UnitHealth};
use cadence::{
    AnalysisEngine, AnalysisRequest, EngineError, EngineOptions, EngineState, NativeFactory,
    StreamingOptions,
};
use std::sync::Arc;
use std::time::Duration;
use support::*;

/// 2 s chunks with 0.5 s overlap: chunk `n` starts at `n * 6000` samples
fn streaming() -> StreamingOptions {
    StreamingOptions {
        chunk_seconds: 2.0,
        overlap_seconds: 0.5,
        chunk_timeout: Some(Duration::from_secs(30)),
    }
}

fn options(units: usize) -> EngineOptions {
    EngineOptions {
        units,
        params: params(),
        streaming: streaming(),
        init_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

fn ready_units(n: usize, factory: Arc<dyn cadence::BackendFactory>) -> Vec<ComputeUnit> {
    (0..n)
        .map(|i| {
            let unit = ComputeUnit::spawn(format!("stream-{i}"), Arc::clone(&factory)).unwrap();
            unit.initialize(Duration::from_secs(10)).unwrap();
            unit
        })
        .collect()
}

#[test]
fn failing_chunk_is_skipped_and_the_rest_merge() {
    let (factory, _faults) = FlakyFactory::new(512);
    let units = ready_units(2, Arc::new(factory));

    // The first frame of chunk 1 fails; no frame of chunk 0 starts there
    // since 6000 is not a multiple of the hop.
    let mut samples = tone(10.0);
    samples[6000] = ERROR_SENTINEL;

    let mut seen = Vec::new();
    let outcome = ChunkScheduler::new(&units, streaming())
        .run(samples.into(), SAMPLE_RATE, &params(), &mut |p| seen.push(p))
        .unwrap();

    assert_eq!(outcome.total_chunks, 7);
    assert_eq!(outcome.failed_chunks, vec![1]);
    let indices: Vec<usize> = outcome.partials.iter().map(|p| p.chunk.index).collect();
    assert_eq!(indices, vec![0, 2, 3, 4, 5, 6]);
    assert_eq!(seen.len(), 7);
    assert_eq!(seen.last().map(|p| p.current_chunk), Some(7));
    assert!(units.iter().all(|u| u.health() == UnitHealth::Ready));
}

#[test]
fn timed_out_chunk_holds_its_unit_until_the_late_reply() {
    let (factory, _faults) = FlakyFactory::new(512);
    let units = ready_units(1, Arc::new(factory));

    let mut samples = tone(10.0);
    samples[6000] = SLOW_SENTINEL;
    let options = StreamingOptions {
        chunk_timeout: Some(Duration::from_secs(1)),
        ..streaming()
    };

    let mut most_pending = 0;
    let outcome = ChunkScheduler::new(&units, options)
        .run(samples.into(), SAMPLE_RATE, &params(), &mut |_| {
            most_pending = most_pending.max(units[0].pending_jobs());
        })
        .unwrap();

    // only the stalled chunk is lost; its successors get a free unit
    assert_eq!(outcome.total_chunks, 7);
    assert_eq!(outcome.failed_chunks, vec![1]);
    let indices: Vec<usize> = outcome.partials.iter().map(|p| p.chunk.index).collect();
    assert_eq!(indices, vec![0, 2, 3, 4, 5, 6]);
    assert!(most_pending <= 1, "{most_pending} jobs queued on one unit");
    assert_eq!(units[0].health(), UnitHealth::Ready);
}

#[test]
fn streaming_report_covers_the_signal_with_monotonic_progress() {
    let engine = AnalysisEngine::start(options(3), Arc::new(NativeFactory::new(512))).unwrap();
    let request = AnalysisRequest::new(tone(10.0), SAMPLE_RATE, params()).with_channels(2);

    let mut percentages = Vec::new();
    let report = engine
        .analyze_streaming(request, |p| percentages.push(p.percentage))
        .unwrap();

    assert_eq!(percentages.len(), 7);
    assert!(percentages.windows(2).all(|w| w[0] <= w[1]));
    assert!((percentages[6] - 100.0).abs() < 1e-4);

    assert!((report.duration - 10.0).abs() < 1e-4);
    assert_eq!(report.channels, 2);
    assert!(report.result.spectral.is_some());
    assert!(report.result.key.is_some());
    let melody = report.result.melody.as_ref().unwrap();
    assert!(melody.points.windows(2).all(|w| w[0].time <= w[1].time));
}

#[test]
fn auto_mode_streams_only_long_signals() {
    let opts = EngineOptions {
        min_streaming_seconds: 5.0,
        ..options(1)
    };
    let engine = AnalysisEngine::start(opts, Arc::new(NativeFactory::new(512))).unwrap();

    let mut long_steps = 0;
    let long = engine
        .analyze_auto(AnalysisRequest::new(tone(8.0), SAMPLE_RATE, params()), |_| {
            long_steps += 1
        })
        .unwrap();
    // ceil((8 - 0.5) / 1.5) chunks
    assert_eq!(long_steps, 5);
    assert!((long.duration - 8.0).abs() < 1e-4);

    let mut short_last = 0.0;
    engine
        .analyze_auto(AnalysisRequest::new(tone(3.0), SAMPLE_RATE, params()), |p| {
            short_last = p
        })
        .unwrap();
    assert_eq!(short_last, 100.0);
}

#[test]
fn unit_crash_aborts_the_stream() {
    let (factory, faults) = FlakyFactory::new(512);
    let engine = AnalysisEngine::start(options(1), Arc::new(factory)).unwrap();

    let mut samples = tone(10.0);
    samples[6000] = PANIC_SENTINEL;
    let request = AnalysisRequest::new(samples, SAMPLE_RATE, params());

    let err = std::thread::scope(|s| {
        let job = s.spawn(|| engine.analyze_streaming(request, |_| {}));
        faults.wait_entered();
        faults.release();
        job.join().unwrap().unwrap_err()
    });
    assert!(matches!(err, EngineError::UnitCrashed(_)));
    assert_eq!(engine.status().state, EngineState::Error);
}

#[test]
fn every_chunk_failing_is_an_error() {
    let (factory, _faults) = FlakyFactory::new(512);
    let engine = AnalysisEngine::start(options(2), Arc::new(factory)).unwrap();

    let mut samples = tone(5.0);
    for start in (0..samples.len()).step_by(6000) {
        samples[start] = ERROR_SENTINEL;
    }
    let err = engine
        .analyze_streaming(AnalysisRequest::new(samples, SAMPLE_RATE, params()), |_| {})
        .unwrap_err();
    match err {
        EngineError::Job { stage, message, .. } => {
            assert_eq!(stage.as_deref(), Some("streaming"));
            assert!(message.contains("all 3 chunks failed"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(engine.status().state, EngineState::Ready);
}
