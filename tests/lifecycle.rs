mod support;

use cadence::engine::capability::{CapabilityMode, DevicePolicy, Operation};
use cadence::{
    AggregatedResult, AnalysisEngine, AnalysisRequest, EngineError, EngineOptions, EngineState,
    NativeFactory,
};
use std::sync::Arc;
use std::time::Duration;
use support::*;

fn options() -> EngineOptions {
    EngineOptions {
        params: params(),
        init_timeout: Duration::from_secs(10),
        ..Default::default()
    }
}

#[test]
fn status_moves_forward_through_loading_to_ready() {
    let engine = AnalysisEngine::new(options(), Arc::new(NativeFactory::new(512))).unwrap();
    let rx = engine.subscribe_status();
    engine.initialize().unwrap();

    let states: Vec<EngineState> = rx.try_iter().map(|s| s.state).collect();
    assert_eq!(
        states,
        vec![EngineState::Initializing, EngineState::Loading, EngineState::Ready]
    );
    // initializing again is a no-op
    engine.initialize().unwrap();
    assert_eq!(engine.status().state, EngineState::Ready);
}

#[test]
fn requests_before_ready_fail_fast() {
    let engine = AnalysisEngine::new(options(), Arc::new(NativeFactory::new(512))).unwrap();
    let request = AnalysisRequest::new(tone(1.0), SAMPLE_RATE, params());
    assert_eq!(
        engine.analyze(request.clone()).unwrap_err(),
        EngineError::NotReady(EngineState::Initializing)
    );
    assert!(matches!(
        engine.analyze_streaming(request, |_| {}),
        Err(EngineError::NotReady(EngineState::Initializing))
    ));
    assert!(matches!(
        engine.predict(&AggregatedResult::default()),
        Err(EngineError::NotReady(_))
    ));
}

#[test]
fn init_timeout_is_fatal() {
    let opts = EngineOptions {
        init_timeout: Duration::from_millis(200),
        ..options()
    };
    let engine = AnalysisEngine::new(opts, Arc::new(HangingFactory)).unwrap();
    let err = engine.initialize().unwrap_err();
    assert_eq!(err, EngineError::InitTimeout { ms: 200 });
    assert_eq!(engine.status().state, EngineState::Error);

    let request = AnalysisRequest::new(tone(1.0), SAMPLE_RATE, params());
    assert_eq!(
        engine.analyze(request).unwrap_err(),
        EngineError::NotReady(EngineState::Error)
    );
}

#[test]
fn asset_load_failure_is_reported() {
    let err = AnalysisEngine::start(options(), Arc::new(FailingFactory))
        .err()
        .unwrap();
    match err {
        EngineError::Initialization(msg) => assert!(msg.contains("model assets missing")),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn reduced_mode_denies_prediction_and_parallel_streaming() {
    let opts = EngineOptions {
        units: 3,
        policy: DevicePolicy {
            force_reduced: true,
            ..Default::default()
        },
        ..options()
    };
    let engine = AnalysisEngine::start(opts, Arc::new(NativeFactory::new(512))).unwrap();
    assert_eq!(engine.capability(), CapabilityMode::Reduced);
    assert_eq!(engine.unit_count(), 3);

    let streamed = engine.analyze_streaming(
        AnalysisRequest::new(tone(10.0), SAMPLE_RATE, params()),
        |_| panic!("no chunk may run"),
    );
    assert_eq!(
        streamed.unwrap_err(),
        EngineError::CapabilityDenied(Operation::AnalyzeStreaming)
    );

    let report = engine
        .analyze(AnalysisRequest::new(tone(2.0), SAMPLE_RATE, params()))
        .unwrap();
    assert_eq!(
        engine.predict(&report.result).unwrap_err(),
        EngineError::CapabilityDenied(Operation::Predict)
    );
    assert_eq!(engine.status().state, EngineState::Ready);
}

#[test]
fn reduced_mode_streams_on_a_single_unit() {
    let opts = EngineOptions {
        units: 1,
        policy: DevicePolicy {
            force_reduced: true,
            ..Default::default()
        },
        ..options()
    };
    let engine = AnalysisEngine::start(opts, Arc::new(NativeFactory::new(512))).unwrap();
    let report = engine
        .analyze_streaming(AnalysisRequest::new(tone(10.0), SAMPLE_RATE, params()), |_| {})
        .unwrap();
    assert!((report.duration - 10.0).abs() < 1e-4);
}

#[test]
fn full_mode_predicts_from_an_analysis() {
    let opts = EngineOptions {
        policy: DevicePolicy {
            min_cores: 1,
            ..Default::default()
        },
        ..options()
    };
    let engine = AnalysisEngine::start(opts, Arc::new(NativeFactory::new(512))).unwrap();
    assert_eq!(engine.capability(), CapabilityMode::Full);

    let report = engine
        .analyze(AnalysisRequest::new(tone(4.0), SAMPLE_RATE, params()))
        .unwrap();
    let prediction = engine.predict(&report.result).unwrap();
    assert!(prediction.energy_level.is_some());
    assert!((0.0..=1.0).contains(&prediction.confidence));
}

#[test]
fn unit_crash_moves_engine_to_error() {
    let (factory, faults) = FlakyFactory::new(512);
    let engine = AnalysisEngine::start(options(), Arc::new(factory)).unwrap();
    let rx = engine.subscribe_status();

    let mut samples = tone(2.0);
    samples[0] = PANIC_SENTINEL;
    let request = AnalysisRequest::new(samples, SAMPLE_RATE, params());

    let err = std::thread::scope(|s| {
        let job = s.spawn(|| engine.analyze(request));
        faults.wait_entered();
        faults.release();
        job.join().unwrap().unwrap_err()
    });
    assert!(matches!(err, EngineError::UnitCrashed(_)));
    assert_eq!(engine.status().state, EngineState::Error);
    assert!(rx.try_iter().any(|s| s.state == EngineState::Error));

    let retry = AnalysisRequest::new(tone(1.0), SAMPLE_RATE, params());
    assert_eq!(
        engine.analyze(retry).unwrap_err(),
        EngineError::NotReady(EngineState::Error)
    );
}

#[test]
fn restart_recovers_from_a_crash() {
    let (factory, faults) = FlakyFactory::new(512);
    let engine = AnalysisEngine::start(options(), Arc::new(factory)).unwrap();

    let mut samples = tone(1.0);
    samples[0] = PANIC_SENTINEL;
    std::thread::scope(|s| {
        let job = s.spawn(|| engine.analyze(AnalysisRequest::new(samples, SAMPLE_RATE, params())));
        faults.wait_entered();
        faults.release();
        assert!(job.join().unwrap().is_err());
    });

    let engine = engine.restart().unwrap();
    assert_eq!(engine.status().state, EngineState::Ready);
    assert!(engine
        .analyze(AnalysisRequest::new(tone(1.0), SAMPLE_RATE, params()))
        .is_ok());
}

#[test]
fn job_errors_leave_the_engine_usable() {
    let (factory, _faults) = FlakyFactory::new(512);
    let engine = AnalysisEngine::start(options(), Arc::new(factory)).unwrap();

    let mut samples = tone(1.0);
    samples[0] = ERROR_SENTINEL;
    let err = engine
        .analyze(AnalysisRequest::new(samples, SAMPLE_RATE, params()))
        .unwrap_err();
    match err {
        EngineError::Job { stage, message, .. } => {
            assert_eq!(stage.as_deref(), Some("frames"));
            assert!(message.contains("injected backend error"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(engine.status().state, EngineState::Ready);
    assert_eq!(engine.reset().unwrap(), 0);
}
