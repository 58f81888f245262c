pub mod audio;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod worker;

pub use audio::features::{
    AggregatedResult, AnalysisParams, AnalysisReport, AnalysisRequest, Feature, FeatureSet,
    PartialResult,
};
pub use audio::predict::Prediction;
pub use backend::{Backend, BackendError, BackendFactory, NativeFactory};
pub use engine::capability::{CapabilityMode, Operation};
pub use engine::status::{EngineState, EngineStatus};
pub use engine::{AnalysisEngine, EngineOptions};
pub use error::{EngineError, Result};
pub use pipeline::aggregate::merge_streaming_results;
pub use pipeline::scheduler::{StreamProgress, StreamingOptions};
