use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::audio::features::{AggregatedResult, AnalysisParams, AnalysisReport, PartialResult};
use crate::audio::predict::Prediction;
use crate::error::ProtocolError;
use crate::pipeline::chunking::ChunkDescriptor;

/// Whole-signal analysis job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioJob {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub params: AnalysisParams,
}

/// One chunk of a shared source signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkJob {
    pub chunk: ChunkDescriptor,
    pub source: Arc<[f32]>,
    pub sample_rate: u32,
    pub params: AnalysisParams,
}

impl ChunkJob {
    pub fn samples(&self) -> &[f32] {
        let end = self.chunk.end_sample.min(self.source.len());
        let start = self.chunk.start_sample.min(end);
        &self.source[start..end]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerRequest {
    Init,
    AnalyzeAudio { id: String, payload: AudioJob },
    AnalyzeChunk { id: String, payload: ChunkJob },
    Predict { id: String, payload: AggregatedResult },
    Reset { id: String },
}

impl WorkerRequest {
    pub fn id(&self) -> Option<&str> {
        match self {
            WorkerRequest::Init => None,
            WorkerRequest::AnalyzeAudio { id, .. }
            | WorkerRequest::AnalyzeChunk { id, .. }
            | WorkerRequest::Predict { id, .. }
            | WorkerRequest::Reset { id } => Some(id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::Init => "INIT",
            WorkerRequest::AnalyzeAudio { .. } => "ANALYZE_AUDIO",
            WorkerRequest::AnalyzeChunk { .. } => "ANALYZE_CHUNK",
            WorkerRequest::Predict { .. } => "PREDICT",
            WorkerRequest::Reset { .. } => "RESET",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressPayload {
    pub stage: String,
    /// 0..=100
    pub percentage: f32,
    /// 0..=1
    pub progress: f32,
    pub current_step: String,
    pub completed_steps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ErrorPayload {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            stage: None,
        }
    }

    pub fn at(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }
}

/// Result of the non-analysis jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum JobValue {
    Prediction(Prediction),
    #[serde(rename_all = "camelCase")]
    Reset { released_handles: usize },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerReply {
    WorkerReady,
    Progress { id: String, payload: ProgressPayload },
    AnalysisComplete { id: String, payload: Box<AnalysisReport> },
    AnalysisError { id: String, payload: ErrorPayload },
    ChunkComplete { id: String, payload: Box<PartialResult> },
    WorkerError { payload: ErrorPayload },
    Result { id: String, payload: JobValue },
    Error { id: String, payload: ErrorPayload },
}

impl WorkerReply {
    pub fn id(&self) -> Option<&str> {
        match self {
            WorkerReply::WorkerReady | WorkerReply::WorkerError { .. } => None,
            WorkerReply::Progress { id, .. }
            | WorkerReply::AnalysisComplete { id, .. }
            | WorkerReply::AnalysisError { id, .. }
            | WorkerReply::ChunkComplete { id, .. }
            | WorkerReply::Result { id, .. }
            | WorkerReply::Error { id, .. } => Some(id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkerReply::WorkerReady => "WORKER_READY",
            WorkerReply::Progress { .. } => "PROGRESS",
            WorkerReply::AnalysisComplete { .. } => "ANALYSIS_COMPLETE",
            WorkerReply::AnalysisError { .. } => "ANALYSIS_ERROR",
            WorkerReply::ChunkComplete { .. } => "CHUNK_COMPLETE",
            WorkerReply::WorkerError { .. } => "WORKER_ERROR",
            WorkerReply::Result { .. } => "RESULT",
            WorkerReply::Error { .. } => "ERROR",
        }
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }
}
