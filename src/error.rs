use thiserror::Error;

use crate::engine::capability::Operation;
use crate::engine::status::EngineState;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("Engine not ready (state: {0})")]
    NotReady(EngineState),

    #[error("Operation '{0}' is unavailable in reduced capability mode")]
    CapabilityDenied(Operation),

    #[error("Initialization failed: {0}")]
    Initialization(String),

    #[error("Initialization timed out after {ms}ms")]
    InitTimeout { ms: u64 },

    #[error("Compute unit crashed: {0}")]
    UnitCrashed(String),

    #[error("Compute unit terminated")]
    UnitTerminated,

    #[error("Job {id} failed{}: {message}", stage_suffix(.stage))]
    Job {
        id: String,
        stage: Option<String>,
        message: String,
    },

    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Timed out after {ms}ms waiting for {operation}")]
    Timeout { operation: String, ms: u64 },

    #[error("Illegal status transition: {from} -> {to}")]
    IllegalTransition { from: EngineState, to: EngineState },

    #[error("Protocol error: {0}")]
    Protocol(String),
}

fn stage_suffix(stage: &Option<String>) -> String {
    stage.as_ref().map(|s| format!(" at {s}")).unwrap_or_default()
}

impl EngineError {
    /// True for failures that take the whole unit down rather than one job.
    pub fn is_unit_failure(&self) -> bool {
        matches!(self, EngineError::UnitCrashed(_) | EngineError::UnitTerminated)
    }
}

/// Malformed or unrecognized message envelopes.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<ProtocolError> for EngineError {
    fn from(err: ProtocolError) -> Self {
        EngineError::Protocol(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
