use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Analyze,
    AnalyzeStreaming,
    Predict,
    Reset,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Analyze => "analyze",
            Operation::AnalyzeStreaming => "analyze_streaming",
            Operation::Predict => "predict",
            Operation::Reset => "reset",
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CapabilityMode {
    Full,
    Reduced,
}

impl CapabilityMode {
    /// Reduced mode never predicts, and only streams on a single unit.
    pub fn allows(self, op: Operation, units: usize) -> bool {
        match (self, op) {
            (CapabilityMode::Full, _) => true,
            (CapabilityMode::Reduced, Operation::Predict) => false,
            (CapabilityMode::Reduced, Operation::AnalyzeStreaming) => units <= 1,
            (CapabilityMode::Reduced, _) => true,
        }
    }

    pub fn check(self, op: Operation, units: usize) -> Result<()> {
        if self.allows(op, units) {
            Ok(())
        } else {
            Err(EngineError::CapabilityDenied(op))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub cores: usize,
    /// Not probed; supplied by configuration when known
    pub memory_gb: Option<f32>,
}

impl DeviceProfile {
    pub fn detect(memory_gb: Option<f32>) -> Self {
        Self {
            cores: num_cpus::get(),
            memory_gb,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DevicePolicy {
    pub min_cores: usize,
    pub min_memory_gb: f32,
    pub force_reduced: bool,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self {
            min_cores: 2,
            min_memory_gb: 2.0,
            force_reduced: false,
        }
    }
}

impl DevicePolicy {
    pub fn evaluate(&self, profile: &DeviceProfile) -> CapabilityMode {
        if self.force_reduced {
            log::warn!("Reduced capability mode forced by configuration");
            return CapabilityMode::Reduced;
        }
        if profile.cores < self.min_cores {
            log::warn!(
                "Reduced capability mode: {} cores (< {})",
                profile.cores,
                self.min_cores
            );
            return CapabilityMode::Reduced;
        }
        if let Some(mem) = profile.memory_gb {
            if mem < self.min_memory_gb {
                log::warn!(
                    "Reduced capability mode: {:.1} GB memory (< {:.1})",
                    mem,
                    self.min_memory_gb
                );
                return CapabilityMode::Reduced;
            }
        }
        CapabilityMode::Full
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weak_devices_get_reduced_mode() {
        let policy = DevicePolicy::default();
        let weak = DeviceProfile { cores: 1, memory_gb: None };
        let small = DeviceProfile { cores: 8, memory_gb: Some(1.0) };
        let unknown = DeviceProfile { cores: 8, memory_gb: None };
        assert_eq!(policy.evaluate(&weak), CapabilityMode::Reduced);
        assert_eq!(policy.evaluate(&small), CapabilityMode::Reduced);
        assert_eq!(policy.evaluate(&unknown), CapabilityMode::Full);
    }

    #[test]
    fn reduced_mode_refuses_prediction_and_parallel_streaming() {
        let mode = CapabilityMode::Reduced;
        assert!(mode.check(Operation::Analyze, 4).is_ok());
        assert!(mode.check(Operation::Reset, 4).is_ok());
        assert!(mode.check(Operation::AnalyzeStreaming, 1).is_ok());
        assert_eq!(
            mode.check(Operation::AnalyzeStreaming, 2),
            Err(EngineError::CapabilityDenied(Operation::AnalyzeStreaming))
        );
        assert_eq!(
            mode.check(Operation::Predict, 1),
            Err(EngineError::CapabilityDenied(Operation::Predict))
        );
    }

    #[test]
    fn full_mode_allows_everything() {
        for op in [
            Operation::Analyze,
            Operation::AnalyzeStreaming,
            Operation::Predict,
            Operation::Reset,
        ] {
            assert!(CapabilityMode::Full.allows(op, 8));
        }
    }
}
