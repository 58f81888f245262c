use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::features::{AnalysisParams, Feature, FeatureSet};
use crate::engine::capability::DevicePolicy;
use crate::engine::EngineOptions;
use crate::pipeline::scheduler::StreamingOptions;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub device: DeviceConfig,
}

#[derive(Debug, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_units")]
    pub units: usize,
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,
    #[serde(default = "default_chunk_timeout_ms")]
    pub chunk_timeout_ms: u64,
    #[serde(default = "default_job_timeout_ms")]
    pub job_timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_chunk_seconds")]
    pub chunk_seconds: f32,
    #[serde(default = "default_overlap_seconds")]
    pub overlap_seconds: f32,
    #[serde(default = "default_min_duration_seconds")]
    pub min_duration_seconds: f32,
}

#[derive(Debug, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_frame_size")]
    pub frame_size: usize,
    #[serde(default = "default_hop_size")]
    pub hop_size: usize,
    #[serde(default = "default_mfcc_coefficients")]
    pub mfcc_coefficients: usize,
    #[serde(default = "default_features")]
    pub features: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_min_cores")]
    pub min_cores: usize,
    #[serde(default = "default_min_memory_gb")]
    pub min_memory_gb: f32,
    /// Installed memory; the device guard skips the memory check when unset
    #[serde(default)]
    pub memory_gb: Option<f32>,
    #[serde(default)]
    pub force_reduced: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            units: default_units(),
            init_timeout_ms: default_init_timeout_ms(),
            chunk_timeout_ms: default_chunk_timeout_ms(),
            job_timeout_ms: default_job_timeout_ms(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: default_chunk_seconds(),
            overlap_seconds: default_overlap_seconds(),
            min_duration_seconds: default_min_duration_seconds(),
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            frame_size: default_frame_size(),
            hop_size: default_hop_size(),
            mfcc_coefficients: default_mfcc_coefficients(),
            features: default_features(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            min_cores: default_min_cores(),
            min_memory_gb: default_min_memory_gb(),
            memory_gb: None,
            force_reduced: false,
        }
    }
}

fn default_units() -> usize { 1 }
fn default_init_timeout_ms() -> u64 { 30_000 }
fn default_chunk_timeout_ms() -> u64 { 120_000 }
fn default_job_timeout_ms() -> u64 { 600_000 }
fn default_chunk_seconds() -> f32 { 30.0 }
fn default_overlap_seconds() -> f32 { 5.0 }
fn default_min_duration_seconds() -> f32 { 60.0 }
fn default_frame_size() -> usize { 2048 }
fn default_hop_size() -> usize { 1024 }
fn default_mfcc_coefficients() -> usize { 13 }
fn default_features() -> Vec<String> { Feature::ALL.iter().map(|f| f.to_string()).collect() }
fn default_min_cores() -> usize { 2 }
fn default_min_memory_gb() -> f32 { 2.0 }

/// A timeout of 0 ms disables the deadline.
fn timeout(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl Config {
    pub fn feature_set(&self) -> Result<FeatureSet> {
        parse_features(&self.analysis.features)
    }

    pub fn engine_options(&self) -> Result<EngineOptions> {
        // startup always has a deadline; 0 only disables job and chunk timeouts
        if self.engine.init_timeout_ms == 0 {
            bail!("engine.init_timeout_ms must be greater than 0");
        }
        Ok(EngineOptions {
            units: self.engine.units,
            init_timeout: Duration::from_millis(self.engine.init_timeout_ms),
            job_timeout: timeout(self.engine.job_timeout_ms),
            streaming: StreamingOptions {
                chunk_seconds: self.streaming.chunk_seconds,
                overlap_seconds: self.streaming.overlap_seconds,
                chunk_timeout: timeout(self.engine.chunk_timeout_ms),
            },
            min_streaming_seconds: self.streaming.min_duration_seconds,
            params: AnalysisParams {
                frame_size: self.analysis.frame_size,
                hop_size: self.analysis.hop_size,
                mfcc_coefficients: self.analysis.mfcc_coefficients,
                features: self.feature_set()?,
            },
            policy: DevicePolicy {
                min_cores: self.device.min_cores,
                min_memory_gb: self.device.min_memory_gb,
                force_reduced: self.device.force_reduced,
            },
            memory_gb: self.device.memory_gb,
        })
    }
}

pub fn parse_features<S: AsRef<str>>(names: &[S]) -> Result<FeatureSet> {
    names
        .iter()
        .map(|name| {
            name.as_ref()
                .parse::<Feature>()
                .map_err(anyhow::Error::msg)
        })
        .collect::<Result<FeatureSet>>()
        .context("Invalid feature list")
}

pub fn load_config(path: &Path) -> Option<Config> {
    let content = std::fs::read_to_string(path).ok()?;
    match toml::from_str(&content) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Ignoring malformed config {}: {}", path.display(), e);
            None
        }
    }
}

/// Explicit path, then `./cadence.toml`, then `~/.config/cadence/config.toml`,
/// then the platform config directory.
pub fn find_config(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    let local = PathBuf::from("cadence.toml");
    if local.exists() {
        return Some(local);
    }
    if let Some(home) = dirs::home_dir() {
        let xdg = home.join(".config").join("cadence").join("config.toml");
        if xdg.exists() {
            return Some(xdg);
        }
    }
    if let Some(config_dir) = dirs::config_dir() {
        let platform = config_dir.join("cadence").join("config.toml");
        if platform.exists() {
            return Some(platform);
        }
    }
    None
}
