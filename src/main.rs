mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cadence::audio::decode::{decode_audio, AudioData};
use cadence::config::{self, Config};
use cadence::{
    AnalysisEngine, AnalysisReport, AnalysisRequest, EngineError, EngineOptions, NativeFactory,
    Prediction,
};
use cli::Cli;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileReport {
    file: PathBuf,
    mode: &'static str,
    report: AnalysisReport,
    #[serde(skip_serializing_if = "Option::is_none")]
    prediction: Option<Prediction>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let mut cli = Cli::parse();

    // Load config: explicit --config path, or auto-detect cadence.toml / global config
    let cfg = match config::find_config(cli.config.as_deref()) {
        Some(path) => match config::load_config(&path) {
            Some(cfg) => {
                log::info!("Loaded config from {}", path.display());
                cfg
            }
            None => {
                log::warn!("Failed to load config from {}", path.display());
                Config::default()
            }
        },
        None => Config::default(),
    };

    // Merge: config values apply only when CLI is at its default
    if cli.units == 1 { cli.units = cfg.engine.units; }
    if cli.chunk_seconds == 30.0 { cli.chunk_seconds = cfg.streaming.chunk_seconds; }
    if cli.overlap_seconds == 5.0 { cli.overlap_seconds = cfg.streaming.overlap_seconds; }

    let mut options: EngineOptions = cfg.engine_options()?;
    options.units = cli.units;
    options.streaming.chunk_seconds = cli.chunk_seconds;
    options.streaming.overlap_seconds = cli.overlap_seconds;
    if !cli.features.is_empty() {
        options.params.features = config::parse_features(&cli.features)?;
    }
    options.params.validate()?;

    for input in &cli.inputs {
        if !input.exists() {
            anyhow::bail!("Input file not found: {}", input.display());
        }
    }

    log::info!("cadence - streaming music analysis");
    log::info!(
        "Features: {:?}, units: {}, chunks: {:.1}s / {:.1}s overlap",
        options.params.features,
        options.units,
        options.streaming.chunk_seconds,
        options.streaming.overlap_seconds
    );

    // 1. Decode every input in parallel
    log::info!("Decoding {} file(s)...", cli.inputs.len());
    let decoded: Vec<AudioData> = cli
        .inputs
        .par_iter()
        .map(|path| decode_audio(path))
        .collect::<Result<_>>()?;

    // 2. Start the engine
    let factory = Arc::new(NativeFactory::new(options.params.frame_size));
    let params = options.params.clone();
    let choice = if cli.streaming {
        ModeChoice::Streaming
    } else if cli.whole_file {
        ModeChoice::WholeFile
    } else {
        ModeChoice::Auto
    };
    let engine = AnalysisEngine::start(options, factory).context("Failed to start engine")?;

    // 3. Analyze
    let mut reports = Vec::with_capacity(decoded.len());
    for (path, audio) in cli.inputs.iter().zip(decoded) {
        let (report, mode) = analyze_file(&engine, path, audio, params.clone(), choice)?;

        let prediction = if cli.predict {
            match engine.predict(&report.result) {
                Ok(p) => Some(p),
                Err(e @ EngineError::CapabilityDenied(_)) => {
                    log::warn!("Skipping prediction: {}", e);
                    None
                }
                Err(e) => return Err(e).context("Prediction failed"),
            }
        } else {
            None
        };

        reports.push(FileReport {
            file: path.clone(),
            mode,
            report,
            prediction,
        });
    }
    engine.shutdown();

    // 4. Emit JSON
    let json = match (reports.len(), cli.pretty) {
        (1, true) => serde_json::to_string_pretty(&reports[0])?,
        (1, false) => serde_json::to_string(&reports[0])?,
        (_, true) => serde_json::to_string_pretty(&reports)?,
        (_, false) => serde_json::to_string(&reports)?,
    };
    match &cli.output {
        Some(out) => {
            std::fs::write(out, json)
                .with_context(|| format!("Failed to write report: {}", out.display()))?;
            log::info!("Done! Output: {}", out.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum ModeChoice {
    Streaming,
    WholeFile,
    /// Let the engine pick by duration
    Auto,
}

fn analyze_file(
    engine: &AnalysisEngine,
    path: &Path,
    audio: AudioData,
    params: cadence::AnalysisParams,
    choice: ModeChoice,
) -> Result<(AnalysisReport, &'static str)> {
    let request =
        AnalysisRequest::new(audio.samples, audio.sample_rate, params).with_channels(audio.channels);
    let stream = match choice {
        ModeChoice::Streaming => true,
        ModeChoice::WholeFile => false,
        ModeChoice::Auto => engine.streams(&request),
    };
    let mode = if stream { "streaming" } else { "whole-file" };
    log::info!(
        "Analyzing {} ({:.1}s, {})",
        path.display(),
        request.duration_seconds,
        mode
    );

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_message(
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
    );

    let report = match choice {
        ModeChoice::Streaming => {
            engine.analyze_streaming(request, |p| pb.set_position(p.percentage.round() as u64))
        }
        ModeChoice::WholeFile => engine
            .analyze_with_progress(request, |p| pb.set_position(p.percentage.round() as u64)),
        ModeChoice::Auto => engine.analyze_auto(request, |p| pb.set_position(p.round() as u64)),
    }
    .with_context(|| format!("Analysis failed for {}", path.display()))?;

    pb.finish_with_message("done");
    Ok((report, mode))
}
