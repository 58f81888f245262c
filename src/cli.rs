use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cadence", about = "Chunked music analysis on background compute units")]
pub struct Cli {
    /// Input audio files (WAV, MP3, FLAC, OGG)
    #[arg(required = true)]
    pub inputs: Vec<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Config file (defaults to ./cadence.toml or the user config dir)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Feature families (comma-separated): spectral, tempo, key, mfcc, melody, harmonic
    #[arg(short, long, value_delimiter = ',')]
    pub features: Vec<String>,

    /// Always stream in chunks
    #[arg(long, conflicts_with = "whole_file")]
    pub streaming: bool,

    /// Always analyze in one pass
    #[arg(long)]
    pub whole_file: bool,

    /// Number of compute units
    #[arg(short, long, default_value_t = 1)]
    pub units: usize,

    /// Chunk length in seconds for streaming analysis
    #[arg(long, default_value_t = 30.0)]
    pub chunk_seconds: f32,

    /// Overlap between consecutive chunks in seconds
    #[arg(long, default_value_t = 5.0)]
    pub overlap_seconds: f32,

    /// Also predict energy, mood and danceability
    #[arg(long)]
    pub predict: bool,

    /// Pretty-print the JSON report
    #[arg(long)]
    pub pretty: bool,
}
