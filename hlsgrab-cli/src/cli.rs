use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hlsgrab_engine::{MissingIvPolicy, VariantChoice};
use tracing::debug;

use crate::error::{AppError, Result};

#[derive(Parser, Debug)]
#[command(
    name = "hlsgrab",
    version,
    about = "Download HLS streams into a single media file",
    long_about = "Resolves master playlists to their highest-resolution variant, downloads every \
                  segment (decrypting AES-128 when keyed) and stream-copies the result with ffmpeg."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to <config dir>/hlsgrab/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors and hide the progress bar
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download a playlist into one output file
    Download(DownloadArgs),

    /// Fetch a playlist and describe it without downloading segments
    Inspect {
        /// Playlist URL
        url: String,

        /// Extra request header, `Name: Value` (repeatable)
        #[arg(short = 'H', long = "header", value_name = "HEADER")]
        headers: Vec<String>,
    },
}

#[derive(clap::Args, Debug)]
pub struct DownloadArgs {
    /// Master or media playlist URL
    pub url: String,

    /// Output file; its extension selects the container
    #[arg(short, long)]
    pub output: PathBuf,

    /// Extra request header, `Name: Value` (repeatable)
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    pub headers: Vec<String>,

    /// Segments downloaded concurrently
    #[arg(short = 'j', long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Directory for per-run temporary files
    #[arg(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// ffmpeg binary
    #[arg(long, value_name = "PATH")]
    pub ffmpeg: Option<PathBuf>,

    /// Variant to follow in master playlists
    #[arg(long, value_enum, default_value_t = VariantChoice::Highest)]
    pub quality: VariantChoice,

    /// Also download the first alternate audio rendition and merge it
    #[arg(long, conflicts_with = "audio_only")]
    pub audio: bool,

    /// Download only the first alternate audio rendition
    #[arg(long)]
    pub audio_only: bool,

    /// Append every fetched playlist to this file
    #[arg(long, value_name = "FILE")]
    pub save_playlist: Option<PathBuf>,

    /// IV to use when a key directive has none
    #[arg(long, value_enum, value_name = "POLICY")]
    pub missing_iv: Option<MissingIvPolicy>,

    /// Per-segment request timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<f64>,

    /// Accept invalid TLS certificates
    #[arg(long)]
    pub insecure: bool,

    /// Disable the progress bar
    #[arg(long)]
    pub no_progress: bool,
}

/// Parse `Name: Value` header arguments.
pub fn parse_headers(raw: &[String]) -> Result<Vec<(String, String)>> {
    raw.iter()
        .map(|header| {
            let (name, value) = header.split_once(':').ok_or_else(|| {
                AppError::InvalidInput(format!("header `{header}` is not `Name: Value`"))
            })?;
            let name = name.trim();
            if name.is_empty() {
                return Err(AppError::InvalidInput(format!(
                    "header `{header}` has an empty name"
                )));
            }
            debug!("Added header: {name}");
            Ok((name.to_string(), value.trim().to_string()))
        })
        .collect()
}
