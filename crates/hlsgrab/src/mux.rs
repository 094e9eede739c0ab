// Assembly of downloaded segments into the final container, delegated to an injected muxer.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use process_utils::{OutputStream, run_with_line_handler, tokio_command};
use tracing::{debug, info, trace, warn};

use crate::error::{HlsError, Result};

/// Lossless stream-copy assembly.
///
/// Both operations must overwrite `output` if it exists and must fail rather than
/// leave a silently truncated file behind.
#[async_trait]
pub trait Muxer: Send + Sync {
    /// Concatenate the files named in a concat list (`file '<path>'` per line).
    async fn concat(&self, list: &Path, output: &Path) -> Result<()>;

    /// Combine a video-only and an audio-only file into one container.
    async fn merge_tracks(&self, video: &Path, audio: &Path, output: &Path) -> Result<()>;
}

/// [`Muxer`] backed by an `ffmpeg` child process.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    binary: PathBuf,
}

impl FfmpegMuxer {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn concat_args(list: &Path, output: &Path) -> Vec<OsString> {
        let mut args = base_args();
        args.extend(["-f", "concat", "-safe", "0", "-i"].map(OsString::from));
        args.push(list.into());
        args.extend(["-c", "copy"].map(OsString::from));
        args.push(output.into());
        args
    }

    fn merge_args(video: &Path, audio: &Path, output: &Path) -> Vec<OsString> {
        let mut args = base_args();
        args.push("-i".into());
        args.push(video.into());
        args.push("-i".into());
        args.push(audio.into());
        args.extend(["-map", "0:v", "-map", "1:a", "-c", "copy"].map(OsString::from));
        args.push(output.into());
        args
    }

    async fn run(&self, args: Vec<OsString>, expected_inputs: Option<usize>) -> Result<()> {
        let mut command = tokio_command(&self.binary);
        command.args(&args);
        debug!(binary = %self.binary.display(), ?args, "running ffmpeg");

        let mut opened = 0usize;
        let mut last_error: Option<String> = None;
        let outcome = run_with_line_handler(&mut command, |stream, line| {
            if line.contains("Opening '") {
                opened += 1;
            }
            if line.to_ascii_lowercase().contains("error") {
                last_error = Some(line.trim().to_string());
            }
            if stream == OutputStream::Stderr {
                trace!(target: "ffmpeg", "{line}");
            }
        })
        .await
        .map_err(|e| HlsError::mux(format!("failed to run {}: {e}", self.binary.display())))?;

        if let Some(expected) = expected_inputs {
            info!(opened, expected, "ffmpeg finished reading segments");
        }

        if !outcome.status.success() {
            let detail = last_error.unwrap_or_else(|| "no error output".to_string());
            return Err(HlsError::mux(format!(
                "ffmpeg exited with {}: {detail}",
                outcome.status
            )));
        }
        if let Some(line) = last_error {
            warn!(line, "ffmpeg reported an error but exited successfully");
        }
        Ok(())
    }
}

impl Default for FfmpegMuxer {
    fn default() -> Self {
        Self::new("ffmpeg")
    }
}

fn base_args() -> Vec<OsString> {
    ["-hide_banner", "-nostdin", "-y"]
        .map(OsString::from)
        .to_vec()
}

#[async_trait]
impl Muxer for FfmpegMuxer {
    async fn concat(&self, list: &Path, output: &Path) -> Result<()> {
        let segments = tokio::fs::read_to_string(list)
            .await?
            .lines()
            .filter(|l| l.starts_with("file "))
            .count();
        self.run(Self::concat_args(list, output), Some(segments))
            .await
    }

    async fn merge_tracks(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        self.run(Self::merge_args(video, audio, output), None).await
    }
}
