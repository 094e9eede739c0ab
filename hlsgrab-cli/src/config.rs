use std::path::{Path, PathBuf};
use std::time::Duration;

use hlsgrab_engine::HlsConfig;
use serde::Deserialize;
use tracing::debug;

use crate::cli::DownloadArgs;
use crate::error::{AppError, Result};

/// Contents of `config.toml`.
///
/// ```toml
/// progress = true
///
/// [engine]
/// download_concurrency = 8
/// missing_iv_policy = "zero"
///
/// [engine.headers]
/// Referer = "https://example.com/"
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub progress: bool,
    pub engine: HlsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            progress: true,
            engine: HlsConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("hlsgrab").join("config.toml"))
    }

    /// Load `path`, or the default location when not given.
    ///
    /// An explicit path must exist; a missing default file just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match Self::default_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !required && !path.exists() {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(&path)?;
        let config = Self::parse(&text).map_err(|reason| AppError::Config {
            path: path.clone(),
            reason,
        })?;
        debug!(path = %path.display(), "config loaded");
        Ok(config)
    }

    fn parse(text: &str) -> std::result::Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }

    /// Command-line flags win over the file.
    pub fn apply_overrides(&mut self, args: &DownloadArgs) -> Result<()> {
        let engine = &mut self.engine;
        if let Some(concurrency) = args.concurrency {
            engine.download_concurrency = concurrency;
        }
        if let Some(dir) = &args.temp_dir {
            engine.temp_root = Some(dir.clone());
        }
        if let Some(ffmpeg) = &args.ffmpeg {
            engine.ffmpeg_path = ffmpeg.clone();
        }
        if let Some(policy) = args.missing_iv {
            engine.missing_iv_policy = policy;
        }
        if let Some(secs) = args.timeout {
            engine.segment_timeout = Duration::try_from_secs_f64(secs).map_err(|_| {
                AppError::InvalidInput(format!(
                    "--timeout must be a finite non-negative number of seconds, got {secs}"
                ))
            })?;
        }
        if args.insecure {
            engine.danger_accept_invalid_certs = true;
        }
        if args.no_progress {
            self.progress = false;
        }
        Ok(())
    }
}
