use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::key::MissingIvPolicy;

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Engine configuration.
///
/// Every field has a default, so a partial TOML table deserializes cleanly. Durations
/// are expressed in (fractional) seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    /// User agent sent with every request.
    pub user_agent: String,
    /// Headers added to every request, before any per-call headers.
    pub headers: BTreeMap<String, String>,
    /// Deadline for playlist and key requests.
    #[serde(with = "secs")]
    pub request_timeout: Duration,
    /// Deadline for a single segment request, body included.
    #[serde(with = "secs")]
    pub segment_timeout: Duration,
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Maximum number of segments in flight at once.
    pub download_concurrency: usize,
    /// Directory under which per-run temporary directories are created.
    /// Falls back to the system temp directory.
    pub temp_root: Option<PathBuf>,
    pub missing_iv_policy: MissingIvPolicy,
    /// Run AES decryption on the blocking thread pool.
    pub offload_decryption: bool,
    /// Path (or bare name resolved through `PATH`) of the ffmpeg binary.
    pub ffmpeg_path: PathBuf,
    /// Maximum master-playlist nesting followed before giving up.
    pub max_playlist_depth: usize,
    pub danger_accept_invalid_certs: bool,
}

impl Default for HlsConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: BTreeMap::new(),
            request_timeout: Duration::from_secs(20),
            segment_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            download_concurrency: 4,
            temp_root: None,
            missing_iv_policy: MissingIvPolicy::default(),
            offload_decryption: true,
            ffmpeg_path: PathBuf::from("ffmpeg"),
            max_playlist_depth: 3,
            danger_accept_invalid_certs: false,
        }
    }
}

impl HlsConfig {
    /// Effective temp root: the configured one or the platform temp directory.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Concurrency clamped to at least one worker.
    pub fn concurrency(&self) -> usize {
        self.download_concurrency.max(1)
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}
