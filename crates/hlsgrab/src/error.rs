use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum HlsError {
    #[error("invalid request for `{url}`: {reason}")]
    InvalidRequest { url: String, reason: String },

    #[error("connection to {url} failed: {reason}")]
    Connection { url: String, reason: String },

    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("transport error for {url}{}: {reason}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Transport {
        url: String,
        status: Option<StatusCode>,
        reason: String,
    },

    #[error("failed to fetch key from {url}: {reason}")]
    KeyFetch { url: String, reason: String },

    #[error("decryption error: {reason}")]
    Decryption { reason: String },

    #[error("unsupported encryption method `{method}`")]
    UnsupportedEncryption { method: String },

    #[error("no resolution-tagged variants found in master playlist")]
    NoVariantsFound,

    #[error("no alternate audio rendition declared")]
    NoAudioRendition,

    #[error("`{uri}` is relative and no base URL was supplied")]
    MissingBaseUrl { uri: String },

    #[error("unrecognised playlist content")]
    UnknownPlaylist,

    #[error("master playlists nested deeper than {max_depth} levels")]
    PlaylistTooDeep { max_depth: usize },

    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: std::io::Error,
    },

    #[error("output manifest error: {reason}")]
    Manifest { reason: String },

    #[error("muxer failed: {reason}")]
    Mux { reason: String },

    #[error("download cancelled")]
    Cancelled,
}

impl HlsError {
    pub fn invalid_request(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn transport(
        url: impl Into<String>,
        status: Option<StatusCode>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Transport {
            url: url.into(),
            status,
            reason: reason.into(),
        }
    }

    pub fn key_fetch(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::KeyFetch {
            url: url.into(),
            reason: reason.into(),
        }
    }

    pub fn decryption(reason: impl Into<String>) -> Self {
        Self::Decryption {
            reason: reason.into(),
        }
    }

    pub fn manifest(reason: impl Into<String>) -> Self {
        Self::Manifest {
            reason: reason.into(),
        }
    }

    pub fn mux(reason: impl Into<String>) -> Self {
        Self::Mux {
            reason: reason.into(),
        }
    }

    /// Map a reqwest failure onto the transport taxonomy.
    pub fn from_reqwest(url: &str, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else if err.is_connect() {
            Self::Connection {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            Self::transport(url, err.status(), err.to_string())
        }
    }

    /// Whether the failure is a network fault (as opposed to a local or structural one).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::Transport { .. }
        )
    }

    /// Transient failures a caller may choose to retry. The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection { .. } | Self::Timeout { .. } => true,
            Self::Transport { status, .. } => match status {
                Some(status) => {
                    status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
                }
                None => true,
            },
            Self::InvalidRequest { .. }
            | Self::KeyFetch { .. }
            | Self::Decryption { .. }
            | Self::UnsupportedEncryption { .. }
            | Self::NoVariantsFound
            | Self::NoAudioRendition
            | Self::MissingBaseUrl { .. }
            | Self::UnknownPlaylist
            | Self::PlaylistTooDeep { .. }
            | Self::Storage { .. }
            | Self::Manifest { .. }
            | Self::Mux { .. }
            | Self::Cancelled => false,
        }
    }
}

pub type Result<T, E = HlsError> = std::result::Result<T, E>;
