// AES-128 key resolution: turns a media playlist's key directive into key/IV material.

use std::sync::Arc;

use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::{debug, instrument, warn};

use crate::error::{HlsError, Result};
use crate::fetch::{FetchRequest, HttpFetcher, ResourceKind};
use crate::playlist::{KeyDirective, Playlist, resolve_url};

const AES_128: &str = "AES-128";
const METHOD_NONE: &str = "NONE";

/// Hex-encoded key material for one media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionContext {
    pub key_hex: String,
    /// IV as written in the playlist, `0x` prefix included when present.
    pub iv_hex: Option<String>,
}

impl EncryptionContext {
    pub fn new(key_hex: impl Into<String>, iv_hex: Option<String>) -> Self {
        Self {
            key_hex: key_hex.into(),
            iv_hex,
        }
    }

    pub fn key_bytes(&self) -> Result<[u8; 16]> {
        decode_block("key", &self.key_hex)
    }

    /// Normalized IV, `None` when the playlist omitted it.
    pub fn iv_bytes(&self) -> Result<Option<[u8; 16]>> {
        self.iv_hex
            .as_deref()
            .map(|iv| decode_block("IV", iv))
            .transpose()
    }
}

fn decode_block(what: &str, value: &str) -> Result<[u8; 16]> {
    let trimmed = value.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    if digits.len() != 32 {
        return Err(HlsError::decryption(format!(
            "{what} must be 16 bytes, got {} hex digits",
            digits.len()
        )));
    }

    let mut block = [0u8; 16];
    hex::decode_to_slice(digits, &mut block)
        .map_err(|e| HlsError::decryption(format!("invalid {what} `{value}`: {e}")))?;
    Ok(block)
}

/// What to use as the IV when a key directive carries none.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum MissingIvPolicy {
    /// Segment media sequence number as a big-endian 128-bit integer (RFC 8216 §5.2).
    #[default]
    MediaSequence,
    /// All-zero IV.
    Zero,
    /// Refuse to decrypt.
    Reject,
}

impl MissingIvPolicy {
    pub fn iv_for(self, sequence: u64) -> Result<[u8; 16]> {
        match self {
            Self::MediaSequence => Ok(u128::from(sequence).to_be_bytes()),
            Self::Zero => Ok([0u8; 16]),
            Self::Reject => Err(HlsError::decryption(
                "key directive has no IV and the missing-IV policy is `reject`",
            )),
        }
    }
}

/// Fetches the AES-128 key referenced by a media playlist.
#[derive(Clone)]
pub struct KeyResolver {
    fetcher: Arc<dyn HttpFetcher>,
}

impl KeyResolver {
    pub fn new(fetcher: Arc<dyn HttpFetcher>) -> Self {
        Self { fetcher }
    }

    /// Resolve the key of `media_text`.
    ///
    /// Returns `Ok(None)` when the playlist has no key directive or declares
    /// `METHOD=NONE`. Only the first directive is honoured; key rotation is not supported.
    #[instrument(skip_all, fields(base_url = base_url.unwrap_or_default()))]
    pub async fn resolve_key(
        &self,
        media_text: &str,
        base_url: Option<&str>,
        headers: Option<&HeaderMap>,
    ) -> Result<Option<EncryptionContext>> {
        let playlist = Playlist::parse(media_text);
        let Some(directive) = playlist.keys().first() else {
            return Ok(None);
        };
        if playlist.keys().iter().skip(1).any(|k| k != directive) {
            warn!(
                directives = playlist.keys().len(),
                "playlist rotates keys; only the first key is used"
            );
        }

        self.resolve_directive(directive, base_url, headers).await
    }

    async fn resolve_directive(
        &self,
        directive: &KeyDirective,
        base_url: Option<&str>,
        headers: Option<&HeaderMap>,
    ) -> Result<Option<EncryptionContext>> {
        if directive.method.eq_ignore_ascii_case(METHOD_NONE) {
            return Ok(None);
        }
        if !directive.method.eq_ignore_ascii_case(AES_128) {
            return Err(HlsError::UnsupportedEncryption {
                method: directive.method.clone(),
            });
        }

        let Some(uri) = directive.uri.as_deref() else {
            return Err(HlsError::key_fetch("", "AES-128 key directive has no URI"));
        };
        let key_url = resolve_url(base_url, uri).ok_or_else(|| HlsError::MissingBaseUrl {
            uri: uri.to_string(),
        })?;

        debug!(url = %key_url, "fetching decryption key");
        let response = self
            .fetcher
            .get(FetchRequest::new(&key_url, ResourceKind::Key).with_headers(headers))
            .await
            .map_err(|e| HlsError::key_fetch(&key_url, e.to_string()))?;

        if !response.status.is_success() {
            return Err(HlsError::key_fetch(
                &key_url,
                format!("HTTP {}", response.status),
            ));
        }

        let key = response
            .bytes()
            .await
            .map_err(|e| HlsError::key_fetch(&key_url, e.to_string()))?;
        if key.len() != 16 {
            warn!(url = %key_url, len = key.len(), "key is not 16 bytes");
        }

        Ok(Some(EncryptionContext::new(
            hex::encode(&key),
            directive.iv.clone(),
        )))
    }
}
