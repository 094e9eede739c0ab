//! Shared in-memory collaborators for the engine integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use hlsgrab_engine::{FetchRequest, FetchResponse, HlsConfig, HlsError, HttpFetcher, Muxer, Result};
use parking_lot::Mutex;
use reqwest::StatusCode;

pub const BASE: &str = "https://cdn.example.com/vod/";

#[derive(Clone)]
enum Route {
    Ok(StatusCode, Bytes),
    Timeout,
    Hang,
}

/// URL-keyed fake server. Bodies are served in small chunks to exercise streaming.
#[derive(Default)]
pub struct MockFetcher {
    routes: Mutex<HashMap<String, Route>>,
    requested: Mutex<Vec<String>>,
}

impl MockFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, url: impl Into<String>, body: impl Into<Bytes>) {
        self.routes
            .lock()
            .insert(url.into(), Route::Ok(StatusCode::OK, body.into()));
    }

    pub fn serve_status(&self, url: impl Into<String>, status: StatusCode) {
        self.routes
            .lock()
            .insert(url.into(), Route::Ok(status, Bytes::new()));
    }

    pub fn time_out(&self, url: impl Into<String>) {
        self.routes.lock().insert(url.into(), Route::Timeout);
    }

    /// Never answer `url`.
    pub fn hang(&self, url: impl Into<String>) {
        self.routes.lock().insert(url.into(), Route::Hang);
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl HttpFetcher for MockFetcher {
    async fn get(&self, request: FetchRequest<'_>) -> Result<FetchResponse> {
        self.requested.lock().push(request.url.to_string());
        let route = self.routes.lock().get(request.url).cloned();
        match route {
            Some(Route::Ok(status, body)) => {
                let chunks: Vec<Result<Bytes>> = body
                    .chunks(7)
                    .map(|c| Ok(Bytes::copy_from_slice(c)))
                    .collect();
                Ok(FetchResponse::new(
                    status,
                    futures::stream::iter(chunks).boxed(),
                ))
            }
            Some(Route::Timeout) => Err(HlsError::Timeout {
                url: request.url.to_string(),
            }),
            Some(Route::Hang) => futures::future::pending().await,
            None => Ok(FetchResponse::new(
                StatusCode::NOT_FOUND,
                futures::stream::empty().boxed(),
            )),
        }
    }
}

/// What a muxer saw when it was invoked.
#[derive(Debug, Clone)]
pub struct MuxCall {
    pub inputs: Vec<PathBuf>,
    pub output: PathBuf,
}

/// Muxer that byte-concatenates its inputs, standing in for a stream-copy remux.
#[derive(Default)]
pub struct ConcatMuxer {
    calls: Mutex<Vec<MuxCall>>,
    fail: bool,
}

impl ConcatMuxer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records the call like the real one, then reports failure without writing output.
    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.calls.lock().clone()
    }

    async fn write(&self, inputs: Vec<PathBuf>, output: &Path) -> Result<()> {
        self.calls.lock().push(MuxCall {
            inputs: inputs.clone(),
            output: output.to_path_buf(),
        });
        if self.fail {
            return Err(HlsError::mux("simulated muxer failure"));
        }

        let mut joined = Vec::new();
        for input in &inputs {
            joined.extend(tokio::fs::read(input).await?);
        }
        tokio::fs::write(output, joined).await?;
        Ok(())
    }
}

#[async_trait]
impl Muxer for ConcatMuxer {
    async fn concat(&self, list: &Path, output: &Path) -> Result<()> {
        let text = tokio::fs::read_to_string(list).await?;
        let inputs = text.lines().filter_map(parse_list_line).collect();
        self.write(inputs, output).await
    }

    async fn merge_tracks(&self, video: &Path, audio: &Path, output: &Path) -> Result<()> {
        self.write(vec![video.to_path_buf(), audio.to_path_buf()], output)
            .await
    }
}

fn parse_list_line(line: &str) -> Option<PathBuf> {
    let quoted = line.strip_prefix("file '")?.strip_suffix('\'')?;
    Some(PathBuf::from(quoted.replace(r"'\''", "'")))
}

/// AES-128-CBC with PKCS#7 padding, the inverse of what the engine applies.
pub fn encrypt(plaintext: &[u8], key: &[u8; 16], iv: &[u8; 16]) -> Vec<u8> {
    use cbc::cipher::{BlockEncryptMut, KeyIvInit, block_padding::Pkcs7};

    let cipher = cbc::Encryptor::<aes::Aes128>::new_from_slices(key, iv).unwrap();
    let padded_len = (plaintext.len() / 16 + 1) * 16;
    let mut buffer = vec![0u8; padded_len];
    buffer[..plaintext.len()].copy_from_slice(plaintext);
    cipher
        .encrypt_padded_mut::<Pkcs7>(&mut buffer, plaintext.len())
        .unwrap()
        .to_vec()
}

/// Config rooted in a private temp directory with inline decryption.
pub fn test_config(temp_root: &Path, concurrency: usize) -> HlsConfig {
    HlsConfig {
        temp_root: Some(temp_root.to_path_buf()),
        download_concurrency: concurrency,
        offload_decryption: false,
        ..HlsConfig::default()
    }
}

/// Media playlist listing `uris`, one `#EXTINF` each.
pub fn media_playlist(uris: &[&str]) -> String {
    let mut text = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:4\n");
    for uri in uris {
        text.push_str("#EXTINF:4.000,\n");
        text.push_str(uri);
        text.push('\n');
    }
    text.push_str("#EXT-X-ENDLIST\n");
    text
}

/// Entries currently in `dir`.
pub fn dir_entries(dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .map(|entries| entries.filter_map(|e| e.ok().map(|e| e.path())).collect())
        .unwrap_or_default()
}
