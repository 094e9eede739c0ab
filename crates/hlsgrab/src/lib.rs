// HLS engine: playlist resolution, segment acquisition with AES-128 decryption, and
// hand-off to an external muxer.

pub mod config;
pub mod decrypt;
mod downloader;
pub mod error;
pub mod events;
pub mod fetch;
pub mod key;
pub mod manifest;
pub mod mux;
pub mod pipeline;
pub mod playlist;
mod workspace;

// Re-exports for easier access
pub use config::HlsConfig;
pub use decrypt::{Aes128CbcDecryptor, DecryptionOffloader, SegmentDecryptor};
pub use downloader::{DownloadOptions, DownloadReport, HlsDownloader};
pub use error::{HlsError, Result};
pub use events::PipelineEvent;
pub use fetch::{
    FetchRequest, FetchResponse, HttpFetcher, PlaylistFetcher, ReqwestFetcher, ResourceKind,
    build_header_map,
};
pub use key::{EncryptionContext, KeyResolver, MissingIvPolicy};
pub use manifest::{OutputManifest, TempSegmentFile};
pub use media_types::Resolution;
pub use mux::{FfmpegMuxer, Muxer};
pub use pipeline::{DownloadRequest, SegmentPipeline};
pub use playlist::{
    ContainerHint, Playlist, PlaylistKind, VariantChoice, base_path, classify, resolve_url,
    select_audio_rendition, select_highest_resolution, select_variant,
};
pub use reqwest::header::HeaderMap;
pub use workspace::TempWorkspace;
