// Top-level entry point: follows master playlists down to a media playlist, resolves its
// key and hands it to the segment pipeline. Optionally merges an alternate audio track.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use media_types::Resolution;
use reqwest::header::HeaderMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::config::HlsConfig;
use crate::decrypt::{Aes128CbcDecryptor, SegmentDecryptor};
use crate::error::{HlsError, Result};
use crate::events::PipelineEvent;
use crate::fetch::{HttpFetcher, PlaylistFetcher, ReqwestFetcher};
use crate::key::KeyResolver;
use crate::mux::{FfmpegMuxer, Muxer};
use crate::pipeline::{
    DownloadRequest, SegmentPipeline, prepare_parent, promote, remove_quietly, sibling_path,
    staging_path,
};
use crate::playlist::{
    Playlist, VariantChoice, base_path, classify, resolve_url, select_audio_rendition,
    select_variant,
};

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Extra headers for every playlist, key and segment request.
    pub headers: Option<HeaderMap>,
    /// Append every fetched playlist to this file.
    pub save_playlist: Option<PathBuf>,
    /// Download the first alternate audio rendition too and merge it into the output.
    pub include_audio: bool,
    /// Download only the first alternate audio rendition.
    pub audio_only: bool,
    /// Variant followed at each master playlist.
    pub quality: VariantChoice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub output: PathBuf,
    /// Resolution of the selected variant; `None` when the URL was a media playlist or
    /// only audio was downloaded.
    pub resolution: Option<Resolution>,
    pub segments: usize,
    pub encrypted: bool,
    pub audio_merged: bool,
}

/// A media playlist reached from the requested URL.
#[derive(Debug)]
struct ResolvedMedia {
    url: String,
    text: String,
    resolution: Option<Resolution>,
    audio_url: Option<String>,
}

struct TrackOutcome {
    segments: usize,
    encrypted: bool,
}

pub struct HlsDownloader {
    config: Arc<HlsConfig>,
    playlists: PlaylistFetcher,
    keys: KeyResolver,
    pipeline: SegmentPipeline,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl HlsDownloader {
    /// Downloader using reqwest, AES-128-CBC and the configured ffmpeg binary.
    pub fn new(config: HlsConfig) -> Result<Self> {
        let fetcher: Arc<dyn HttpFetcher> = Arc::new(ReqwestFetcher::new(&config)?);
        let muxer: Arc<dyn Muxer> = Arc::new(FfmpegMuxer::new(config.ffmpeg_path.clone()));
        Ok(Self::with_capabilities(
            config,
            fetcher,
            Arc::new(Aes128CbcDecryptor),
            muxer,
        ))
    }

    pub fn with_capabilities(
        config: HlsConfig,
        fetcher: Arc<dyn HttpFetcher>,
        decryptor: Arc<dyn SegmentDecryptor>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            playlists: PlaylistFetcher::new(Arc::clone(&fetcher)),
            keys: KeyResolver::new(Arc::clone(&fetcher)),
            pipeline: SegmentPipeline::new(Arc::clone(&config), fetcher, decryptor, muxer),
            config,
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.pipeline = self.pipeline.with_events(events.clone());
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.pipeline = self.pipeline.with_cancellation(token);
        self
    }

    /// Fetch and classify a playlist without downloading anything else.
    pub async fn inspect(&self, url: &str, headers: Option<&HeaderMap>) -> Result<Playlist> {
        let text = self.fetch_text(url, headers, None).await?;
        Ok(Playlist::parse(text))
    }

    /// Download `url` into `output`.
    #[instrument(skip(self, options), fields(output = %output.display()))]
    pub async fn download(
        &self,
        url: &str,
        output: &Path,
        options: &DownloadOptions,
    ) -> Result<DownloadReport> {
        let media = self.resolve_media(url, options).await?;

        if options.audio_only {
            let audio_url = media.audio_url.ok_or(HlsError::NoAudioRendition)?;
            let audio_text = self.fetch_audio_playlist(&audio_url, options).await?;
            let track = self
                .download_track(&audio_url, &audio_text, output, options)
                .await?;
            return Ok(DownloadReport {
                output: output.to_path_buf(),
                resolution: None,
                segments: track.segments,
                encrypted: track.encrypted,
                audio_merged: false,
            });
        }

        let audio_url = match (&media.audio_url, options.include_audio) {
            (Some(audio), true) => Some(audio.clone()),
            (None, true) => {
                info!("no alternate audio rendition, downloading video only");
                None
            }
            _ => None,
        };

        let Some(audio_url) = audio_url else {
            let track = self
                .download_track(&media.url, &media.text, output, options)
                .await?;
            return Ok(DownloadReport {
                output: output.to_path_buf(),
                resolution: media.resolution,
                segments: track.segments,
                encrypted: track.encrypted,
                audio_merged: false,
            });
        };

        let (segments, encrypted) = self
            .download_with_audio(&media, &audio_url, output, options)
            .await?;
        Ok(DownloadReport {
            output: output.to_path_buf(),
            resolution: media.resolution,
            segments,
            encrypted,
            audio_merged: true,
        })
    }

    /// Follow master playlists, taking the variant ranked by `options.quality`, until a
    /// media playlist is reached.
    async fn resolve_media(&self, url: &str, options: &DownloadOptions) -> Result<ResolvedMedia> {
        let max_depth = self.config.max_playlist_depth;
        let mut current = url.to_string();
        let mut resolution = None;
        let mut audio_url = None;

        for depth in 0..=max_depth {
            let text = self
                .fetch_text(
                    &current,
                    options.headers.as_ref(),
                    options.save_playlist.as_deref(),
                )
                .await?;
            let kind = classify(&text);
            debug!(url = %current, %kind, depth, "playlist classified");

            if kind.is_media() {
                return Ok(ResolvedMedia {
                    url: current,
                    text,
                    resolution,
                    audio_url,
                });
            }
            if !kind.is_master() {
                return Err(HlsError::UnknownPlaylist);
            }

            let base = playlist_base(&current);
            let (selected, variant) = select_variant(&text, options.quality)?;
            if audio_url.is_none() {
                audio_url = select_audio_rendition(&text)
                    .and_then(|uri| resolve_url(base.as_deref(), &uri));
            }
            let next = resolve_url(base.as_deref(), &variant)
                .ok_or(HlsError::MissingBaseUrl { uri: variant })?;

            info!(
                resolution = %selected,
                quality = ?options.quality,
                url = %next,
                "selected variant"
            );
            self.emit(PipelineEvent::VariantSelected {
                resolution: selected,
                url: next.clone(),
            });
            resolution = Some(selected);
            current = next;
        }

        Err(HlsError::PlaylistTooDeep { max_depth })
    }

    async fn download_track(
        &self,
        url: &str,
        text: &str,
        output: &Path,
        options: &DownloadOptions,
    ) -> Result<TrackOutcome> {
        let base = playlist_base(url);
        let headers = options.headers.as_ref();
        let encryption = self.keys.resolve_key(text, base.as_deref(), headers).await?;
        let outcome = TrackOutcome {
            segments: Playlist::parse(text).segments().len(),
            encrypted: encryption.is_some(),
        };

        let request = DownloadRequest::new(text, output)
            .with_base_url(base)
            .with_headers(options.headers.clone())
            .with_encryption(encryption);
        self.pipeline.download(request).await?;
        Ok(outcome)
    }

    async fn download_with_audio(
        &self,
        media: &ResolvedMedia,
        audio_url: &str,
        output: &Path,
        options: &DownloadOptions,
    ) -> Result<(usize, bool)> {
        let audio_text = self.fetch_audio_playlist(audio_url, options).await?;

        let video_part = sibling_path(output, "video", ".ts");
        let audio_part = sibling_path(output, "audio", ".ts");
        let result = self
            .merge_tracks(
                media,
                audio_url,
                &audio_text,
                &video_part,
                &audio_part,
                output,
                options,
            )
            .await;

        remove_quietly(&video_part).await;
        remove_quietly(&audio_part).await;
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn merge_tracks(
        &self,
        media: &ResolvedMedia,
        audio_url: &str,
        audio_text: &str,
        video_part: &Path,
        audio_part: &Path,
        output: &Path,
        options: &DownloadOptions,
    ) -> Result<(usize, bool)> {
        let video = self
            .download_track(&media.url, &media.text, video_part, options)
            .await?;
        let audio = self
            .download_track(audio_url, audio_text, audio_part, options)
            .await?;

        let staging = staging_path(output, ".ts");
        prepare_parent(output).await?;
        info!("merging audio and video tracks");
        let merged = tokio::select! {
            _ = self.pipeline.token().cancelled() => Err(HlsError::Cancelled),
            result = self.pipeline.muxer().merge_tracks(video_part, audio_part, &staging) => result,
        };
        if let Err(e) = merged {
            warn!(error = %e, "track merge failed");
            remove_quietly(&staging).await;
            return Err(e);
        }
        promote(&staging, output).await?;

        Ok((
            video.segments + audio.segments,
            video.encrypted || audio.encrypted,
        ))
    }

    async fn fetch_audio_playlist(&self, url: &str, options: &DownloadOptions) -> Result<String> {
        let text = self
            .fetch_text(url, options.headers.as_ref(), options.save_playlist.as_deref())
            .await?;
        if !classify(&text).is_media() {
            return Err(HlsError::UnknownPlaylist);
        }
        Ok(text)
    }

    /// Playlist text, or a transport error carrying the status when it was not 200.
    async fn fetch_text(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
        save_to: Option<&Path>,
    ) -> Result<String> {
        let (status, text) = self
            .playlists
            .fetch_with_status(url, headers, save_to)
            .await?;
        text.ok_or_else(|| HlsError::transport(url, Some(status), "playlist unavailable"))
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }
}

/// Base URL segments of the playlist at `url` resolve against.
///
/// Uses the directory holding the playlist file; for endpoints without a playlist file
/// name, falls back to the URL's own directory.
fn playlist_base(url: &str) -> Option<String> {
    let base = base_path(url);
    if !base.is_empty() {
        return Some(base);
    }
    Url::parse(url)
        .and_then(|u| u.join("."))
        .map(|u| u.to_string())
        .ok()
}
