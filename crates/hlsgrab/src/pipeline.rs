// Segment acquisition: bounded-concurrency download of a media playlist into an indexed
// temp workspace, in-place decryption, and hand-off to the muxer.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::StreamExt;
use reqwest::header::HeaderMap;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use crate::config::HlsConfig;
use crate::decrypt::{DecryptionOffloader, SegmentDecryptor};
use crate::error::{HlsError, Result};
use crate::events::PipelineEvent;
use crate::fetch::{FetchRequest, HttpFetcher, ResourceKind};
use crate::key::EncryptionContext;
use crate::manifest::{OutputManifest, TempSegmentFile, segment_file_name};
use crate::mux::Muxer;
use crate::playlist::{ContainerHint, Playlist, resolve_url};
use crate::workspace::TempWorkspace;

const CONCAT_LIST_NAME: &str = "concat.txt";

/// Everything needed to turn one media playlist into one output file.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub media_text: String,
    pub output: PathBuf,
    pub encryption: Option<EncryptionContext>,
    /// Directory URL relative segment URIs are resolved against.
    pub base_url: Option<String>,
    pub headers: Option<HeaderMap>,
    /// Overrides the container derived from the segment extensions.
    pub container_hint: Option<ContainerHint>,
}

impl DownloadRequest {
    pub fn new(media_text: impl Into<String>, output: impl Into<PathBuf>) -> Self {
        Self {
            media_text: media_text.into(),
            output: output.into(),
            encryption: None,
            base_url: None,
            headers: None,
            container_hint: None,
        }
    }

    pub fn with_encryption(mut self, encryption: Option<EncryptionContext>) -> Self {
        self.encryption = encryption;
        self
    }

    pub fn with_base_url(mut self, base_url: Option<String>) -> Self {
        self.base_url = base_url;
        self
    }

    pub fn with_headers(mut self, headers: Option<HeaderMap>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_container_hint(mut self, hint: ContainerHint) -> Self {
        self.container_hint = Some(hint);
        self
    }
}

/// A segment with its URL and IV fully resolved, before any I/O.
#[derive(Debug)]
struct SegmentJob {
    index: usize,
    url: String,
    iv: Option<[u8; 16]>,
}

#[derive(Debug)]
struct Plan {
    jobs: Vec<SegmentJob>,
    key: Option<[u8; 16]>,
    container: ContainerHint,
}

/// Downloads every segment of a media playlist and assembles them in playlist order.
#[derive(Clone)]
pub struct SegmentPipeline {
    config: Arc<HlsConfig>,
    fetcher: Arc<dyn HttpFetcher>,
    decryptor: DecryptionOffloader,
    muxer: Arc<dyn Muxer>,
    events: Option<mpsc::UnboundedSender<PipelineEvent>>,
    token: CancellationToken,
}

impl SegmentPipeline {
    pub fn new(
        config: Arc<HlsConfig>,
        fetcher: Arc<dyn HttpFetcher>,
        decryptor: Arc<dyn SegmentDecryptor>,
        muxer: Arc<dyn Muxer>,
    ) -> Self {
        let decryptor = DecryptionOffloader::new(decryptor, config.offload_decryption);
        Self {
            config,
            fetcher,
            decryptor,
            muxer,
            events: None,
            token: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Abort the run when `token` is cancelled. In-flight fetches are dropped and the
    /// workspace is still cleaned up.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Download, decrypt and assemble `request.media_text` into `request.output`.
    ///
    /// The temp workspace is removed whatever the outcome. On failure `output` is left
    /// untouched: the muxer writes to a staging sibling that is only renamed into place
    /// once it succeeded.
    #[instrument(skip_all, fields(output = %request.output.display()))]
    pub async fn download(&self, request: DownloadRequest) -> Result<PathBuf> {
        let playlist = Playlist::parse(request.media_text.as_str());
        let plan = self.plan(&playlist, &request)?;
        info!(
            segments = plan.jobs.len(),
            encrypted = plan.key.is_some(),
            container = plan.container.extension(),
            "starting segment download"
        );

        let workspace = TempWorkspace::create(&self.config.temp_root()).await?;
        let result = self.run(&workspace, &plan, &request).await;
        workspace.cleanup().await;

        match &result {
            Ok(output) => {
                info!(output = %output.display(), "download complete");
                self.emit(PipelineEvent::Finished {
                    output: output.clone(),
                });
            }
            Err(e) => warn!(error = %e, "download failed"),
        }
        result
    }

    /// Resolve every URL and IV up front so structural errors surface before any I/O.
    fn plan(&self, playlist: &Playlist, request: &DownloadRequest) -> Result<Plan> {
        if playlist.segments().is_empty() {
            return Err(HlsError::manifest("media playlist lists no segments"));
        }

        let (key, explicit_iv) = match &request.encryption {
            Some(context) => (Some(context.key_bytes()?), context.iv_bytes()?),
            None => (None, None),
        };

        let base = request.base_url.as_deref();
        let mut jobs = Vec::with_capacity(playlist.segments().len());
        for segment in playlist.segments() {
            let url = resolve_url(base, &segment.url).ok_or_else(|| HlsError::MissingBaseUrl {
                uri: segment.url.clone(),
            })?;

            let iv = match (key, explicit_iv) {
                (None, _) => None,
                (Some(_), Some(iv)) => Some(iv),
                (Some(_), None) => {
                    let sequence = playlist.media_sequence().saturating_add(segment.index as u64);
                    Some(self.config.missing_iv_policy.iv_for(sequence)?)
                }
            };

            jobs.push(SegmentJob {
                index: segment.index,
                url,
                iv,
            });
        }

        Ok(Plan {
            jobs,
            key,
            container: request
                .container_hint
                .unwrap_or_else(|| playlist.container_hint()),
        })
    }

    async fn run(
        &self,
        workspace: &TempWorkspace,
        plan: &Plan,
        request: &DownloadRequest,
    ) -> Result<PathBuf> {
        let total = plan.jobs.len();
        let headers = request.headers.as_ref();
        let extension = plan.container.extension();
        let completed = AtomicUsize::new(0);
        let completed = &completed;
        self.emit(PipelineEvent::Started { segments: total });

        let mut downloads = futures::stream::iter(&plan.jobs)
            .map(|job| {
                let path = workspace.file(&segment_file_name(job.index, extension));
                async move {
                    let file = self
                        .fetch_segment(job, path, plan.key.as_ref(), headers)
                        .await?;
                    let done = completed.fetch_add(1, Ordering::AcqRel) + 1;
                    self.emit(PipelineEvent::SegmentCompleted {
                        index: file.index,
                        completed: done,
                        total,
                        bytes: file.bytes_written,
                    });
                    Ok::<_, HlsError>(file)
                }
            })
            .buffer_unordered(self.config.concurrency());

        let mut slots: Vec<Option<TempSegmentFile>> = vec![None; total];
        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("download cancelled, dropping in-flight segments");
                    return Err(HlsError::Cancelled);
                }
                next = downloads.next() => next,
            };
            let Some(result) = next else {
                break;
            };
            let file = result?;
            let index = file.index;
            slots[index] = Some(file);
        }
        drop(downloads);

        let manifest = OutputManifest::from_files(slots.into_iter().flatten().collect(), total)?;
        let list = workspace.file(CONCAT_LIST_NAME);
        manifest.write_concat_list(&list).await?;
        debug!(
            list = %list.display(),
            bytes = manifest.total_bytes(),
            "concat list written"
        );

        self.emit(PipelineEvent::Assembling {
            segments: manifest.len(),
        });
        let staging = staging_path(&request.output, extension);
        prepare_parent(&request.output).await?;

        let muxed = tokio::select! {
            _ = self.token.cancelled() => Err(HlsError::Cancelled),
            result = self.muxer.concat(&list, &staging) => result,
        };
        match muxed {
            Ok(()) => promote(&staging, &request.output).await?,
            Err(e) => {
                remove_quietly(&staging).await;
                return Err(e);
            }
        }
        Ok(request.output.clone())
    }

    async fn fetch_segment(
        &self,
        job: &SegmentJob,
        path: PathBuf,
        key: Option<&[u8; 16]>,
        headers: Option<&HeaderMap>,
    ) -> Result<TempSegmentFile> {
        let response = self
            .fetcher
            .get(FetchRequest::new(&job.url, ResourceKind::Segment).with_headers(headers))
            .await?;
        if !response.status.is_success() {
            return Err(HlsError::transport(
                &job.url,
                Some(response.status),
                "segment request was not successful",
            ));
        }

        let mut body = response.body;
        let mut writer = BufWriter::new(tokio::fs::File::create(&path).await?);
        let mut written = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        drop(writer);

        if let (Some(key), Some(iv)) = (key, job.iv.as_ref()) {
            let ciphertext = tokio::fs::read(&path).await?;
            let plaintext = self.decryptor.decrypt(ciphertext, key, iv).await?;
            tokio::fs::write(&path, plaintext).await?;
        }

        trace!(index = job.index, bytes = written, "segment written");
        Ok(TempSegmentFile {
            index: job.index,
            path,
            bytes_written: written,
        })
    }

    fn emit(&self, event: PipelineEvent) {
        if let Some(events) = &self.events {
            let _ = events.send(event);
        }
    }

    pub(crate) fn muxer(&self) -> &Arc<dyn Muxer> {
        &self.muxer
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Hidden sibling of `output` used while the muxer writes:
/// `dir/.name.<id>.part.ext`. Keeps the real extension last so the muxer can still
/// infer the container from it.
pub(crate) fn staging_path(output: &Path, fallback_extension: &str) -> PathBuf {
    sibling_path(output, "part", fallback_extension)
}

pub(crate) fn sibling_path(output: &Path, tag: &str, fallback_extension: &str) -> PathBuf {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let extension = output
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback_extension.trim_start_matches('.').to_string());
    let id = Uuid::new_v4().simple().to_string();
    let name = format!(".{stem}.{}.{tag}.{extension}", &id[..8]);
    output.with_file_name(name)
}

pub(crate) async fn prepare_parent(output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Move a finished staging file onto its final path.
pub(crate) async fn promote(staging: &Path, output: &Path) -> Result<()> {
    if let Err(e) = tokio::fs::rename(staging, output).await {
        remove_quietly(staging).await;
        return Err(e.into());
    }
    Ok(())
}

pub(crate) async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}
