//! Segment pipeline behaviour against an in-memory server and a concatenating muxer.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{BASE, ConcatMuxer, MockFetcher, dir_entries, encrypt, media_playlist, test_config};
use hlsgrab_engine::{
    Aes128CbcDecryptor, ContainerHint, DownloadRequest, EncryptionContext, HlsError,
    MissingIvPolicy, PipelineEvent, SegmentPipeline,
};
use reqwest::StatusCode;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const KEY: [u8; 16] = *b"sixteen byte key";

struct Harness {
    temp_root: TempDir,
    out_dir: TempDir,
    fetcher: Arc<MockFetcher>,
    muxer: Arc<ConcatMuxer>,
}

impl Harness {
    fn new() -> Self {
        Self::with_muxer(ConcatMuxer::new())
    }

    fn with_muxer(muxer: Arc<ConcatMuxer>) -> Self {
        Self {
            temp_root: TempDir::new().unwrap(),
            out_dir: TempDir::new().unwrap(),
            fetcher: MockFetcher::new(),
            muxer,
        }
    }

    fn pipeline(&self, concurrency: usize) -> SegmentPipeline {
        self.pipeline_with(test_config(self.temp_root.path(), concurrency))
    }

    fn pipeline_with(&self, config: hlsgrab_engine::HlsConfig) -> SegmentPipeline {
        SegmentPipeline::new(
            Arc::new(config),
            self.fetcher.clone(),
            Arc::new(Aes128CbcDecryptor),
            self.muxer.clone(),
        )
    }

    fn output(&self, name: &str) -> std::path::PathBuf {
        self.out_dir.path().join(name)
    }

    fn temp_is_empty(&self) -> bool {
        dir_entries(self.temp_root.path()).is_empty()
    }
}

mod ordering {
    use super::*;

    #[tokio::test]
    async fn test_two_segments_assembled_in_order_and_cleaned_up() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}a.ts"), "first-segment|");
        h.fetcher.serve(format!("{BASE}b.ts"), "second-segment|");
        let output = h.output("video.ts");

        let request = DownloadRequest::new(media_playlist(&["a.ts", "b.ts"]), &output)
            .with_base_url(Some(BASE.to_string()));
        let written = h.pipeline(2).download(request).await.unwrap();

        assert_eq!(written, output);
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "first-segment|second-segment|"
        );

        let calls = h.muxer.calls();
        assert_eq!(calls.len(), 1);
        let names: Vec<_> = calls[0]
            .inputs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["seg_000000.ts", "seg_000001.ts"]);
        assert!(calls[0].inputs.iter().all(|p| p.is_absolute()));
        assert!(calls[0].inputs.iter().all(|p| !p.exists()));

        assert!(h.temp_is_empty());
        assert_eq!(dir_entries(h.out_dir.path()), vec![output]);
    }

    #[tokio::test]
    async fn test_order_follows_playlist_not_completion() {
        let h = Harness::new();
        let uris: Vec<String> = (0..12).map(|i| format!("part{i}.ts")).collect();
        for (i, uri) in uris.iter().enumerate() {
            // Larger bodies for early segments so they finish later.
            let body = format!("[{i}]").repeat(200 - i * 10);
            h.fetcher.serve(format!("{BASE}{uri}"), body);
        }
        let refs: Vec<&str> = uris.iter().map(String::as_str).collect();
        let output = h.output("video.ts");

        let request = DownloadRequest::new(media_playlist(&refs), &output)
            .with_base_url(Some(BASE.to_string()));
        h.pipeline(6).download(request).await.unwrap();

        let expected: String = (0..12).map(|i| format!("[{i}]").repeat(200 - i * 10)).collect();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_absolute_segment_urls_need_no_base() {
        let h = Harness::new();
        h.fetcher.serve("https://edge-1.example.net/x.ts", "x");
        h.fetcher.serve("https://edge-2.example.net/y.ts", "y");
        let output = h.output("out.ts");

        let text = media_playlist(&[
            "https://edge-1.example.net/x.ts",
            "https://edge-2.example.net/y.ts",
        ]);
        h.pipeline(1)
            .download(DownloadRequest::new(text, &output))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "xy");
    }

    #[tokio::test]
    async fn test_m4s_segments_use_m4s_temp_files() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}0.m4s"), "a");
        h.fetcher.serve(format!("{BASE}1.m4s"), "b");

        let request = DownloadRequest::new(media_playlist(&["0.m4s", "1.m4s"]), h.output("o.mp4"))
            .with_base_url(Some(BASE.to_string()));
        h.pipeline(2).download(request).await.unwrap();

        let inputs = &h.muxer.calls()[0].inputs;
        assert!(inputs.iter().all(|p| p.extension().unwrap() == "m4s"));
    }

    #[tokio::test]
    async fn test_container_hint_overrides_extensions() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}chunk?n=0"), "a");

        let request = DownloadRequest::new(media_playlist(&["chunk?n=0"]), h.output("o.mp4"))
            .with_base_url(Some(BASE.to_string()))
            .with_container_hint(ContainerHint::M4s);
        h.pipeline(1).download(request).await.unwrap();

        let inputs = &h.muxer.calls()[0].inputs;
        assert_eq!(inputs[0].file_name().unwrap(), "seg_000000.m4s");
    }

    #[tokio::test]
    async fn test_progress_events() {
        let h = Harness::new();
        for name in ["a.ts", "b.ts", "c.ts"] {
            h.fetcher.serve(format!("{BASE}{name}"), name);
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        let output = h.output("o.ts");

        let request = DownloadRequest::new(media_playlist(&["a.ts", "b.ts", "c.ts"]), &output)
            .with_base_url(Some(BASE.to_string()));
        h.pipeline(3).with_events(tx).download(request).await.unwrap();

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert_eq!(events.first(), Some(&PipelineEvent::Started { segments: 3 }));
        let mut completed: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::SegmentCompleted {
                    completed, total, ..
                } => Some((*completed, *total)),
                _ => None,
            })
            .collect();
        completed.sort();
        assert_eq!(completed, [(1, 3), (2, 3), (3, 3)]);
        assert!(events.contains(&PipelineEvent::Assembling { segments: 3 }));
        assert_eq!(events.last(), Some(&PipelineEvent::Finished { output }));
    }
}

mod failures {
    use super::*;

    #[tokio::test]
    async fn test_transport_failure_on_second_of_five_halts_everything() {
        let h = Harness::new();
        let uris = ["s0.ts", "s1.ts", "s2.ts", "s3.ts", "s4.ts"];
        for uri in uris {
            h.fetcher.serve(format!("{BASE}{uri}"), "data");
        }
        h.fetcher.time_out(format!("{BASE}s1.ts"));
        let output = h.output("video.ts");

        let request = DownloadRequest::new(media_playlist(&uris), &output)
            .with_base_url(Some(BASE.to_string()));
        let err = h.pipeline(1).download(request).await.unwrap_err();

        assert!(matches!(err, HlsError::Timeout { .. }), "{err}");
        assert!(h.muxer.calls().is_empty());
        assert!(h.temp_is_empty());
        assert!(!output.exists());
        let requested = h.fetcher.requested();
        assert!(!requested.contains(&format!("{BASE}s4.ts")), "{requested:?}");
    }

    #[tokio::test]
    async fn test_missing_segment_is_transport_error() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}a.ts"), "a");
        h.fetcher.serve_status(format!("{BASE}b.ts"), StatusCode::NOT_FOUND);

        let request = DownloadRequest::new(media_playlist(&["a.ts", "b.ts"]), h.output("o.ts"))
            .with_base_url(Some(BASE.to_string()));
        let err = h.pipeline(2).download(request).await.unwrap_err();

        match err {
            HlsError::Transport { status, .. } => assert_eq!(status, Some(StatusCode::NOT_FOUND)),
            other => panic!("unexpected error: {other}"),
        }
        assert!(h.muxer.calls().is_empty());
        assert!(h.temp_is_empty());
    }

    #[tokio::test]
    async fn test_unwritable_output_is_storage_error() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}a.ts"), "a");
        h.fetcher.serve(format!("{BASE}b.ts"), "b");
        let blocker = h.output("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let output = blocker.join("o.ts");

        let request = DownloadRequest::new(media_playlist(&["a.ts", "b.ts"]), &output)
            .with_base_url(Some(BASE.to_string()));
        let err = h.pipeline(2).download(request).await.unwrap_err();

        assert!(matches!(err, HlsError::Storage { .. }), "{err}");
        assert!(!err.is_retryable());
        assert!(h.temp_is_empty());
        assert!(h.muxer.calls().is_empty());
        assert_eq!(std::fs::read(&blocker).unwrap(), b"file");
    }

    #[tokio::test]
    async fn test_muxer_failure_still_cleans_up() {
        let h = Harness::with_muxer(ConcatMuxer::failing());
        h.fetcher.serve(format!("{BASE}a.ts"), "a");
        h.fetcher.serve(format!("{BASE}b.ts"), "b");
        let output = h.output("video.mp4");

        let request = DownloadRequest::new(media_playlist(&["a.ts", "b.ts"]), &output)
            .with_base_url(Some(BASE.to_string()));
        let err = h.pipeline(2).download(request).await.unwrap_err();

        assert!(matches!(err, HlsError::Mux { .. }), "{err}");
        assert_eq!(h.muxer.calls().len(), 1);
        assert!(h.temp_is_empty());
        assert!(dir_entries(h.out_dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_existing_output_survives_failure() {
        let h = Harness::with_muxer(ConcatMuxer::failing());
        h.fetcher.serve(format!("{BASE}a.ts"), "new");
        let output = h.output("video.ts");
        std::fs::write(&output, "previous recording").unwrap();

        let request = DownloadRequest::new(media_playlist(&["a.ts"]), &output)
            .with_base_url(Some(BASE.to_string()));
        assert!(h.pipeline(1).download(request).await.is_err());
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "previous recording");
    }

    #[tokio::test]
    async fn test_relative_segment_without_base_fails_before_io() {
        let h = Harness::new();
        let request = DownloadRequest::new(media_playlist(&["a.ts"]), h.output("o.ts"));
        let err = h.pipeline(1).download(request).await.unwrap_err();

        assert!(matches!(err, HlsError::MissingBaseUrl { ref uri } if uri == "a.ts"));
        assert!(h.fetcher.requested().is_empty());
        assert!(h.temp_is_empty());
    }

    #[tokio::test]
    async fn test_empty_playlist_is_rejected() {
        let h = Harness::new();
        let request = DownloadRequest::new("#EXTM3U\n#EXT-X-ENDLIST\n", h.output("o.ts"));
        let err = h.pipeline(1).download(request).await.unwrap_err();
        assert!(matches!(err, HlsError::Manifest { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_and_cleans_up() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}a.ts"), "a");
        h.fetcher.hang(format!("{BASE}b.ts"));
        let token = CancellationToken::new();
        let output = h.output("o.ts");

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let request = DownloadRequest::new(media_playlist(&["a.ts", "b.ts"]), &output)
            .with_base_url(Some(BASE.to_string()));
        let err = h
            .pipeline(2)
            .with_cancellation(token)
            .download(request)
            .await
            .unwrap_err();

        assert!(matches!(err, HlsError::Cancelled));
        assert!(h.muxer.calls().is_empty());
        assert!(h.temp_is_empty());
        assert!(!output.exists());
    }
}

mod encryption {
    use super::*;

    const IV: [u8; 16] = [0xA5; 16];

    #[tokio::test]
    async fn test_encrypted_segments_are_decrypted_before_assembly() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}a.ts"), encrypt(b"plain-a", &KEY, &IV));
        h.fetcher.serve(format!("{BASE}b.ts"), encrypt(b"plain-b", &KEY, &IV));
        let output = h.output("o.ts");

        let context =
            EncryptionContext::new(hex::encode(KEY), Some(format!("0x{}", hex::encode(IV))));
        let request = DownloadRequest::new(media_playlist(&["a.ts", "b.ts"]), &output)
            .with_base_url(Some(BASE.to_string()))
            .with_encryption(Some(context));
        h.pipeline(2).download(request).await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"plain-aplain-b");
        assert!(h.temp_is_empty());
    }

    #[tokio::test]
    async fn test_missing_iv_uses_media_sequence() {
        let h = Harness::new();
        let text = "#EXTM3U\n#EXT-X-MEDIA-SEQUENCE:41\n#EXTINF:4,\nx.ts\n#EXTINF:4,\ny.ts\n";
        let iv = |seq: u128| seq.to_be_bytes();
        h.fetcher.serve(format!("{BASE}x.ts"), encrypt(b"forty-one", &KEY, &iv(41)));
        h.fetcher.serve(format!("{BASE}y.ts"), encrypt(b"forty-two", &KEY, &iv(42)));
        let output = h.output("o.ts");

        let request = DownloadRequest::new(text, &output)
            .with_base_url(Some(BASE.to_string()))
            .with_encryption(Some(EncryptionContext::new(hex::encode(KEY), None)));
        h.pipeline(2).download(request).await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"forty-oneforty-two");
    }

    #[tokio::test]
    async fn test_reject_policy_fails_before_io() {
        let h = Harness::new();
        let config = hlsgrab_engine::HlsConfig {
            missing_iv_policy: MissingIvPolicy::Reject,
            ..test_config(h.temp_root.path(), 1)
        };

        let request = DownloadRequest::new(media_playlist(&["a.ts"]), h.output("o.ts"))
            .with_base_url(Some(BASE.to_string()))
            .with_encryption(Some(EncryptionContext::new(hex::encode(KEY), None)));
        let err = h.pipeline_with(config).download(request).await.unwrap_err();

        assert!(matches!(err, HlsError::Decryption { .. }));
        assert!(h.fetcher.requested().is_empty());
    }

    #[tokio::test]
    async fn test_bad_ciphertext_aborts_run() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}a.ts"), vec![0u8; 33]);
        let output = h.output("o.ts");

        let context = EncryptionContext::new(hex::encode(KEY), Some(hex::encode(IV)));
        let request = DownloadRequest::new(media_playlist(&["a.ts"]), &output)
            .with_base_url(Some(BASE.to_string()))
            .with_encryption(Some(context));
        let err = h.pipeline(1).download(request).await.unwrap_err();

        assert!(matches!(err, HlsError::Decryption { .. }), "{err}");
        assert!(h.muxer.calls().is_empty());
        assert!(h.temp_is_empty());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_offloaded_decryption() {
        let h = Harness::new();
        h.fetcher.serve(format!("{BASE}a.ts"), encrypt(&[0x47; 188 * 4], &KEY, &IV));
        let output = h.output("o.ts");
        let config = hlsgrab_engine::HlsConfig {
            offload_decryption: true,
            ..test_config(h.temp_root.path(), 1)
        };

        let context = EncryptionContext::new(hex::encode(KEY), Some(hex::encode(IV)));
        let request = DownloadRequest::new(media_playlist(&["a.ts"]), &output)
            .with_base_url(Some(BASE.to_string()))
            .with_encryption(Some(context));
        h.pipeline_with(config).download(request).await.unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), vec![0x47; 188 * 4]);
    }
}
