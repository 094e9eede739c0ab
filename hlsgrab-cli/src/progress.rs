use std::time::Duration;

use hlsgrab_engine::PipelineEvent;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::info;

/// Drive a progress bar from engine events until the sender side is dropped.
pub fn spawn_progress(
    mut events: UnboundedReceiver<PipelineEvent>,
    enabled: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let bar = if enabled {
            ProgressBar::new(0)
        } else {
            ProgressBar::hidden()
        };
        bar.set_style(bar_style());
        bar.enable_steady_tick(Duration::from_millis(120));

        let mut bytes = 0u64;
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::VariantSelected { resolution, .. } => {
                    bar.set_message(format!("variant {resolution}"));
                }
                PipelineEvent::Started { segments } => {
                    bytes = 0;
                    bar.reset();
                    bar.set_length(segments as u64);
                    bar.set_message("downloading");
                }
                PipelineEvent::SegmentCompleted {
                    completed,
                    bytes: segment_bytes,
                    ..
                } => {
                    bytes += segment_bytes;
                    bar.set_position(completed as u64);
                    bar.set_message(format!("{}", HumanBytes(bytes)));
                }
                PipelineEvent::Assembling { segments } => {
                    bar.set_message(format!("assembling {segments} segments"));
                }
                PipelineEvent::Finished { output } => {
                    bar.suspend(|| info!(output = %output.display(), "track written"));
                }
            }
        }
        bar.finish_and_clear();
    })
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.yellow} [{elapsed_precise}] [{bar:30.yellow/white}] {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("=> ")
}
