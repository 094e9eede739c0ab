use std::path::PathBuf;

use media_types::Resolution;

/// Progress notifications emitted while a download runs.
///
/// Purely observational; dropping the receiver never affects the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A master playlist was resolved to one of its variants.
    VariantSelected { resolution: Resolution, url: String },
    /// Segment downloads are about to start.
    Started { segments: usize },
    /// One segment is fully on disk.
    SegmentCompleted {
        index: usize,
        /// Segments finished so far, this one included.
        completed: usize,
        total: usize,
        bytes: u64,
    },
    /// All segments are present and the muxer is being invoked.
    Assembling { segments: usize },
    Finished { output: PathBuf },
}
