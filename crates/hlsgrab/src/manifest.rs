// Ordered hand-off to the muxer: temp segment files sorted by the index in their names.

use std::path::{Path, PathBuf};

use crate::error::{HlsError, Result};

const SEGMENT_PREFIX: &str = "seg_";

/// One fully written (and decrypted, if keyed) segment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempSegmentFile {
    pub index: usize,
    pub path: PathBuf,
    /// Bytes received from the network, before any decryption.
    pub bytes_written: u64,
}

/// Deterministic temp file name for a segment: `seg_000042.ts`.
///
/// `extension` may be given with or without its leading dot.
pub fn segment_file_name(index: usize, extension: &str) -> String {
    format!(
        "{SEGMENT_PREFIX}{index:06}.{}",
        extension.trim_start_matches('.')
    )
}

/// Recover the playlist index from a temp file name.
pub fn index_from_file_name(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix(SEGMENT_PREFIX)?
        .parse()
        .ok()
}

/// Segment files in playlist order, ready for concatenation.
///
/// Can only be built from a complete, gap-free set of files.
#[derive(Debug, Clone)]
pub struct OutputManifest {
    files: Vec<TempSegmentFile>,
}

impl OutputManifest {
    /// Order `files` by the index embedded in their file names and check that they cover
    /// `0..expected` exactly once.
    pub fn from_files(files: Vec<TempSegmentFile>, expected: usize) -> Result<Self> {
        let mut keyed = files
            .into_iter()
            .map(|file| {
                let index = index_from_file_name(&file.path).ok_or_else(|| {
                    HlsError::manifest(format!(
                        "cannot recover segment index from {}",
                        file.path.display()
                    ))
                })?;
                Ok((index, file))
            })
            .collect::<Result<Vec<_>>>()?;

        if keyed.len() != expected {
            return Err(HlsError::manifest(format!(
                "expected {expected} segments, found {}",
                keyed.len()
            )));
        }

        keyed.sort_by_key(|(index, _)| *index);
        for (position, (index, file)) in keyed.iter().enumerate() {
            if *index != position {
                return Err(HlsError::manifest(format!(
                    "segment index {index} found at position {position} (gap or duplicate)"
                )));
            }
            if file.index != *index {
                return Err(HlsError::manifest(format!(
                    "{} is named for index {index} but recorded as {}",
                    file.path.display(),
                    file.index
                )));
            }
        }

        Ok(Self {
            files: keyed.into_iter().map(|(_, file)| file).collect(),
        })
    }

    pub fn files(&self) -> &[TempSegmentFile] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(|f| f.bytes_written).sum()
    }

    /// Concat demuxer list: one `file '<absolute path>'` line per segment.
    pub fn concat_list_contents(&self) -> String {
        let mut out = String::new();
        for file in &self.files {
            let path = file.path.to_string_lossy().replace('\'', r"'\''");
            out.push_str("file '");
            out.push_str(&path);
            out.push_str("'\n");
        }
        out
    }

    pub async fn write_concat_list(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.concat_list_contents()).await?;
        Ok(())
    }
}
