//! Read path for converted files.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tracing::{info, warn};

use crate::error::{ConversionError, ConversionResult};
use crate::security::is_safe_file_name;

/// Subdirectory of the media root that holds converted files.
pub const CONVERTED_FILES_SUBDIR: &str = "converted_files";

/// Content type of every converted file.
pub const AUDIO_CONTENT_TYPE: &str = "audio/mpeg";

/// An opened converted file ready to be streamed.
#[derive(Debug)]
pub struct RetrievedFile {
    pub file: File,
    pub len: u64,
    pub path: PathBuf,
}

/// Looks up converted files by name under a fixed storage root.
#[derive(Debug, Clone)]
pub struct FileRetrieval {
    root: PathBuf,
}

impl FileRetrieval {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Opens `file_name` under the storage root. Names that could escape the
    /// root are reported as missing, the same as absent files.
    pub async fn retrieve(&self, file_name: &str) -> ConversionResult<RetrievedFile> {
        let path = self.root.join(file_name);
        info!(path = %path.display(), "attempting to download file");

        if !is_safe_file_name(file_name) {
            warn!(file = file_name, "rejected unsafe download name");
            return Err(ConversionError::FileNotFound(file_name.to_string()));
        }

        let not_found = || {
            warn!(path = %path.display(), "file not found");
            ConversionError::FileNotFound(file_name.to_string())
        };

        let file = File::open(&path).await.map_err(|_| not_found())?;
        let metadata = file.metadata().await.map_err(|_| not_found())?;
        if !metadata.is_file() {
            return Err(not_found());
        }

        Ok(RetrievedFile {
            file,
            len: metadata.len(),
            path,
        })
    }
}
