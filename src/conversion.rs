//! The conversion workflow: URL in, MP3 file plus library record out.
//!
//! The workflow never talks to a subprocess or a database directly. It is
//! generic over a [`MediaTool`] (metadata + audio extraction) and a
//! [`ConversionStore`] (record persistence), and it receives the caller's
//! [`QuotaCounter`] explicitly. Callers that share a counter between
//! concurrent requests must hold it exclusively for the duration of
//! [`ConversionWorkflow::convert`] so the check-and-increment stays atomic.

use std::future::Future;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ConversionError, ConversionResult};
use crate::library::{ConversionRecord, NewConversion};
use crate::security::validate_source_url;
use crate::slug::{file_stem, output_file_name};

/// Conversions allowed per session unless configured otherwise.
pub const CONVERSION_LIMIT: u32 = 5;

/// Route prefix under which converted files are served.
pub const DOWNLOAD_ROUTE_PREFIX: &str = "/download/";

/// Minimal metadata needed to name the output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub id: String,
    pub title: String,
}

/// External tool able to look up a video and extract its audio track.
pub trait MediaTool: Send + Sync {
    fn fetch_video_metadata(
        &self,
        url: &str,
    ) -> impl Future<Output = ConversionResult<VideoMetadata>> + Send;

    /// Writes `<output_dir>/<file_stem>.mp3` and returns the path the tool
    /// reports having produced.
    fn download_and_extract_audio(
        &self,
        url: &str,
        output_dir: &Path,
        file_stem: &str,
    ) -> impl Future<Output = ConversionResult<PathBuf>> + Send;
}

/// Create side of the conversion library.
pub trait ConversionStore: Send + Sync {
    fn create(
        &self,
        conversion: NewConversion,
    ) -> impl Future<Output = anyhow::Result<ConversionRecord>> + Send;
}

/// Number of conversions a session already performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaCounter {
    count: u32,
}

impl QuotaCounter {
    pub fn new(count: u32) -> Self {
        Self { count }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_exhausted(&self, limit: u32) -> bool {
        self.count >= limit
    }

    pub fn remaining(&self, limit: u32) -> u32 {
        limit.saturating_sub(self.count)
    }

    fn record_success(&mut self) {
        self.count = self.count.saturating_add(1);
    }
}

/// Successful conversion as reported to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionOutcome {
    pub output_file_name: String,
    pub download_link: String,
    pub title: String,
}

pub fn download_link(file_name: &str) -> String {
    format!("{DOWNLOAD_ROUTE_PREFIX}{file_name}")
}

pub struct ConversionWorkflow<T, S> {
    tool: T,
    store: S,
    output_dir: PathBuf,
    limit: u32,
}

impl<T, S> ConversionWorkflow<T, S>
where
    T: MediaTool,
    S: ConversionStore,
{
    pub fn new(tool: T, store: S, output_dir: PathBuf, limit: u32) -> Self {
        Self {
            tool,
            store,
            output_dir,
            limit,
        }
    }

    pub fn tool(&self) -> &T {
        &self.tool
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Runs one conversion. The first failure is returned as is; nothing is
    /// retried and `quota` only moves on full success.
    pub async fn convert(
        &self,
        url: &str,
        quota: &mut QuotaCounter,
    ) -> ConversionResult<ConversionOutcome> {
        if quota.is_exhausted(self.limit) {
            info!(count = quota.count(), limit = self.limit, "conversion quota exhausted");
            return Err(ConversionError::QuotaExceeded { limit: self.limit });
        }

        let source_url = validate_source_url(url).inspect_err(|err| {
            debug!(error = %err, "rejected conversion input");
        })?;

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|err| {
                error!(dir = %self.output_dir.display(), error = %err, "creating output directory failed");
                ConversionError::persistence(format!(
                    "creating {}: {err}",
                    self.output_dir.display()
                ))
            })?;

        let metadata = self
            .tool
            .fetch_video_metadata(&source_url)
            .await
            .inspect_err(|err| log_failure("metadata fetch", &source_url, err))?;

        let file_name = output_file_name(&metadata.title, &metadata.id);
        let expected_path = self.output_dir.join(&file_name);
        info!(
            url = %source_url,
            video_id = %metadata.id,
            file = %file_name,
            "starting audio extraction"
        );

        let produced = self
            .tool
            .download_and_extract_audio(&source_url, &self.output_dir, file_stem(&file_name))
            .await
            .inspect_err(|err| log_failure("audio extraction", &source_url, err))?;
        // A stale file from an earlier run must not pass for this one.
        if produced != expected_path {
            error!(
                reported = %produced.display(),
                expected = %expected_path.display(),
                "tool reported a different output path"
            );
            return Err(ConversionError::tool(format!(
                "tool produced {} instead of {}",
                produced.display(),
                expected_path.display()
            )));
        }

        ensure_file_exists(&expected_path).await?;
        info!(path = %expected_path.display(), "file created");

        let record = self
            .store
            .create(NewConversion {
                source_url: source_url.clone(),
                title: metadata.title.clone(),
                output_file_name: file_name.clone(),
                file_path: expected_path.to_string_lossy().into_owned(),
            })
            .await
            .map_err(|err| {
                // The audio file stays on disk; only the record is missing.
                error!(
                    url = %source_url,
                    path = %expected_path.display(),
                    error = %err,
                    "persisting conversion record failed"
                );
                ConversionError::persistence(err.to_string())
            })?;

        quota.record_success();
        info!(
            id = record.id,
            file = %record.output_file_name,
            count = quota.count(),
            "conversion recorded"
        );

        Ok(ConversionOutcome {
            download_link: download_link(&file_name),
            output_file_name: file_name,
            title: metadata.title,
        })
    }
}

async fn ensure_file_exists(path: &Path) -> ConversionResult<()> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        Ok(_) | Err(_) => {
            error!(path = %path.display(), "tool finished but the audio file is missing");
            Err(ConversionError::tool(format!(
                "expected output {} was not produced",
                path.display()
            )))
        }
    }
}

fn log_failure(stage: &str, url: &str, err: &ConversionError) {
    match err {
        ConversionError::ExternalToolFailure(detail) => {
            error!(stage, url, detail = %detail, "conversion error");
        }
        other => warn!(stage, url, error = %other, "conversion refused by source"),
    }
}
