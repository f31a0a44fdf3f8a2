//! yt-dlp backed [`MediaTool`].
//!
//! Every call spawns the binary directly with an argv vector (no shell) and
//! puts `--` in front of the URL. Calls are bounded by a timeout; on expiry
//! the child is killed when its handle is dropped.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::conversion::{MediaTool, VideoMetadata};
use crate::error::{ConversionError, ConversionResult};

pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(600);

// Keeps diagnostics readable when yt-dlp dumps a long trace.
const MAX_DIAGNOSTIC_BYTES: usize = 2000;

#[derive(Debug, Clone)]
pub struct YtDlp {
    binary: PathBuf,
    timeout: Duration,
}

#[derive(Deserialize)]
struct InfoJson {
    id: Option<String>,
    title: Option<String>,
    fulltitle: Option<String>,
}

impl YtDlp {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Runs `yt-dlp --version` so a missing install shows up at startup
    /// rather than on the first conversion.
    pub async fn ensure_available(&self) -> ConversionResult<String> {
        let output = self.run(vec!["--version".into()]).await?;
        if !output.status.success() {
            return Err(ConversionError::tool(format!(
                "{} --version exited with {}",
                self.binary.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run(&self, args: Vec<OsString>) -> ConversionResult<Output> {
        debug!(binary = %self.binary.display(), ?args, "running yt-dlp");
        let child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ConversionError::tool(format!("launching {}: {err}", self.binary.display()))
            })?;

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(ConversionError::tool(format!(
                "waiting for {}: {err}",
                self.binary.display()
            ))),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs_f64(), "yt-dlp timed out");
                Err(ConversionError::tool(format!(
                    "{} timed out after {:?}",
                    self.binary.display(),
                    self.timeout
                )))
            }
        }
    }

    async fn run_checked(&self, args: Vec<OsString>) -> ConversionResult<Output> {
        let output = self.run(args).await?;
        if output.status.success() {
            return Ok(output);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(status = %output.status, stderr = %stderr.trim(), "yt-dlp failed");
        Err(classify_failure(&stderr, &output.status.to_string()))
    }
}

impl MediaTool for YtDlp {
    async fn fetch_video_metadata(&self, url: &str) -> ConversionResult<VideoMetadata> {
        let output = self
            .run_checked(vec![
                "--dump-single-json".into(),
                "--skip-download".into(),
                "--no-playlist".into(),
                "--no-warnings".into(),
                "--no-progress".into(),
                "--".into(),
                url.into(),
            ])
            .await?;
        parse_metadata(&output.stdout)
    }

    async fn download_and_extract_audio(
        &self,
        url: &str,
        output_dir: &Path,
        file_stem: &str,
    ) -> ConversionResult<PathBuf> {
        let mut template = output_dir.join(file_stem).into_os_string();
        template.push(".%(ext)s");

        self.run_checked(vec![
            "--extract-audio".into(),
            "--audio-format".into(),
            "mp3".into(),
            "--no-playlist".into(),
            "--force-overwrites".into(),
            "--no-progress".into(),
            "--no-warnings".into(),
            "--output".into(),
            template,
            "--".into(),
            url.into(),
        ])
        .await?;

        Ok(output_dir.join(format!("{file_stem}.mp3")))
    }
}

fn parse_metadata(stdout: &[u8]) -> ConversionResult<VideoMetadata> {
    let info: InfoJson = serde_json::from_slice(stdout)
        .map_err(|err| ConversionError::tool(format!("parsing yt-dlp metadata: {err}")))?;

    let id = info
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ConversionError::tool("yt-dlp metadata has no video id"))?;
    let title = info
        .title
        .or(info.fulltitle)
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
        .ok_or_else(|| ConversionError::tool("yt-dlp metadata has no title"))?;

    Ok(VideoMetadata { id, title })
}

/// Maps yt-dlp's stderr to an error kind. Order matters: YouTube reports
/// copyright takedowns as "Video unavailable ... copyright claim".
pub fn classify_failure(stderr: &str, status: &str) -> ConversionError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("private video") {
        return ConversionError::PrivateVideo;
    }
    if lower.contains("copyright") {
        return ConversionError::Copyrighted;
    }
    // "ffmpeg not found" is a broken install, not a missing video.
    let missing_dependency = lower.contains("ffmpeg") || lower.contains("ffprobe");
    if lower.contains("video unavailable")
        || lower.contains("http error 404")
        || (lower.contains("not found") && !missing_dependency)
        || lower.contains("does not exist")
    {
        return ConversionError::NotFound;
    }

    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        ConversionError::tool(format!("yt-dlp exited with {status}"))
    } else {
        ConversionError::tool(tail(trimmed, MAX_DIAGNOSTIC_BYTES).to_string())
    }
}

fn tail(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut start = text.len() - max_bytes;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
