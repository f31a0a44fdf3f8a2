#![forbid(unsafe_code)]

//! Security helpers shared by the service: process privilege check, strict
//! validation of URLs handed to yt-dlp, and download file-name checks.

use anyhow::{Result, bail};
use nix::unistd::Uid;
use std::path::{Component, Path};
use url::Url;

use crate::error::{ConversionError, ConversionResult};

const ALLOWED_HOSTS: &[&str] = &[
    "youtube.com",
    "www.youtube.com",
    "m.youtube.com",
    "music.youtube.com",
    "youtu.be",
];

/// Fails fast when a binary is started as root. The service spawns yt-dlp
/// on behalf of anonymous users and must not do so with elevated rights.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!(
            "{process} must not be run as root; use a regular user or a dedicated service account"
        );
    }
    Ok(())
}

/// Validates a user-supplied source URL and returns its normalized form.
///
/// Only http(s) URLs pointing at a YouTube host are accepted. The raw input
/// may not contain whitespace or control characters, and credentials in the
/// authority are rejected. The URL is still passed to yt-dlp after a `--`
/// separator, so a value starting with `-` could never be parsed as a flag.
pub fn validate_source_url(raw: &str) -> ConversionResult<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ConversionError::MissingInput);
    }
    if trimmed
        .chars()
        .any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ConversionError::InvalidUrl(
            "URL contains whitespace or control characters".into(),
        ));
    }

    let parsed =
        Url::parse(trimmed).map_err(|err| ConversionError::InvalidUrl(err.to_string()))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ConversionError::InvalidUrl(format!(
            "unsupported scheme {}",
            parsed.scheme()
        )));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(ConversionError::InvalidUrl(
            "credentials are not allowed".into(),
        ));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| ConversionError::InvalidUrl("missing host".into()))?
        .to_ascii_lowercase();
    if !ALLOWED_HOSTS.contains(&host.as_str()) {
        return Err(ConversionError::InvalidUrl(format!(
            "host {host} is not a YouTube host"
        )));
    }

    Ok(parsed.to_string())
}

/// True when `name` is exactly one normal path component without control
/// characters, i.e. it cannot escape the directory it is joined onto.
pub fn is_safe_file_name(name: &str) -> bool {
    if name.is_empty() || name.chars().any(|c| c.is_control() || c == '\\') {
        return false;
    }
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}
