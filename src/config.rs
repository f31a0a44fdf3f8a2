#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::conversion::CONVERSION_LIMIT;
use crate::storage::CONVERTED_FILES_SUBDIR;
use crate::ytdlp::{DEFAULT_TOOL_TIMEOUT, DEFAULT_YTDLP_BIN};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const LIBRARY_DB_FILE: &str = "library.db";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub media_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub conversion_limit: u32,
    pub tool_timeout: Duration,
    pub ytdlp_bin: PathBuf,
}

impl RuntimeConfig {
    /// Directory where converted MP3 files are written and served from.
    pub fn storage_dir(&self) -> PathBuf {
        self.media_root.join(CONVERTED_FILES_SUBDIR)
    }

    pub fn database_path(&self) -> PathBuf {
        self.media_root.join(LIBRARY_DB_FILE)
    }
}

/// Values given on the command line; they win over env and `.env`.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub media_root: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub conversion_limit: Option<u32>,
    pub tool_timeout_secs: Option<u64>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let media_root = overrides
        .media_root
        .map(|path| path.to_string_lossy().into_owned())
        .or_else(|| lookup_value("MEDIA_ROOT", file_vars, &env_lookup))
        .ok_or_else(|| anyhow!("MEDIA_ROOT not set"))?;
    // Stored file paths must be absolute, so resolve relative roots now.
    let media_root = std::path::absolute(&media_root)
        .with_context(|| format!("resolving MEDIA_ROOT {media_root}"))?;

    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup_value("YTMP3_HOST", file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = match overrides.port {
        Some(port) => port,
        None => parse_value("YTMP3_PORT", file_vars, &env_lookup)?.unwrap_or(DEFAULT_PORT),
    };
    let conversion_limit = match overrides.conversion_limit {
        Some(limit) => limit,
        None => parse_value("YTMP3_CONVERSION_LIMIT", file_vars, &env_lookup)?
            .unwrap_or(CONVERSION_LIMIT),
    };
    let tool_timeout = match overrides.tool_timeout_secs {
        Some(secs) => Some(secs),
        None => parse_value("YTMP3_TOOL_TIMEOUT_SECS", file_vars, &env_lookup)?,
    }
    .map(Duration::from_secs)
    .unwrap_or(DEFAULT_TOOL_TIMEOUT);
    if tool_timeout.is_zero() {
        return Err(anyhow!("YTMP3_TOOL_TIMEOUT_SECS must be greater than zero"));
    }
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value("YTDLP_BIN", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));

    Ok(RuntimeConfig {
        media_root,
        host,
        port,
        conversion_limit,
        tool_timeout,
        ytdlp_bin,
    })
}

fn parse_value<T>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup_value(key, file_vars, env_lookup)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("invalid value {raw:?} for {key}"))
        })
        .transpose()
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .and_then(non_blank)
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn make_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{}", contents).unwrap();
        file
    }

    fn config_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None, RuntimeOverrides::default()).unwrap()
    }

    #[test]
    fn defaults_apply_when_only_media_root_is_set() {
        let config = config_from("MEDIA_ROOT=\"/srv/ytmp3\"\n");
        assert_eq!(config.media_root, PathBuf::from("/srv/ytmp3"));
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.conversion_limit, CONVERSION_LIMIT);
        assert_eq!(config.tool_timeout, DEFAULT_TOOL_TIMEOUT);
        assert_eq!(config.ytdlp_bin, PathBuf::from(DEFAULT_YTDLP_BIN));
        assert_eq!(
            config.storage_dir(),
            PathBuf::from("/srv/ytmp3/converted_files")
        );
        assert_eq!(config.database_path(), PathBuf::from("/srv/ytmp3/library.db"));
    }

    #[test]
    fn reads_every_key_from_file() {
        let config = config_from(
            "MEDIA_ROOT=/m\nYTMP3_HOST=0.0.0.0\nYTMP3_PORT=4242\nYTMP3_CONVERSION_LIMIT=10\nYTMP3_TOOL_TIMEOUT_SECS=30\nYTDLP_BIN=/opt/yt-dlp\n",
        );
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 4242);
        assert_eq!(config.conversion_limit, 10);
        assert_eq!(config.tool_timeout, Duration::from_secs(30));
        assert_eq!(config.ytdlp_bin, PathBuf::from("/opt/yt-dlp"));
    }

    #[test]
    fn missing_media_root_is_an_error() {
        let vars = HashMap::new();
        let err = build_runtime_config(&vars, |_| None, RuntimeOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("MEDIA_ROOT"));
    }

    #[test]
    fn relative_media_root_becomes_absolute() {
        let config = config_from("MEDIA_ROOT=data\n");
        assert!(config.media_root.is_absolute());
        assert!(config.media_root.ends_with("data"));
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("MEDIA_ROOT=\"/file\"\nYTMP3_PORT=1\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |key| match key {
                "MEDIA_ROOT" => Some("/env".to_string()),
                "YTMP3_PORT" => Some("2".to_string()),
                _ => None,
            },
            RuntimeOverrides::default(),
        )
        .unwrap();
        assert_eq!(config.media_root, PathBuf::from("/env"));
        assert_eq!(config.port, 2);
    }

    #[test]
    fn overrides_win_over_env_and_file() {
        let mut vars = HashMap::new();
        vars.insert("MEDIA_ROOT".to_string(), "/file-media".to_string());
        vars.insert("YTMP3_HOST".to_string(), "file-host".to_string());
        vars.insert("YTMP3_CONVERSION_LIMIT".to_string(), "3".to_string());

        let overrides = RuntimeOverrides {
            media_root: Some(PathBuf::from("/override-media")),
            host: Some("override-host".into()),
            port: Some(9000),
            conversion_limit: Some(7),
            tool_timeout_secs: Some(5),
            ytdlp_bin: Some(PathBuf::from("/custom/yt-dlp")),
            env_path: None,
        };

        let config = build_runtime_config(
            &vars,
            |key| {
                if key == "YTMP3_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        )
        .unwrap();

        assert_eq!(config.media_root, PathBuf::from("/override-media"));
        assert_eq!(config.host, "override-host");
        assert_eq!(config.port, 9000);
        assert_eq!(config.conversion_limit, 7);
        assert_eq!(config.tool_timeout, Duration::from_secs(5));
        assert_eq!(config.ytdlp_bin, PathBuf::from("/custom/yt-dlp"));
    }

    #[test]
    fn blank_host_override_falls_back() {
        let vars = read_env_file(make_config("MEDIA_ROOT=\"/m\"\n").path()).unwrap();
        let config = build_runtime_config(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        )
        .unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let vars =
            read_env_file(make_config("MEDIA_ROOT=/m\nYTMP3_CONVERSION_LIMIT=lots\n").path())
                .unwrap();
        let err = build_runtime_config(&vars, |_| None, RuntimeOverrides::default()).unwrap_err();
        assert!(err.to_string().contains("YTMP3_CONVERSION_LIMIT"));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let vars =
            read_env_file(make_config("MEDIA_ROOT=/m\nYTMP3_TOOL_TIMEOUT_SECS=0\n").path()).unwrap();
        assert!(build_runtime_config(&vars, |_| None, RuntimeOverrides::default()).is_err());
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export MEDIA_ROOT="/media"
            YTDLP_BIN='/usr/local/bin/yt-dlp'
            YTMP3_HOST =  "0.0.0.0"
            YTMP3_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("MEDIA_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("YTDLP_BIN").unwrap(), "/usr/local/bin/yt-dlp");
        assert_eq!(vars.get("YTMP3_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("YTMP3_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }
}
