#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs, io,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_DOWNLOAD_ROOT: &str = "downloads";
pub const DEFAULT_YTDLP_BIN: &str = "yt-dlp";
pub const DEFAULT_MAX_CONCURRENT: usize = 3;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_RETENTION_SECS: u64 = 300;
pub const DEFAULT_ARTIFACT_MAX_AGE_SECS: u64 = 3600;
pub const DEFAULT_METADATA_CACHE_TTL_SECS: u64 = 3600;
pub const DEFAULT_METADATA_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_METADATA_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_METADATA_RETRY_DELAY_MS: u64 = 1000;
pub const DEFAULT_KEEPALIVE_SECS: u64 = 15;

/// Fully resolved runtime settings for the server.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub download_root: PathBuf,
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
    pub max_concurrent: usize,
    pub download_timeout: Duration,
    pub retention: Duration,
    pub artifact_max_age: Duration,
    pub metadata_cache_ttl: Duration,
    pub metadata_timeout: Duration,
    pub metadata_retry_attempts: u32,
    pub metadata_retry_delay: Duration,
    pub outbound_rate_limit: Option<String>,
    pub keepalive: Duration,
    pub log_dir: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_ROOT),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            ytdlp_bin: PathBuf::from(DEFAULT_YTDLP_BIN),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            artifact_max_age: Duration::from_secs(DEFAULT_ARTIFACT_MAX_AGE_SECS),
            metadata_cache_ttl: Duration::from_secs(DEFAULT_METADATA_CACHE_TTL_SECS),
            metadata_timeout: Duration::from_secs(DEFAULT_METADATA_TIMEOUT_SECS),
            metadata_retry_attempts: DEFAULT_METADATA_RETRY_ATTEMPTS,
            metadata_retry_delay: Duration::from_millis(DEFAULT_METADATA_RETRY_DELAY_MS),
            outbound_rate_limit: None,
            keepalive: Duration::from_secs(DEFAULT_KEEPALIVE_SECS),
            log_dir: None,
        }
    }
}

/// Values supplied on the command line. They win over the environment and
/// the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub download_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub max_concurrent: Option<usize>,
    pub ytdlp_bin: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeConfig {
    build_runtime_config_with_overrides(file_vars, env_lookup, RuntimeOverrides::default())
}

fn build_runtime_config_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let defaults = RuntimeConfig::default();

    let download_root = overrides
        .download_root
        .or_else(|| lookup("DOWNLOAD_ROOT").map(PathBuf::from))
        .unwrap_or(defaults.download_root);
    let port = overrides
        .port
        .or_else(|| parsed(&lookup, "TUBEFETCH_PORT"))
        .or_else(|| parsed(&lookup, "PORT"))
        .unwrap_or(defaults.port);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup("TUBEFETCH_HOST"))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or(defaults.host);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup("YTDLP_BIN").map(PathBuf::from))
        .unwrap_or(defaults.ytdlp_bin);
    let max_concurrent = overrides
        .max_concurrent
        .or_else(|| parsed(&lookup, "MAX_CONCURRENT_DOWNLOADS"))
        .unwrap_or(defaults.max_concurrent)
        .max(1);
    let log_dir = overrides
        .log_dir
        .or_else(|| lookup("LOG_DIR").map(PathBuf::from));

    let secs = |key: &str, default: Duration| {
        parsed::<u64>(&lookup, key)
            .map(Duration::from_secs)
            .unwrap_or(default)
    };

    RuntimeConfig {
        download_root,
        host,
        port,
        ytdlp_bin,
        max_concurrent,
        download_timeout: secs("DOWNLOAD_TIMEOUT_SECS", defaults.download_timeout),
        retention: secs("FILE_RETENTION_SECS", defaults.retention),
        artifact_max_age: secs("ARTIFACT_MAX_AGE_SECS", defaults.artifact_max_age),
        metadata_cache_ttl: secs("METADATA_CACHE_TTL_SECS", defaults.metadata_cache_ttl),
        metadata_timeout: secs("METADATA_TIMEOUT_SECS", defaults.metadata_timeout),
        metadata_retry_attempts: parsed(&lookup, "METADATA_RETRY_ATTEMPTS")
            .unwrap_or(defaults.metadata_retry_attempts)
            .max(1),
        metadata_retry_delay: parsed::<u64>(&lookup, "METADATA_RETRY_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(defaults.metadata_retry_delay),
        outbound_rate_limit: lookup("OUTBOUND_RATE_LIMIT"),
        keepalive: secs("KEEPALIVE_SECS", defaults.keepalive).max(Duration::from_secs(1)),
        log_dir,
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|value| value.trim().parse::<T>().ok())
}

/// Blank values count as unset wherever they come from.
fn non_blank(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().as_deref().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .as_deref()
        .and_then(non_blank)
        .or_else(|| file_vars.get(key).cloned())
}

/// Reads `KEY=value` pairs. A missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(err).with_context(|| format!("Reading {}", path.display())),
    };
    Ok(content.lines().filter_map(parse_env_line).collect())
}

/// One `.env` line: optional `export`, optional matching quotes around the
/// value. Comments, malformed lines and blank values yield `None`.
fn parse_env_line(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line);
    let (key, raw) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    let raw = raw.trim();
    let unquoted = ['"', '\'']
        .into_iter()
        .find_map(|quote| raw.strip_prefix(quote)?.strip_suffix(quote))
        .unwrap_or(raw);
    Some((key.to_string(), non_blank(unquoted)?))
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

    fn runtime_from(contents: &str) -> RuntimeConfig {
        let cfg = make_config(contents);
        let vars = read_env_file(cfg.path()).unwrap();
        build_runtime_config(&vars, |_| None)
    }

    #[test]
    fn empty_file_uses_defaults() {
        let runtime = runtime_from("");
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.host, DEFAULT_HOST);
        assert_eq!(runtime.download_root, PathBuf::from(DEFAULT_DOWNLOAD_ROOT));
        assert_eq!(runtime.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert_eq!(
            runtime.download_timeout,
            Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS)
        );
        assert!(runtime.outbound_rate_limit.is_none());
        assert!(runtime.log_dir.is_none());
    }

    #[test]
    fn reads_job_limits() {
        let runtime = runtime_from(
            "MAX_CONCURRENT_DOWNLOADS=\"7\"\nDOWNLOAD_TIMEOUT_SECS=90\nFILE_RETENTION_SECS=5\nOUTBOUND_RATE_LIMIT=2M\n",
        );
        assert_eq!(runtime.max_concurrent, 7);
        assert_eq!(runtime.download_timeout, Duration::from_secs(90));
        assert_eq!(runtime.retention, Duration::from_secs(5));
        assert_eq!(runtime.outbound_rate_limit.as_deref(), Some("2M"));
    }

    #[test]
    fn reads_metadata_retry_settings() {
        let runtime = runtime_from(
            "METADATA_RETRY_ATTEMPTS=5\nMETADATA_RETRY_DELAY_MS=250\nMETADATA_CACHE_TTL_SECS=60\n",
        );
        assert_eq!(runtime.metadata_retry_attempts, 5);
        assert_eq!(runtime.metadata_retry_delay, Duration::from_millis(250));
        assert_eq!(runtime.metadata_cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let runtime = runtime_from("MAX_CONCURRENT_DOWNLOADS=0\nMETADATA_RETRY_ATTEMPTS=0\n");
        assert_eq!(runtime.max_concurrent, 1);
        assert_eq!(runtime.metadata_retry_attempts, 1);
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let runtime = runtime_from("TUBEFETCH_PORT=nope\nMAX_CONCURRENT_DOWNLOADS=-4\n");
        assert_eq!(runtime.port, DEFAULT_PORT);
        assert_eq!(runtime.max_concurrent, DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn generic_port_is_accepted() {
        let runtime = runtime_from("PORT=4242\n");
        assert_eq!(runtime.port, 4242);
        let runtime = runtime_from("PORT=4242\nTUBEFETCH_PORT=5151\n");
        assert_eq!(runtime.port, 5151);
    }

    #[test]
    fn env_wins_over_file() {
        let vars = read_env_file(make_config("DOWNLOAD_ROOT=\"/file\"\n").path()).unwrap();
        let runtime = build_runtime_config(&vars, |key| {
            if key == "DOWNLOAD_ROOT" {
                Some("/env".to_string())
            } else {
                None
            }
        });
        assert_eq!(runtime.download_root, PathBuf::from("/env"));
    }

    #[test]
    fn read_env_file_handles_export_and_quotes() {
        let cfg = make_config(
            r#"
            export DOWNLOAD_ROOT="/media"
            YTDLP_BIN='/opt/yt-dlp'
            TUBEFETCH_HOST =  "0.0.0.0"
            TUBEFETCH_PORT=9090
            # comment
            INVALID_LINE
            "#,
        );
        let vars = read_env_file(cfg.path()).unwrap();
        assert_eq!(vars.get("DOWNLOAD_ROOT").unwrap(), "/media");
        assert_eq!(vars.get("YTDLP_BIN").unwrap(), "/opt/yt-dlp");
        assert_eq!(vars.get("TUBEFETCH_HOST").unwrap(), "0.0.0.0");
        assert_eq!(vars.get("TUBEFETCH_PORT").unwrap(), "9090");
        assert!(!vars.contains_key("INVALID_LINE"));
    }

    #[test]
    fn env_lines_trim_inside_quotes_and_skip_blanks() {
        assert_eq!(
            parse_env_line(r#"YTDLP_BIN=" /opt/yt-dlp ""#),
            Some(("YTDLP_BIN".into(), "/opt/yt-dlp".into()))
        );
        assert_eq!(parse_env_line("LOG_DIR=''"), None);
        assert_eq!(parse_env_line("LOG_DIR=   "), None);
        assert_eq!(parse_env_line("=value"), None);
        assert_eq!(parse_env_line("  # DOWNLOAD_ROOT=/x"), None);
        assert_eq!(
            parse_env_line("OUTBOUND_RATE_LIMIT=\"2M'"),
            Some(("OUTBOUND_RATE_LIMIT".into(), "\"2M'".into()))
        );
    }

    #[test]
    fn blank_env_value_falls_back_to_file() {
        let vars = read_env_file(make_config("DOWNLOAD_ROOT=/file\n").path()).unwrap();
        let runtime = build_runtime_config(&vars, |_| Some("  ".to_string()));
        assert_eq!(runtime.download_root, PathBuf::from("/file"));
    }

    #[test]
    fn read_env_file_missing_file_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let vars = read_env_file(&dir.path().join("missing.env")).unwrap();
        assert!(vars.is_empty());
    }

    #[test]
    fn override_precedence() {
        let mut vars = HashMap::new();
        vars.insert("DOWNLOAD_ROOT".to_string(), "/file-root".to_string());
        vars.insert("TUBEFETCH_HOST".to_string(), "file-host".to_string());
        vars.insert("TUBEFETCH_PORT".to_string(), "7000".to_string());
        vars.insert("MAX_CONCURRENT_DOWNLOADS".to_string(), "2".to_string());

        let overrides = RuntimeOverrides {
            download_root: Some(PathBuf::from("/override-root")),
            port: Some(9000),
            host: Some("override-host".into()),
            max_concurrent: None,
            ..RuntimeOverrides::default()
        };

        let runtime = build_runtime_config_with_overrides(
            &vars,
            |key| {
                if key == "MAX_CONCURRENT_DOWNLOADS" {
                    Some("5".to_string())
                } else if key == "TUBEFETCH_PORT" {
                    Some("8000".to_string())
                } else {
                    None
                }
            },
            overrides,
        );

        assert_eq!(runtime.download_root, PathBuf::from("/override-root"));
        assert_eq!(runtime.port, 9000);
        assert_eq!(runtime.host, "override-host");
        assert_eq!(runtime.max_concurrent, 5);
    }

    #[test]
    fn blank_host_override_is_ignored() {
        let vars = HashMap::new();
        let runtime = build_runtime_config_with_overrides(
            &vars,
            |_| None,
            RuntimeOverrides {
                host: Some("   ".into()),
                ..RuntimeOverrides::default()
            },
        );
        assert_eq!(runtime.host, DEFAULT_HOST);
    }
}
