#![forbid(unsafe_code)]

//! Runtime settings for the backend.
//!
//! Values come from, in order of precedence: explicit overrides (command line),
//! the process environment, a `.env` file, and built-in defaults.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::downloader::{DEFAULT_DOWNLOADER_BIN, DEFAULT_MAX_FILESIZE, ToolConfig};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_STORAGE_DIR: &str = "/tmp/ytdl";
pub const DEFAULT_LISTEN_PORT: u16 = 8080;
pub const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
pub const DEFAULT_PUBLIC_DOMAIN: &str = "localhost";

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub storage_dir: PathBuf,
    pub listen_host: String,
    pub listen_port: u16,
    pub downloader_bin: PathBuf,
    pub max_filesize: String,
    pub download_timeout: Option<Duration>,
    /// Host name the bot puts into playback links.
    pub public_domain: String,
    pub telegram_bot_token: Option<String>,
}

impl RuntimeSettings {
    pub fn tool_config(&self) -> ToolConfig {
        ToolConfig {
            program: self.downloader_bin.clone(),
            max_filesize: self.max_filesize.clone(),
            timeout: self.download_timeout,
        }
    }

    /// Base URL of the playback page as seen from outside.
    pub fn listen_base_url(&self) -> String {
        format!("https://{}/listen", self.public_domain)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub storage_dir: Option<PathBuf>,
    pub listen_host: Option<String>,
    pub listen_port: Option<u16>,
    pub downloader_bin: Option<PathBuf>,
    pub max_filesize: Option<String>,
    pub download_timeout: Option<Duration>,
    pub public_domain: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_runtime_settings(&file_vars, env_var_string, overrides))
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeSettings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);

    let storage_dir = overrides
        .storage_dir
        .or_else(|| lookup("STORAGE_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_DIR));
    let listen_host = non_blank(overrides.listen_host)
        .or_else(|| lookup("LISTEN_HOST"))
        .unwrap_or_else(|| DEFAULT_LISTEN_HOST.to_string());
    let listen_port = overrides
        .listen_port
        .or_else(|| lookup("LISTEN_PORT").and_then(|value| value.parse().ok()))
        .unwrap_or(DEFAULT_LISTEN_PORT);
    let downloader_bin = overrides
        .downloader_bin
        .or_else(|| lookup("DOWNLOADER_BIN").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOADER_BIN));
    let max_filesize = overrides
        .max_filesize
        .as_deref()
        .and_then(parse_filesize_limit)
        .or_else(|| lookup("MAX_FILESIZE").as_deref().and_then(parse_filesize_limit))
        .unwrap_or_else(|| DEFAULT_MAX_FILESIZE.to_string());
    let download_timeout = overrides.download_timeout.or_else(|| {
        lookup("DOWNLOAD_TIMEOUT_SECS")
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    });
    let public_domain = non_blank(overrides.public_domain)
        .or_else(|| lookup("PUBLIC_DOMAIN"))
        .unwrap_or_else(|| DEFAULT_PUBLIC_DOMAIN.to_string());
    let telegram_bot_token =
        non_blank(overrides.telegram_bot_token).or_else(|| lookup("TELEGRAM_BOT_TOKEN"));

    RuntimeSettings {
        storage_dir,
        listen_host,
        listen_port,
        downloader_bin,
        max_filesize,
        download_timeout,
        public_domain,
        telegram_bot_token,
    }
}

/// Accepts a size cap for the downloader's format filter: digits with an
/// optional `K`, `M` or `G` suffix (`20M`, `512k`, `1000000`).
pub fn parse_filesize_limit(value: &str) -> Option<String> {
    let value = value.trim();
    let digits = value.strip_suffix(['K', 'M', 'G', 'k', 'm', 'g']).unwrap_or(value);
    (!digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())).then(|| value.to_string())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_var_string(key: &str) -> Option<String> {
    non_blank(env::var(key).ok())
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| non_blank(file_vars.get(key).cloned()))
}

/// Parses a `KEY=value` file. Comments, blank lines, `export ` prefixes and
/// surrounding quotes are handled; a missing file yields no variables.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        vars.insert(key.to_string(), unquote(value.trim()).to_string());
    }
    Ok(vars)
}

fn unquote(value: &str) -> &str {
    ['"', '\'']
        .into_iter()
        .find_map(|quote| {
            value
                .strip_prefix(quote)
                .and_then(|inner| inner.strip_suffix(quote))
        })
        .unwrap_or(value)
}
