use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    extractor::DEFAULT_YTDLP_BIN,
    orchestrator::DEFAULT_DOWNLOAD_TIMEOUT,
    sessions::{DEFAULT_MIN_DELTA, DEFAULT_MIN_INTERVAL, DEFAULT_QUEUE_CAPACITY, ThrottlePolicy},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8000;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_CORS_ORIGINS: &str = "http://localhost:5173";

const KEY_HOST: &str = "TUBEFETCH_HOST";
const KEY_PORT: &str = "TUBEFETCH_PORT";
const KEY_YTDLP_BIN: &str = "TUBEFETCH_YTDLP_BIN";
const KEY_FFMPEG_LOCATION: &str = "TUBEFETCH_FFMPEG_LOCATION";
const KEY_TEMP_ROOT: &str = "TUBEFETCH_TEMP_ROOT";
const KEY_TIMEOUT: &str = "TUBEFETCH_DOWNLOAD_TIMEOUT_SECS";
const KEY_PROGRESS_INTERVAL: &str = "TUBEFETCH_PROGRESS_INTERVAL_MS";
const KEY_PROGRESS_DELTA: &str = "TUBEFETCH_PROGRESS_MIN_DELTA";
const KEY_CORS_ORIGINS: &str = "TUBEFETCH_CORS_ORIGINS";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub ytdlp_bin: PathBuf,
    pub ffmpeg_location: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,
    pub download_timeout: Duration,
    pub throttle: ThrottlePolicy,
    pub queue_capacity: usize,
    pub cors_origins: Vec<String>,
}

impl Settings {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub fn load_settings() -> Result<Settings> {
    resolve_settings(SettingsOverrides::default())
}

/// Values supplied on the command line; they win over env and `.env`.
#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_bin: Option<PathBuf>,
    pub download_timeout_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let lookup = |key: &str| lookup_value(key, file_vars, &env_lookup);
    let parsed = |key: &str| lookup(key).and_then(|value| value.parse::<f64>().ok());

    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup(KEY_HOST))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let port = overrides
        .port
        .or_else(|| lookup(KEY_PORT).and_then(|value| value.parse::<u16>().ok()))
        .unwrap_or(DEFAULT_PORT);
    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup(KEY_YTDLP_BIN).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP_BIN));
    let download_timeout = overrides
        .download_timeout_secs
        .or_else(|| lookup(KEY_TIMEOUT).and_then(|value| value.parse::<u64>().ok()))
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT);

    let min_interval = lookup(KEY_PROGRESS_INTERVAL)
        .and_then(|value| value.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_MIN_INTERVAL);
    let min_delta = parsed(KEY_PROGRESS_DELTA)
        .filter(|delta| delta.is_finite() && *delta >= 0.0)
        .unwrap_or(DEFAULT_MIN_DELTA);

    let cors_origins = lookup(KEY_CORS_ORIGINS)
        .unwrap_or_else(|| DEFAULT_CORS_ORIGINS.to_string())
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .map(str::to_string)
        .collect();

    Settings {
        host,
        port,
        ytdlp_bin,
        ffmpeg_location: lookup(KEY_FFMPEG_LOCATION).map(PathBuf::from),
        temp_root: lookup(KEY_TEMP_ROOT).map(PathBuf::from),
        download_timeout,
        throttle: ThrottlePolicy {
            min_interval,
            min_delta,
        },
        queue_capacity: DEFAULT_QUEUE_CAPACITY,
        cors_origins,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .filter(|value| !value.trim().is_empty())
}

/// Parses a dotenv-style file. A missing file yields no values.
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
