//! Service configuration.
//!
//! Values come from environment variables. An optional env file (default
//! `config/local.env`, overridable with `URL_BUNDLER_ENV_FILE`) supplies any
//! variable the environment leaves unset.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_FILE_VAR: &str = "URL_BUNDLER_ENV_FILE";
const DEFAULT_ENV_FILE: &str = "config/local.env";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("Failed to load env file {path}: {source}")]
    EnvFile {
        path: String,
        #[source]
        source: dotenvy::Error,
    },
}

/// What to do with a download whose body is larger than the byte cap.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TruncationPolicy {
    /// Count the download as failed and discard the partial file.
    #[default]
    Fail,
    /// Keep the first `download_max_bytes` bytes and archive them.
    Keep,
}

impl FromStr for TruncationPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail" => Ok(Self::Fail),
            "keep" => Ok(Self::Keep),
            other => Err(format!("expected `fail` or `keep`, got `{}`", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Admission cap: tasks that have not been observed in a terminal state.
    pub max_active_tasks: usize,
    /// URL quota per task; reaching it launches the pipeline.
    pub max_files_per_task: usize,
    /// Allowed content-type subtypes, lower-cased.
    pub allowed_extensions: HashSet<String>,
    pub download_max_bytes: u64,
    pub probe_timeout: Duration,
    pub download_timeout: Duration,
    pub truncation_policy: TruncationPolicy,
    pub download_dir: PathBuf,
    pub archive_dir: PathBuf,
    /// Prefix of archive locators handed back to clients.
    pub public_base_url: String,
    pub max_concurrent_pipelines: usize,
    /// How long observed terminal tasks are kept. `None` keeps them forever.
    pub task_retention: Option<Duration>,
    pub cancel_pipelines_on_shutdown: bool,
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let host = "localhost".to_string();
        let port = 8080;
        Self {
            public_base_url: format!("http://{}:{}", host, port),
            host,
            port,
            max_active_tasks: 3,
            max_files_per_task: 3,
            allowed_extensions: ["jpeg", "pdf"].iter().map(|s| s.to_string()).collect(),
            download_max_bytes: 50 << 20,
            probe_timeout: Duration::from_secs(5),
            download_timeout: Duration::from_secs(60),
            truncation_policy: TruncationPolicy::Fail,
            download_dir: std::env::temp_dir().join("url-bundler").join("downloads"),
            archive_dir: std::env::temp_dir().join("url-bundler").join("archives"),
            max_concurrent_pipelines: 3,
            task_retention: None,
            cancel_pipelines_on_shutdown: false,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from the process environment, falling back to the
    /// env file (if it exists) for variables the environment does not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let env = |name: &str| std::env::var(name).ok();
        let env_file = env_file_path(&env);
        Self::from_lookup_and_file(env, &env_file)
    }

    /// Like [`Config::from_lookup`], with `env_file` filling in variables `lookup` lacks.
    /// A missing file is not an error.
    pub fn from_lookup_and_file<F>(lookup: F, env_file: &Path) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file_vars = read_env_file(env_file)?;
        Self::from_lookup(|name| lookup(name).or_else(|| file_vars.get(name).cloned()))
    }

    /// Build a config from an arbitrary variable lookup. Missing variables keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);
        let port = parse_var(&lookup, "PORT")?.unwrap_or(defaults.port);

        let max_active_tasks =
            parse_var(&lookup, "MAX_ACTIVE_TASKS")?.unwrap_or(defaults.max_active_tasks);
        if max_active_tasks == 0 {
            return Err(invalid("MAX_ACTIVE_TASKS", "must be at least 1"));
        }

        let max_files_per_task =
            parse_var(&lookup, "MAX_FILES_PER_TASK")?.unwrap_or(defaults.max_files_per_task);
        if max_files_per_task == 0 {
            return Err(invalid("MAX_FILES_PER_TASK", "must be at least 1"));
        }

        let allowed_extensions = match lookup("ALLOWED_EXTENSIONS") {
            Some(raw) => parse_extensions(&raw),
            None => defaults.allowed_extensions,
        };
        if allowed_extensions.is_empty() {
            return Err(invalid("ALLOWED_EXTENSIONS", "no extensions listed"));
        }

        let download_max_bytes =
            parse_var(&lookup, "DOWNLOAD_MAX_BYTES")?.unwrap_or(defaults.download_max_bytes);
        if download_max_bytes == 0 {
            return Err(invalid("DOWNLOAD_MAX_BYTES", "must be positive"));
        }

        let probe_timeout =
            parse_secs(&lookup, "PROBE_TIMEOUT_SECS")?.unwrap_or(defaults.probe_timeout);
        let download_timeout =
            parse_secs(&lookup, "DOWNLOAD_TIMEOUT_SECS")?.unwrap_or(defaults.download_timeout);
        let truncation_policy =
            parse_var(&lookup, "TRUNCATION_POLICY")?.unwrap_or(defaults.truncation_policy);

        let download_dir = lookup("DOWNLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.download_dir);
        let archive_dir = lookup("ARCHIVE_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.archive_dir);

        let public_base_url = lookup("PUBLIC_BASE_URL")
            .map(|s| s.trim_end_matches('/').to_string())
            .unwrap_or_else(|| format!("http://{}:{}", host, port));

        let max_concurrent_pipelines =
            parse_var(&lookup, "MAX_CONCURRENT_PIPELINES")?.unwrap_or(max_active_tasks);
        if max_concurrent_pipelines == 0 {
            return Err(invalid("MAX_CONCURRENT_PIPELINES", "must be at least 1"));
        }

        let task_retention = parse_secs(&lookup, "TASK_RETENTION_SECS")?;
        let cancel_pipelines_on_shutdown = parse_var(&lookup, "CANCEL_PIPELINES_ON_SHUTDOWN")?
            .unwrap_or(defaults.cancel_pipelines_on_shutdown);
        let shutdown_grace =
            parse_secs(&lookup, "SHUTDOWN_GRACE_SECS")?.unwrap_or(defaults.shutdown_grace);

        Ok(Self {
            host,
            port,
            max_active_tasks,
            max_files_per_task,
            allowed_extensions,
            download_max_bytes,
            probe_timeout,
            download_timeout,
            truncation_policy,
            download_dir,
            archive_dir,
            public_base_url,
            max_concurrent_pipelines,
            task_retention,
            cancel_pipelines_on_shutdown,
            shutdown_grace,
        })
    }

    /// Address the HTTP server binds to.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Env file location: `URL_BUNDLER_ENV_FILE`, or `config/local.env`.
fn env_file_path<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup(ENV_FILE_VAR)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_FILE))
}

fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    if !path.exists() {
        tracing::debug!("No env file at {}", path.display());
        return Ok(HashMap::new());
    }

    let env_file_error = |source: dotenvy::Error| ConfigError::EnvFile {
        path: path.display().to_string(),
        source,
    };
    let vars = dotenvy::from_path_iter(path)
        .map_err(env_file_error)?
        .collect::<Result<HashMap<_, _>, _>>()
        .map_err(env_file_error)?;

    tracing::info!("Loaded {} variables from {}", vars.len(), path.display());
    Ok(vars)
}

fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        reason: reason.into(),
    }
}

fn parse_var<F, T>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(name, e.to_string())),
        None => Ok(None),
    }
}

fn parse_secs<F>(lookup: &F, name: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_var::<F, u64>(lookup, name)?.map(Duration::from_secs))
}

fn parse_extensions(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}
