use crate::launcher::ServerCommand;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "PCAT_CONFIG";
pub const DEFAULT_URL: &str = "http://127.0.0.1:8000/prune";
const DEFAULT_START_TIMEOUT_SECS: f64 = 20.0;
const DEFAULT_REQUEST_TIMEOUT_SECS: f64 = 180.0;

/// On-disk configuration (`~/.config/pcat/config.toml`). Every field is
/// optional; CLI flags and environment variables take precedence.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<PathBuf>,
    #[serde(default = "bool_true")]
    pub auto_start: bool,
    #[serde(default = "ServerConfig::default_start_timeout_secs")]
    pub start_timeout_secs: f64,
    #[serde(default = "ServerConfig::default_request_timeout_secs")]
    pub request_timeout_secs: f64,
    /// Server executable; `--host/--port/--model-path` are appended to `args`.
    #[serde(default = "ServerConfig::default_program")]
    pub program: String,
    #[serde(default = "ServerConfig::default_args")]
    pub args: Vec<String>,
}

fn bool_true() -> bool {
    true
}

impl ServerConfig {
    fn default_start_timeout_secs() -> f64 {
        DEFAULT_START_TIMEOUT_SECS
    }
    fn default_request_timeout_secs() -> f64 {
        DEFAULT_REQUEST_TIMEOUT_SECS
    }
    fn default_program() -> String {
        ServerCommand::default().program
    }
    fn default_args() -> Vec<String> {
        ServerCommand::default().args
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: None,
            model_path: None,
            log_path: None,
            auto_start: true,
            start_timeout_secs: Self::default_start_timeout_secs(),
            request_timeout_secs: Self::default_request_timeout_secs(),
            program: Self::default_program(),
            args: Self::default_args(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: None,
        }
    }
}

impl Config {
    /// Load from `path`, or the default when the file does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }
}

/// `PCAT_CONFIG` when set, else `<config dir>/pcat/config.toml`.
pub fn config_path(env_override: Option<PathBuf>) -> PathBuf {
    if let Some(path) = env_override {
        return expand_tilde(&path);
    }
    let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
    config_dir.join("pcat").join("config.toml")
}

// ── Resolved settings ───────────────────────────────────────

/// Values given on the command line (clap already folded in `PRUNER_URL` and
/// `SWEPRUNER_MODEL_PATH`).
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub url: Option<String>,
    pub model_path: Option<PathBuf>,
    pub server_log: Option<PathBuf>,
    pub cache_dir: Option<PathBuf>,
    pub no_cache: bool,
    pub no_auto_start: bool,
    pub start_timeout_secs: Option<f64>,
    pub request_timeout_secs: Option<f64>,
}

/// Fully resolved settings, built once in `main` and passed down.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Prune endpoint as given; callers normalize before connecting.
    pub url: String,
    pub model_path: PathBuf,
    pub server_log: PathBuf,
    pub cache_dir: PathBuf,
    pub cache_enabled: bool,
    pub auto_start: bool,
    pub start_timeout: Duration,
    pub request_timeout: Duration,
    pub server_command: ServerCommand,
}

impl Settings {
    /// Flag/env > config file > built-in default.
    pub fn resolve(overrides: &Overrides, config: &Config) -> Self {
        let base = tool_cache_dir();
        let path_or = |flag: &Option<PathBuf>, file: &Option<PathBuf>, default: PathBuf| {
            flag.as_ref()
                .or(file.as_ref())
                .map(|p| absolute(&expand_tilde(p)))
                .unwrap_or(default)
        };

        Settings {
            url: overrides
                .url
                .clone()
                .or_else(|| config.server.url.clone())
                .unwrap_or_else(|| DEFAULT_URL.to_string()),
            model_path: path_or(
                &overrides.model_path,
                &config.server.model_path,
                base.join("model"),
            ),
            server_log: path_or(
                &overrides.server_log,
                &config.server.log_path,
                base.join("server.log"),
            ),
            cache_dir: path_or(
                &overrides.cache_dir,
                &config.cache.dir,
                base.join("pcat-cache"),
            ),
            cache_enabled: config.cache.enabled && !overrides.no_cache,
            auto_start: config.server.auto_start && !overrides.no_auto_start,
            start_timeout: secs(
                overrides
                    .start_timeout_secs
                    .unwrap_or(config.server.start_timeout_secs),
                DEFAULT_START_TIMEOUT_SECS,
            ),
            request_timeout: secs(
                overrides
                    .request_timeout_secs
                    .unwrap_or(config.server.request_timeout_secs),
                DEFAULT_REQUEST_TIMEOUT_SECS,
            ),
            server_command: ServerCommand {
                program: config.server.program.clone(),
                args: config.server.args.clone(),
            },
        }
    }
}

/// `~/.cache/swe-pruner`, shared with the pruner server's own tooling.
pub fn tool_cache_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".cache")
        .join("swe-pruner")
}

pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn secs(value: f64, fallback: f64) -> Duration {
    Duration::try_from_secs_f64(value)
        .unwrap_or_else(|_| Duration::from_secs_f64(fallback))
}

pub fn show_config(path: &Path, settings: &Settings) -> Result<()> {
    println!("Config: {}", path.display());
    if !path.exists() {
        println!("(file not created, using defaults)");
    }
    println!();

    let effective = Config {
        server: ServerConfig {
            url: Some(settings.url.clone()),
            model_path: Some(settings.model_path.clone()),
            log_path: Some(settings.server_log.clone()),
            auto_start: settings.auto_start,
            start_timeout_secs: settings.start_timeout.as_secs_f64(),
            request_timeout_secs: settings.request_timeout.as_secs_f64(),
            program: settings.server_command.program.clone(),
            args: settings.server_command.args.clone(),
        },
        cache: CacheConfig {
            enabled: settings.cache_enabled,
            dir: Some(settings.cache_dir.clone()),
        },
    };
    print!("{}", toml::to_string_pretty(&effective)?);
    Ok(())
}
