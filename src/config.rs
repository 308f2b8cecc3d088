//! Configuration management
//!
//! Server, database, LLM and learning-pipeline settings, stored as TOML in the
//! platform config directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Overrides the config file location
pub const CONFIG_ENV: &str = "ACE_CONFIG";
/// Overrides `database.path`
pub const DATABASE_PATH_ENV: &str = "ACE_DATABASE_PATH";
/// API key lookup order when `llm.api_key` is unset
pub const API_KEY_ENVS: [&str; 2] = ["ACE_LLM_API_KEY", "OPENAI_API_KEY"];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP listener
    #[serde(default)]
    pub server: ServerConfig,
    /// Record store location
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Reflector and curator model settings
    #[serde(default)]
    pub llm: LlmConfig,
    /// Learn job execution
    #[serde(default)]
    pub learning: LearningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file; defaults to `ace.db` in the platform data directory
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible API root
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Use a different model for reflection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflector_model: Option<String>,
    /// Use a different model for curation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curator_model: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Prefer the environment; only set this in a file you keep private
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_tokens() -> u32 {
    4096
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            reflector_model: None,
            curator_model: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            api_key: None,
        }
    }
}

impl LlmConfig {
    pub fn reflector_model(&self) -> &str {
        self.reflector_model.as_deref().unwrap_or(&self.model)
    }

    pub fn curator_model(&self) -> &str {
        self.curator_model.as_deref().unwrap_or(&self.model)
    }

    /// Configured key, else the first key found in the environment
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.clone().or_else(|| {
            API_KEY_ENVS
                .iter()
                .find_map(|name| std::env::var(name).ok())
                .filter(|key| !key.trim().is_empty())
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningConfig {
    /// Concurrent learn jobs
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bullets embedded when a request does not say
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_workers() -> usize {
    4
}

fn default_k() -> usize {
    crate::retrieval::DEFAULT_K
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            default_k: default_k(),
            retry: RetryConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Retry policy for reflector and curator calls
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// Per-step time limits, in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_capability_secs")]
    pub reflector_secs: u64,
    #[serde(default = "default_capability_secs")]
    pub curator_secs: u64,
    #[serde(default = "default_apply_secs")]
    pub apply_secs: u64,
}

fn default_capability_secs() -> u64 {
    300
}

fn default_apply_secs() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reflector_secs: default_capability_secs(),
            curator_secs: default_capability_secs(),
            apply_secs: default_apply_secs(),
        }
    }
}

impl TimeoutConfig {
    pub fn reflector(&self) -> Duration {
        Duration::from_secs(self.reflector_secs)
    }

    pub fn curator(&self) -> Duration {
        Duration::from_secs(self.curator_secs)
    }

    pub fn apply(&self) -> Duration {
        Duration::from_secs(self.apply_secs)
    }
}

impl Config {
    /// Load configuration from `ACE_CONFIG` or the platform config file,
    /// writing defaults on first run
    pub fn load() -> Result<Self> {
        let path = match std::env::var_os(CONFIG_ENV) {
            Some(path) => PathBuf::from(path),
            None => config_path()?,
        };
        let mut config = Self::load_from(&path)?;
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    /// Load configuration from file
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Apply environment overrides
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var(DATABASE_PATH_ENV).filter(|p| !p.trim().is_empty()) {
            self.database.path = Some(PathBuf::from(path));
        }
    }

    /// Database file to open
    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database.path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("ace.db")),
        }
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "ace", "ace-service")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "ace", "ace-service")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Print the effective configuration as TOML, with the API key masked
pub fn show_config(config: &Config) -> Result<()> {
    let mut shown = config.clone();
    let key_source = if shown.llm.api_key.is_some() {
        "config file"
    } else if shown.llm.resolved_api_key().is_some() {
        "environment"
    } else {
        "not set"
    };
    shown.llm.api_key = shown.llm.api_key.map(|_| "********".to_string());

    println!("{}", toml::to_string_pretty(&shown).context("Failed to serialize config")?);
    println!("# database: {}", config.database_path()?.display());
    println!("# llm api key: {}", key_source);

    Ok(())
}
