//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.palaver/config.json`) and environment.
//! Server URLs can be overridden with `PALAVER_SERVER_URL` and `PALAVER_ADMIN_URL`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Inference server and admin endpoint settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Context compaction limits.
    #[serde(default)]
    pub context: ContextConfig,

    /// Override the data directory (chats, bots, state). Defaults to the config file's parent.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,

    /// Sampling temperature for newly created chats (default 0.7).
    #[serde(default = "default_temperature")]
    pub default_temperature: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            context: ContextConfig::default(),
            data_dir: None,
            default_temperature: default_temperature(),
        }
    }
}

/// Where the inference server lives and how long to wait on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Server root serving `/v1/chat/completions` and `/v1/models` (default "http://127.0.0.1:8000").
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Admin root serving `/admin/switch_model` (default "http://127.0.0.1:9000").
    #[serde(default = "default_admin_url")]
    pub admin_url: String,

    /// Read timeout for streaming completions.
    #[serde(default = "default_stream_timeout_secs")]
    pub stream_timeout_secs: u64,

    /// Timeout for the blocking summarization request.
    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,

    /// Timeout for the model switch request.
    #[serde(default = "default_admin_timeout_secs")]
    pub admin_timeout_secs: u64,

    /// Timeout for each model-listing request (liveness polls and active model lookups).
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,

    /// How long to wait for the server to come back after a model switch.
    #[serde(default = "default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Delay between liveness polls.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_admin_url() -> String {
    "http://127.0.0.1:9000".to_string()
}

fn default_stream_timeout_secs() -> u64 {
    600
}

fn default_summary_timeout_secs() -> u64 {
    300
}

fn default_admin_timeout_secs() -> u64 {
    5
}

fn default_poll_timeout_secs() -> u64 {
    2
}

fn default_ready_timeout_secs() -> u64 {
    120
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_temperature() -> f64 {
    0.7
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            admin_url: default_admin_url(),
            stream_timeout_secs: default_stream_timeout_secs(),
            summary_timeout_secs: default_summary_timeout_secs(),
            admin_timeout_secs: default_admin_timeout_secs(),
            poll_timeout_secs: default_poll_timeout_secs(),
            ready_timeout_secs: default_ready_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ServerConfig {
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_timeout_secs)
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Context compaction limits. See [`crate::context::CompactionPolicy`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextConfig {
    /// History length above which old messages are summarized (default 24).
    #[serde(default = "default_summary_trigger_count")]
    pub summary_trigger_count: usize,

    /// Number of most recent messages kept verbatim once summarizing (default 16).
    #[serde(default = "default_max_context_messages")]
    pub max_context_messages: usize,

    /// `max_tokens` for the summarization request (default 512).
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn default_summary_trigger_count() -> usize {
    24
}

fn default_max_context_messages() -> usize {
    16
}

fn default_summary_max_tokens() -> u32 {
    512
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            summary_trigger_count: default_summary_trigger_count(),
            max_context_messages: default_max_context_messages(),
            summary_max_tokens: default_summary_max_tokens(),
        }
    }
}

fn env_override(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

/// Resolve the inference server root: env PALAVER_SERVER_URL overrides config.
pub fn resolve_base_url(config: &Config) -> String {
    env_override("PALAVER_SERVER_URL")
        .unwrap_or_else(|| config.server.base_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the admin root: env PALAVER_ADMIN_URL overrides config.
pub fn resolve_admin_url(config: &Config) -> String {
    env_override("PALAVER_ADMIN_URL")
        .unwrap_or_else(|| config.server.admin_url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("PALAVER_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            dirs::home_dir()
                .map(|h| h.join(".palaver").join("config.json"))
                .unwrap_or_else(|| PathBuf::from("config.json"))
        })
}

/// Load config from the given path, or the default path (or PALAVER_CONFIG_PATH). Missing file => default config.
/// Returns the config and the path that was used (for resolving the data directory).
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        serde_json::from_str(&s)
            .with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Resolve the data directory: `config.data_dir` if set (relative paths resolved against the config file's parent), otherwise the config file's parent.
pub fn resolve_data_dir(config: &Config, config_path: &Path) -> PathBuf {
    let config_parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    match &config.data_dir {
        Some(d) if !d.as_os_str().is_empty() => {
            if d.is_absolute() {
                d.clone()
            } else {
                config_parent.join(d)
            }
        }
        _ => config_parent.to_path_buf(),
    }
}
