// SPDX-License-Identifier: MIT
//! Daemon configuration.
//!
//! Priority (highest to lowest): CLI / env var > `{data_dir}/config.toml` >
//! built-in default. The TOML layer is entirely optional — a missing or
//! unparseable file logs and falls through to defaults.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::error;

use crate::lens;

const DEFAULT_PORT: u16 = 4850;
const DEFAULT_CONCURRENCY: usize = 3;
const DEFAULT_AI_TIMEOUT_SECS: u64 = 120;
const DEFAULT_GRACE_SECS: u64 = 30;

/// Hard cap on reviewable diff size, enforced before any AI call.
pub const DEFAULT_MAX_DIFF_BYTES: usize = 524_288;

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

// ─── AI provider section ──────────────────────────────────────────────────────

/// `[ai]` in config.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Provider id: "openai" | "openai_compatible" | "ollama".
    pub provider: String,
    /// Base URL override. Empty = provider default.
    pub base_url: String,
    /// API key. The `REVD_API_KEY` env var takes precedence.
    pub api_key: String,
    pub model: String,
    /// Per-call timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            base_url: String::new(),
            api_key: String::new(),
            model: "gpt-4o-mini".to_string(),
            timeout_secs: DEFAULT_AI_TIMEOUT_SECS,
        }
    }
}

// ─── Review section ───────────────────────────────────────────────────────────

/// `[review]` in config.toml.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReviewConfig {
    /// How many lenses may be inside their AI call at once.
    pub concurrency: usize,
    /// When true, a run only fails once every attempted lens has failed;
    /// when false, any lens failure fails the run.
    pub partial_on_all_failed: bool,
    /// Hard diff size cap in bytes.
    pub max_diff_bytes: usize,
    /// Lens ids to run. Empty = full catalogue.
    pub lenses: Vec<String>,
    /// Path prefixes excluded from every diff before review.
    pub ignore_paths: Vec<String>,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            partial_on_all_failed: true,
            max_diff_bytes: DEFAULT_MAX_DIFF_BYTES,
            lenses: lens::default_lens_ids(),
            ignore_paths: vec![
                "node_modules/".to_string(),
                "target/".to_string(),
                "vendor/".to_string(),
            ],
        }
    }
}

// ─── TOML config file ─────────────────────────────────────────────────────────

/// `{data_dir}/config.toml` — all fields are optional overrides.
#[derive(Deserialize, Default)]
struct TomlConfig {
    /// REST server port (default: 4850).
    port: Option<u16>,
    /// Bind address (default: "127.0.0.1").
    bind_address: Option<String>,
    /// Log level filter string, e.g. "debug", "info,revd=trace" (default: "info").
    log: Option<String>,
    /// Log output format: "pretty" (default) | "json".
    log_format: Option<String>,
    /// Seconds a completed session stays readable before eviction (default: 30).
    session_grace_secs: Option<u64>,
    /// AI provider configuration (`[ai]`).
    ai: Option<AiConfig>,
    /// Review policy (`[review]`).
    review: Option<ReviewConfig>,
}

fn load_toml(data_dir: &Path) -> Option<TomlConfig> {
    let path = data_dir.join("config.toml");
    let contents = std::fs::read_to_string(&path).ok()?;
    match toml::from_str::<TomlConfig>(&contents) {
        Ok(cfg) => Some(cfg),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}

// ─── RevdConfig ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RevdConfig {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log: String,
    pub log_format: String,
    pub session_grace_secs: u64,
    pub ai: AiConfig,
    pub review: ReviewConfig,
}

impl RevdConfig {
    /// Build config from CLI/env args + optional TOML file.
    pub fn new(port: Option<u16>, data_dir: Option<PathBuf>, log: Option<String>) -> Self {
        let data_dir = data_dir.unwrap_or_else(default_data_dir);
        let toml = load_toml(&data_dir).unwrap_or_default();

        let port = port.or(toml.port).unwrap_or(DEFAULT_PORT);
        let log = log.or(toml.log).unwrap_or_else(|| "info".to_string());

        let bind_address = std::env::var("REVD_BIND")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.bind_address)
            .unwrap_or_else(default_bind_address);

        let log_format = std::env::var("REVD_LOG_FORMAT")
            .ok()
            .filter(|s| !s.is_empty())
            .or(toml.log_format)
            .unwrap_or_else(|| "pretty".to_string());

        let session_grace_secs = toml.session_grace_secs.unwrap_or(DEFAULT_GRACE_SECS);

        let mut ai = toml.ai.unwrap_or_default();
        if let Ok(key) = std::env::var("REVD_API_KEY") {
            if !key.is_empty() {
                ai.api_key = key;
            }
        }
        if let Ok(model) = std::env::var("REVD_MODEL") {
            if !model.is_empty() {
                ai.model = model;
            }
        }

        let review = toml.review.unwrap_or_default();

        Self {
            port,
            bind_address,
            data_dir,
            log,
            log_format,
            session_grace_secs,
            ai,
            review,
        }
    }
}

fn default_data_dir() -> PathBuf {
    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home)
                .join("Library")
                .join("Application Support")
                .join("revd");
        }
    }
    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_DATA_HOME") {
            return PathBuf::from(xdg).join("revd");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".local").join("share").join("revd");
        }
    }
    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("revd");
        }
    }
    PathBuf::from(".revd")
}

// ─── Tests ────────────────────────────────────────────────────────────────────
