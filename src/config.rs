//! TOML configuration for the FormProbe daemon.
//!
//! Layered model: compiled-in defaults, overridden by a TOML file whose path
//! comes from `FORMPROBE_CONFIG` or a standard location.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// How a run that finished as `completed` (submitted, no success indicator
/// configured) counts in schedule statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletedPolicy {
    Success,
    Failed,
}

/// Root configuration for the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// API bind address.
    #[serde(default = "default_bind")]
    pub bind: String,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Directory holding per-test screenshot subdirectories.
    #[serde(default = "default_screenshot_dir")]
    pub screenshot_dir: String,

    /// WebDriver endpoint used to launch browser sessions.
    #[serde(default = "default_webdriver_url")]
    pub webdriver_url: String,

    /// Seconds between sweeps for due schedules.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Overall per-run deadline in seconds. A run exceeding it is recorded
    /// as failed rather than left hanging.
    #[serde(default = "default_run_deadline_secs")]
    pub run_deadline_secs: u64,

    /// Statistics policy for `completed` runs. Defaults to `failed`, which
    /// matches how the dashboard has historically counted them.
    #[serde(default = "default_completed_policy")]
    pub completed_counts_as: CompletedPolicy,

    /// Validity window for signed screenshot URLs, in seconds.
    #[serde(default = "default_signed_url_ttl_secs")]
    pub signed_url_ttl_secs: u64,

    /// Key for signing screenshot URLs. Generated at startup when unset,
    /// which invalidates previously issued URLs across restarts.
    #[serde(default)]
    pub url_signing_key: Option<String>,

    /// Include full error detail in 500 responses (development only).
    #[serde(default)]
    pub dev_errors: bool,
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_db_path() -> String {
    "data/formprobe.db".to_string()
}

fn default_screenshot_dir() -> String {
    "data/screenshots".to_string()
}

fn default_webdriver_url() -> String {
    "http://127.0.0.1:4444".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    10
}

fn default_run_deadline_secs() -> u64 {
    120
}

fn default_completed_policy() -> CompletedPolicy {
    CompletedPolicy::Failed
}

fn default_signed_url_ttl_secs() -> u64 {
    3600
}

impl Default for Config {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Try to load configuration from, in order:
    /// 1. The path in the `FORMPROBE_CONFIG` environment variable.
    /// 2. `/etc/formprobe/formprobe.toml`.
    /// 3. Compiled-in defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var("FORMPROBE_CONFIG") {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "config from env var unusable, falling back");
                }
            }
        }

        let system_path = Path::new("/etc/formprobe/formprobe.toml");
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(error = %e, "system config unusable, falling back to defaults");
                }
            }
        }

        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.bind, "0.0.0.0:8080");
        assert_eq!(cfg.sweep_interval_secs, 10);
        assert_eq!(cfg.completed_counts_as, CompletedPolicy::Failed);
        assert!(cfg.url_signing_key.is_none());
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: Config = toml::from_str(
            r#"
            bind = "127.0.0.1:9000"
            completed_counts_as = "success"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:9000");
        assert_eq!(cfg.completed_counts_as, CompletedPolicy::Success);
        assert_eq!(cfg.db_path, "data/formprobe.db");
    }
}
