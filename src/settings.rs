use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, bail, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};
use crate::config::{self as policy_config, ValidatedSource};
use crate::logging::DEFAULT_RECENT_LINES;

fn default_log_format() -> LogFormat {
    LogFormat::Json
}

fn default_cache_max_entries() -> usize {
    10_000
}

fn default_negative_ttl() -> u64 {
    300
}

fn default_refresh_low_water() -> u64 {
    30
}

fn default_refresh_poll_interval_ms() -> u64 {
    500
}

fn default_reload_debounce_ms() -> u64 {
    250
}

fn default_policy_poll_interval_ms() -> u64 {
    1_000
}

fn default_preferred_encodings() -> Vec<String> {
    vec!["br".to_string(), "gzip".to_string()]
}

fn default_recent_log_lines() -> usize {
    DEFAULT_RECENT_LINES
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub policy: PathBuf,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: usize,
    #[serde(default = "default_negative_ttl")]
    pub negative_ttl: u64,
    #[serde(default = "default_refresh_low_water")]
    pub refresh_low_water: u64,
    #[serde(default = "default_refresh_poll_interval_ms")]
    pub refresh_poll_interval_ms: u64,
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
    #[serde(default = "default_policy_poll_interval_ms")]
    pub policy_poll_interval_ms: u64,
    #[serde(default = "default_preferred_encodings")]
    pub preferred_encodings: Vec<String>,
    #[serde(default = "default_recent_log_lines")]
    pub recent_log_lines: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();
        let config_path = resolve_config_path(cli)?;

        builder = builder.add_source(File::from(config_path.clone()).required(true));

        builder = builder.add_source(
            Environment::with_prefix("CACHEGATE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("preferred_encodings"),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_base_dir(&config_path);
        if let Some(policy) = cli.policy.as_ref() {
            settings.policy = policy.clone();
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Defaults for everything but the policy path; for hosts that configure
    /// the engine in code.
    pub fn with_policy(policy: impl Into<PathBuf>) -> Self {
        Self {
            policy: policy.into(),
            log: default_log_format(),
            cache_max_entries: default_cache_max_entries(),
            negative_ttl: default_negative_ttl(),
            refresh_low_water: default_refresh_low_water(),
            refresh_poll_interval_ms: default_refresh_poll_interval_ms(),
            reload_debounce_ms: default_reload_debounce_ms(),
            policy_poll_interval_ms: default_policy_poll_interval_ms(),
            preferred_encodings: default_preferred_encodings(),
            recent_log_lines: default_recent_log_lines(),
        }
    }

    /// Loads settings and the policy document they point at. Used by the
    /// preflight binary to fail fast on a broken policy.
    pub fn load_with_policy(cli: &Cli) -> Result<(Self, ValidatedSource)> {
        let settings = Self::load(cli)?;
        let source = settings.load_policy_source()?;
        Ok((settings, source))
    }

    pub fn load_policy_source(&self) -> Result<ValidatedSource> {
        let text = policy_config::read_policy_source(&self.policy)?;
        policy_config::parse_policy_source(&text)
    }

    pub fn negative_ttl(&self) -> Duration {
        Duration::from_secs(self.negative_ttl)
    }

    pub fn refresh_low_water(&self) -> Duration {
        Duration::from_secs(self.refresh_low_water)
    }

    pub fn refresh_poll_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_poll_interval_ms)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }

    pub fn policy_poll_interval(&self) -> Option<Duration> {
        (self.policy_poll_interval_ms > 0).then(|| Duration::from_millis(self.policy_poll_interval_ms))
    }
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}

impl Cli {
    pub fn config_path(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn resolve_config_path(cli: &Cli) -> Result<PathBuf> {
    if let Some(path) = cli.config_path() {
        return Ok(path.to_path_buf());
    }

    for candidate in default_config_candidates() {
        if candidate.exists() {
            return Ok(candidate);
        }
    }

    bail!(
        "no configuration file provided via --config and none found in default locations: {}",
        default_config_candidates()
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn default_config_candidates() -> [PathBuf; 2] {
    [
        PathBuf::from("/etc/cachegate/cachegate.toml"),
        PathBuf::from("cachegate.toml"),
    ]
}

impl Settings {
    fn apply_base_dir(&mut self, config_path: &Path) {
        let base_dir = config_path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        self.policy = absolutize(&self.policy, base_dir);
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            (1..=policy_config::MAX_LRU_ITEMS).contains(&self.cache_max_entries),
            "cache_max_entries must be between 1 and {} (got {})",
            policy_config::MAX_LRU_ITEMS,
            self.cache_max_entries
        );
        ensure!(
            self.negative_ttl > 0,
            "negative_ttl must be greater than 0 seconds (got {})",
            self.negative_ttl
        );
        ensure!(
            self.refresh_poll_interval_ms > 0,
            "refresh_poll_interval_ms must be greater than 0 (got {})",
            self.refresh_poll_interval_ms
        );
        ensure!(
            self.recent_log_lines > 0,
            "recent_log_lines must be greater than 0 (got {})",
            self.recent_log_lines
        );
        for encoding in &self.preferred_encodings {
            let trimmed = encoding.trim();
            ensure!(
                !trimmed.is_empty(),
                "preferred_encodings must not contain empty entries"
            );
            ensure!(
                !trimmed.contains(':') && !trimmed.contains(','),
                "preferred_encodings entry '{}' must be a single content-coding token",
                encoding
            );
        }
        Ok(())
    }
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
