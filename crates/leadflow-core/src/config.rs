//! LeadFlow configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{LeadFlowError, Result};

/// Root configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadFlowConfig {
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub defaults: RuleDefaults,
    #[serde(default)]
    pub notify: NotifyConfig,
}

fn default_database_path() -> String { "~/.leadflow/leadflow.db".into() }

impl Default for LeadFlowConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            scheduler: SchedulerConfig::default(),
            defaults: RuleDefaults::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl LeadFlowConfig {
    /// Load config from the default path (~/.leadflow/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| LeadFlowError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| LeadFlowError::Config(format!("Failed to parse config: {e}")))?;
        config.scheduler.validate()?;
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| LeadFlowError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the LeadFlow home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".leadflow")
    }

    /// Database path with `~` expanded.
    pub fn database_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.database_path).to_string())
    }
}

/// Scheduler loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Fixed deployment time zone, as minutes east of UTC (480 = UTC+8).
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,
    /// Maximum candidates per rule per cycle.
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,
    /// Fixed RNG seed for reproducible allocation (None = OS entropy).
    #[serde(default)]
    pub rng_seed: Option<u64>,
}

fn bool_true() -> bool { true }
fn default_utc_offset_minutes() -> i32 { 480 }
fn default_batch_limit() -> usize { 100 }

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            utc_offset_minutes: default_utc_offset_minutes(),
            batch_limit: default_batch_limit(),
            rng_seed: None,
        }
    }
}

impl SchedulerConfig {
    /// Reject offsets chrono cannot represent and a zero batch size.
    pub fn validate(&self) -> Result<()> {
        if self.utc_offset_minutes.abs() >= 24 * 60 {
            return Err(LeadFlowError::Config(format!(
                "utc_offset_minutes out of range: {}",
                self.utc_offset_minutes
            )));
        }
        if self.batch_limit == 0 {
            return Err(LeadFlowError::Config("batch_limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Values applied when a new rule omits optional sections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleDefaults {
    #[serde(default = "default_inactive_hours")]
    pub inactive_hours: u32,
    #[serde(default = "default_window_start")]
    pub window_start: String,
    #[serde(default = "default_window_end")]
    pub window_end: String,
    #[serde(default = "default_compensation_priority")]
    pub compensation_priority: u8,
    /// Lifecycle statuses a rule may target. Empty accepts any status.
    #[serde(default)]
    pub allowed_statuses: Vec<String>,
}

fn default_inactive_hours() -> u32 { 48 }
fn default_window_start() -> String { "09:30".into() }
fn default_window_end() -> String { "18:30".into() }
fn default_compensation_priority() -> u8 { 5 }

impl Default for RuleDefaults {
    fn default() -> Self {
        Self {
            inactive_hours: default_inactive_hours(),
            window_start: default_window_start(),
            window_end: default_window_end(),
            compensation_priority: default_compensation_priority(),
            allowed_statuses: Vec::new(),
        }
    }
}

/// Outbound notification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Optional HTTP endpoint receiving one JSON POST per notice.
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Notices kept in the in-memory history ring.
    #[serde(default = "default_history_size")]
    pub history_size: usize,
}

fn default_timeout_secs() -> u64 { 10 }
fn default_history_size() -> usize { 100 }

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_headers: Vec::new(),
            timeout_secs: default_timeout_secs(),
            history_size: default_history_size(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_gives_defaults() {
        let config: LeadFlowConfig = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.utc_offset_minutes, 480);
        assert_eq!(config.scheduler.batch_limit, 100);
        assert_eq!(config.defaults.window_start, "09:30");
        assert_eq!(config.defaults.compensation_priority, 5);
        assert!(config.notify.webhook_url.is_none());
    }

    #[test]
    fn test_partial_section_override() {
        let config: LeadFlowConfig = toml::from_str(
            r#"
            [scheduler]
            rng_seed = 42
            batch_limit = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.scheduler.rng_seed, Some(42));
        assert_eq!(config.scheduler.batch_limit, 10);
        assert!(config.scheduler.enabled);
    }

    #[test]
    fn test_load_from_rejects_bad_offset() {
        let dir = std::env::temp_dir().join("leadflow-config-test");
        std::fs::create_dir_all(&dir).ok();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[scheduler]\nutc_offset_minutes = 5000\n").unwrap();
        assert!(matches!(
            LeadFlowConfig::load_from(&path),
            Err(LeadFlowError::Config(_))
        ));
        std::fs::remove_dir_all(&dir).ok();
    }
}
