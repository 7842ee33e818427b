use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::lock::LockManager;
use crate::monitor::Thresholds;

/// Config file name.
pub const CONFIG_TOML: &str = ".conductor.toml";

/// Find the config file in `dir`, if present.
pub fn find_config(dir: &Path) -> Option<PathBuf> {
    let path = dir.join(CONFIG_TOML);
    path.exists().then_some(path)
}

/// Top-level .conductor.toml config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub paths: PathsConfig,
    pub lock: LockConfig,
    pub monitor: MonitorConfig,
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load config from `dir`, falling back to defaults when no file exists.
    pub fn load(dir: &Path) -> anyhow::Result<Self> {
        let Some(path) = find_config(dir) else {
            return Ok(Self::default());
        };
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
        Ok(config)
    }

    pub fn lock_manager(&self) -> LockManager {
        LockManager::new(
            StdDuration::from_millis(self.lock.poll_ms),
            StdDuration::from_millis(self.lock.deadline_ms),
            StdDuration::from_millis(self.lock.stale_ms),
        )
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            stale_after: chrono::Duration::hours(i64::from(self.monitor.stale_after_hours)),
            zombie_after: chrono::Duration::minutes(i64::from(self.monitor.zombie_after_mins)),
            retention: chrono::Duration::days(i64::from(self.monitor.retention_days)),
        }
    }

    pub const fn monitor_interval(&self) -> StdDuration {
        StdDuration::from_secs(self.monitor.interval_secs)
    }

    pub fn dispatch_store_path(&self) -> PathBuf {
        self.paths.state_dir().join(&self.paths.dispatch_store)
    }

    pub fn project_store_path(&self) -> PathBuf {
        self.paths.state_dir().join(&self.paths.project_store)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the persisted stores. Defaults to the platform
    /// state dir (e.g. `~/.local/state/conductor`).
    pub state_dir: Option<PathBuf>,
    pub dispatch_store: String,
    pub project_store: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            dispatch_store: "dispatches.json".to_string(),
            project_store: "projects.json".to_string(),
        }
    }
}

impl PathsConfig {
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("conductor")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    #[serde(alias = "pollMs")]
    pub poll_ms: u64,
    #[serde(alias = "deadlineMs")]
    pub deadline_ms: u64,
    /// Sentinels older than this are presumed abandoned. Keep well above
    /// normal critical-section duration; see lock.rs on the race window.
    #[serde(alias = "staleMs")]
    pub stale_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            poll_ms: 50,
            deadline_ms: 10_000,
            stale_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    #[serde(alias = "intervalSecs")]
    pub interval_secs: u64,
    #[serde(alias = "staleAfterHours")]
    pub stale_after_hours: u32,
    #[serde(alias = "zombieAfterMins")]
    pub zombie_after_mins: u32,
    #[serde(alias = "retentionDays")]
    pub retention_days: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            stale_after_hours: 2,
            zombie_after_mins: 30,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    #[serde(alias = "maxConcurrent")]
    pub max_concurrent: usize,
    #[serde(alias = "defaultTier")]
    pub default_tier: String,
    #[serde(alias = "defaultModel")]
    pub default_model: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            default_tier: "balanced".to_string(),
            default_model: "default".to_string(),
        }
    }
}
