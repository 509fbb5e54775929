//! Configuration loading: defaults, then an optional TOML file, then
//! `ALLOCRA_*` environment variables (`__` separates nested keys).

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding the WAL.
    pub data_dir: PathBuf,
    pub wal_file: String,
    /// Compact once this many records were appended since the last compaction.
    pub compact_threshold: u64,
    pub compact_interval_secs: u64,
    /// Prometheus exporter port; disabled when unset.
    pub metrics_port: Option<u16>,
    pub timeouts: Timeouts,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_file: "allocra.wal".into(),
            compact_threshold: 1000,
            compact_interval_secs: 60,
            metrics_port: None,
            timeouts: Timeouts::default(),
        }
    }
}

impl Config {
    /// Defaults, then `config_path` if given and present, then the environment.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment
            .merge(Env::prefixed("ALLOCRA_").split("__"))
            .extract()
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join(&self.wal_file)
    }
}

/// Per-operation budgets in milliseconds. Conflict checks are the cheapest
/// and tightest, preemption the most expensive and loosest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub conflict_check_ms: u64,
    pub reject_ms: u64,
    pub create_ms: u64,
    pub approve_ms: u64,
    pub preempt_ms: u64,
    pub report_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            conflict_check_ms: 3_000,
            reject_ms: 5_000,
            create_ms: 10_000,
            approve_ms: 10_000,
            preempt_ms: 15_000,
            report_ms: 5_000,
        }
    }
}

impl Timeouts {
    pub fn conflict_check(&self) -> Duration {
        Duration::from_millis(self.conflict_check_ms)
    }

    pub fn reject(&self) -> Duration {
        Duration::from_millis(self.reject_ms)
    }

    pub fn create(&self) -> Duration {
        Duration::from_millis(self.create_ms)
    }

    pub fn approve(&self) -> Duration {
        Duration::from_millis(self.approve_ms)
    }

    pub fn preempt(&self) -> Duration {
        Duration::from_millis(self.preempt_ms)
    }

    pub fn report(&self) -> Duration {
        Duration::from_millis(self.report_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.wal_path(), PathBuf::from("./data/allocra.wal"));
        assert_eq!(config.timeouts.conflict_check(), Duration::from_secs(3));
        assert_eq!(config.timeouts.preempt(), Duration::from_secs(15));
        assert!(config.metrics_port.is_none());
    }

    #[test]
    fn file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "allocra.toml",
                r#"
                    data_dir = "/var/lib/allocra"
                    compact_threshold = 50

                    [timeouts]
                    create_ms = 2000
                "#,
            )?;
            jail.set_env("ALLOCRA_COMPACT_THRESHOLD", "7");
            jail.set_env("ALLOCRA_METRICS_PORT", "9100");
            jail.set_env("ALLOCRA_TIMEOUTS__PREEMPT_MS", "30000");

            let config = Config::load_from(Some(Path::new("allocra.toml")))?;
            assert_eq!(config.data_dir, PathBuf::from("/var/lib/allocra"));
            assert_eq!(config.compact_threshold, 7);
            assert_eq!(config.metrics_port, Some(9100));
            assert_eq!(config.timeouts.create_ms, 2000);
            assert_eq!(config.timeouts.preempt_ms, 30000);
            // untouched nested keys keep their defaults
            assert_eq!(config.timeouts.reject_ms, 5_000);
            Ok(())
        });
    }

    #[test]
    fn missing_file_uses_defaults() {
        Jail::expect_with(|_| {
            let config = Config::load_from(Some(Path::new("nope.toml")))?;
            assert_eq!(config.compact_threshold, 1000);
            Ok(())
        });
    }
}
