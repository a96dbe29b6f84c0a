use std::time::Duration;

use anyhow::Result;
use config::Config;

/// Tunables of the block pool and its loops
#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct PoolConfig {
    pub insert_workers: usize,
    pub insert_period_ms: u64,
    pub insert_idle_backoff_ms: u64,
    pub compact_period_ms: u64,
    pub compact_idle_backoff_ms: u64,
    pub broadcast_interval_secs: u64,
    pub eviction_interval_secs: u64,
    pub prune_interval_secs: u64,
    pub fail_threshold_ms: u64,
    pub fetch_retry_ms: u64,
    pub default_fetch_count: u64,
    pub max_fork_depth: u64,
    pub snippet_ttl_secs: u64,
    pub block_list_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            insert_workers: 2,
            insert_period_ms: 40,
            insert_idle_backoff_ms: 100,
            compact_period_ms: 40,
            compact_idle_backoff_ms: 200,
            broadcast_interval_secs: 30,
            eviction_interval_secs: 120,
            prune_interval_secs: 60,
            fail_threshold_ms: 10_000,
            fetch_retry_ms: 5_000,
            default_fetch_count: 5,
            max_fork_depth: 1000,
            snippet_ttl_secs: 600,
            block_list_ms: 1000,
        }
    }
}

impl PoolConfig {
    pub fn try_load(config: &Config) -> Result<Self> {
        let full_config = Config::builder()
            .add_source(config::File::from_str(
                include_str!("../config.default.toml"),
                config::FileFormat::Toml,
            ))
            .add_source(config.clone())
            .build()?;
        Ok(full_config.try_deserialize()?)
    }

    pub fn insert_period(&self) -> Duration {
        Duration::from_millis(self.insert_period_ms)
    }

    pub fn insert_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.insert_idle_backoff_ms)
    }

    pub fn compact_period(&self) -> Duration {
        Duration::from_millis(self.compact_period_ms)
    }

    pub fn compact_idle_backoff(&self) -> Duration {
        Duration::from_millis(self.compact_idle_backoff_ms)
    }

    pub fn broadcast_interval(&self) -> Duration {
        Duration::from_secs(self.broadcast_interval_secs)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs)
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs)
    }

    pub fn fail_threshold(&self) -> Duration {
        Duration::from_millis(self.fail_threshold_ms)
    }

    pub fn fetch_retry(&self) -> Duration {
        Duration::from_millis(self.fetch_retry_ms)
    }

    pub fn snippet_ttl(&self) -> Duration {
        Duration::from_secs(self.snippet_ttl_secs)
    }

    pub fn block_list(&self) -> Duration {
        Duration::from_millis(self.block_list_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_defaults_match_default_impl() {
        let loaded = PoolConfig::try_load(&Config::default()).unwrap();
        assert_eq!(loaded, PoolConfig::default());
    }

    #[test]
    fn overrides_apply_on_top_of_defaults() {
        let overrides = Config::builder()
            .set_override("insert-workers", 8)
            .unwrap()
            .set_override("max-fork-depth", 16)
            .unwrap()
            .build()
            .unwrap();
        let loaded = PoolConfig::try_load(&overrides).unwrap();
        assert_eq!(loaded.insert_workers, 8);
        assert_eq!(loaded.max_fork_depth, 16);
        assert_eq!(loaded.fetch_retry(), Duration::from_secs(5));
    }
}
