use crate::core::{Result, StageError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// What eviction does with an unreferenced stage that has unsaved edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DirtyEvictionPolicy {
    /// Save before evicting; a failed save refuses the eviction.
    #[default]
    SaveFirst,
    /// Never evict dirty stages; they stay resident until saved or closed.
    Skip,
}

/// Stage registry configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    /// Soft limit on resident stages
    pub max_resident_stages: usize,

    /// Unreferenced stages idle for this long are evicted by maintenance
    pub idle_ttl: Duration,

    /// Period of the background maintenance task
    pub maintenance_interval: Duration,

    /// Upper bound for `open`, including document I/O
    pub open_timeout: Duration,

    /// Upper bound for a single document save
    pub save_timeout: Option<Duration>,

    /// Eviction policy for dirty stages
    pub dirty_eviction: DirtyEvictionPolicy,
}

impl RegistryConfig {
    pub fn new() -> Self {
        Self {
            max_resident_stages: 10,
            idle_ttl: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(300),
            open_timeout: Duration::from_secs(30),
            save_timeout: None,
            dirty_eviction: DirtyEvictionPolicy::SaveFirst,
        }
    }

    /// Set the resident stage limit
    pub fn max_resident_stages(mut self, max: usize) -> Self {
        self.max_resident_stages = max;
        self
    }

    /// Set the idle TTL
    pub fn idle_ttl(mut self, ttl: Duration) -> Self {
        self.idle_ttl = ttl;
        self
    }

    /// Set the maintenance interval
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the open timeout
    pub fn open_timeout(mut self, timeout: Duration) -> Self {
        self.open_timeout = timeout;
        self
    }

    /// Set the save timeout
    pub fn save_timeout(mut self, timeout: Duration) -> Self {
        self.save_timeout = Some(timeout);
        self
    }

    /// Set the dirty eviction policy
    pub fn dirty_eviction(mut self, policy: DirtyEvictionPolicy) -> Self {
        self.dirty_eviction = policy;
        self
    }

    /// Parse from JSON using the option names exposed to tool callers.
    ///
    /// Missing options keep their defaults.
    ///
    /// ```
    /// # use stagecache::RegistryConfig;
    /// let config = RegistryConfig::from_json(r#"{"maxResidentStages": 4, "openTimeoutMs": 250}"#)?;
    /// assert_eq!(config.max_resident_stages, 4);
    /// # Ok::<(), stagecache::StageError>(())
    /// ```
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawConfig =
            serde_json::from_str(json).map_err(|err| StageError::Config(err.to_string()))?;
        let mut config = Self::new();
        if let Some(max) = raw.max_resident_stages {
            config.max_resident_stages = max;
        }
        if let Some(secs) = raw.idle_ttl_seconds {
            config.idle_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = raw.maintenance_interval_seconds {
            config.maintenance_interval = Duration::from_secs(secs);
        }
        if let Some(ms) = raw.open_timeout_ms {
            config.open_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = raw.save_timeout_ms {
            config.save_timeout = Some(Duration::from_millis(ms));
        }
        if let Some(policy) = raw.dirty_eviction {
            config.dirty_eviction = policy;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.max_resident_stages == 0 {
            return Err(StageError::Config("maxResidentStages must be > 0".into()));
        }

        if self.maintenance_interval.is_zero() {
            return Err(StageError::Config(
                "maintenanceIntervalSeconds must be > 0".into(),
            ));
        }

        // The maintenance timer schedules its first tick one interval from now.
        if Instant::now().checked_add(self.maintenance_interval).is_none() {
            return Err(StageError::Config(format!(
                "maintenanceIntervalSeconds too large: {:?}",
                self.maintenance_interval
            )));
        }

        if self.open_timeout.is_zero() {
            return Err(StageError::Config("openTimeoutMs must be > 0".into()));
        }

        if self.save_timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(StageError::Config("saveTimeoutMs must be > 0".into()));
        }

        Ok(())
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(rename = "maxResidentStages")]
    max_resident_stages: Option<usize>,
    #[serde(rename = "idleTTLSeconds")]
    idle_ttl_seconds: Option<u64>,
    #[serde(rename = "maintenanceIntervalSeconds")]
    maintenance_interval_seconds: Option<u64>,
    #[serde(rename = "openTimeoutMs")]
    open_timeout_ms: Option<u64>,
    #[serde(rename = "saveTimeoutMs")]
    save_timeout_ms: Option<u64>,
    #[serde(rename = "dirtyEviction")]
    dirty_eviction: Option<DirtyEvictionPolicy>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RegistryConfig::default();
        assert_eq!(config.max_resident_stages, 10);
        assert_eq!(config.maintenance_interval, Duration::from_secs(300));
        assert_eq!(config.dirty_eviction, DirtyEvictionPolicy::SaveFirst);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let config = RegistryConfig::new()
            .max_resident_stages(3)
            .idle_ttl(Duration::from_secs(5))
            .save_timeout(Duration::from_millis(200))
            .dirty_eviction(DirtyEvictionPolicy::Skip);

        assert_eq!(config.max_resident_stages, 3);
        assert_eq!(config.idle_ttl, Duration::from_secs(5));
        assert_eq!(config.save_timeout, Some(Duration::from_millis(200)));
        assert_eq!(config.dirty_eviction, DirtyEvictionPolicy::Skip);
    }

    #[test]
    fn test_from_json() {
        let config = RegistryConfig::from_json(
            r#"{
                "maxResidentStages": 2,
                "idleTTLSeconds": 60,
                "maintenanceIntervalSeconds": 15,
                "openTimeoutMs": 500,
                "dirtyEviction": "skip"
            }"#,
        )
        .unwrap();

        assert_eq!(config.max_resident_stages, 2);
        assert_eq!(config.idle_ttl, Duration::from_secs(60));
        assert_eq!(config.maintenance_interval, Duration::from_secs(15));
        assert_eq!(config.open_timeout, Duration::from_millis(500));
        assert_eq!(config.save_timeout, None);
        assert_eq!(config.dirty_eviction, DirtyEvictionPolicy::Skip);
    }

    #[test]
    fn test_from_json_rejects_unknown_and_invalid() {
        assert!(RegistryConfig::from_json(r#"{"maxStages": 2}"#).is_err());
        assert!(RegistryConfig::from_json(r#"{"maxResidentStages": 0}"#).is_err());
        assert!(RegistryConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_from_json_rejects_unrepresentable_interval() {
        let result =
            RegistryConfig::from_json(r#"{"maintenanceIntervalSeconds": 18446744073709551615}"#);
        assert!(matches!(result, Err(StageError::Config(_))));

        let result = RegistryConfig::new()
            .maintenance_interval(Duration::MAX)
            .validate();
        assert!(matches!(result, Err(StageError::Config(_))));
    }

    #[test]
    fn test_validate() {
        assert!(RegistryConfig::new().max_resident_stages(0).validate().is_err());
        assert!(
            RegistryConfig::new()
                .maintenance_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
        assert!(RegistryConfig::new().open_timeout(Duration::ZERO).validate().is_err());
        assert!(RegistryConfig::new().save_timeout(Duration::ZERO).validate().is_err());
    }
}
