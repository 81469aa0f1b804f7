//! Engine configuration.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Default plan cache capacity.
pub const DEFAULT_PLAN_CACHE_CAPACITY: usize = 1000;

/// Default name of the datasource objects use when they name none.
pub const DEFAULT_DATASOURCE: &str = "default";

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of compiled query plans kept.
    pub plan_cache_capacity: usize,
    /// Datasource used by objects that do not name one.
    pub default_datasource: String,
    /// Connection pool limits.
    pub pool: PoolConfig,
    /// Validation behavior.
    pub validation: ValidationConfig,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan_cache_capacity(mut self, capacity: usize) -> Self {
        self.plan_cache_capacity = capacity;
        self
    }

    pub fn with_default_datasource(mut self, name: impl Into<String>) -> Self {
        self.default_datasource = name.into();
        self
    }

    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_validation(mut self, validation: ValidationConfig) -> Self {
        self.validation = validation;
        self
    }

    /// Parse from JSON and validate.
    pub fn from_json_str(json: &str) -> Result<Self, Error> {
        let config: EngineConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check that every limit is usable.
    pub fn validate(&self) -> Result<(), Error> {
        if self.plan_cache_capacity == 0 {
            return Err(Error::Config("plan_cache_capacity must be greater than 0".into()));
        }
        if self.default_datasource.is_empty() {
            return Err(Error::Config("default_datasource must not be empty".into()));
        }
        self.pool.validate()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            plan_cache_capacity: DEFAULT_PLAN_CACHE_CAPACITY,
            default_datasource: DEFAULT_DATASOURCE.to_string(),
            pool: PoolConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

/// Connection pool limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum outstanding handles across all drivers.
    pub global_limit: usize,
    /// Per-driver limit for drivers without an explicit entry.
    pub default_driver_limit: usize,
    /// Explicit per-driver limits.
    pub driver_limits: HashMap<String, usize>,
    /// Bounded wait; `None` queues indefinitely.
    #[serde(with = "duration_millis")]
    pub acquire_timeout: Option<Duration>,
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the global limit.
    pub fn with_global_limit(mut self, limit: usize) -> Self {
        self.global_limit = limit;
        self
    }

    /// Set the default per-driver limit.
    pub fn with_default_driver_limit(mut self, limit: usize) -> Self {
        self.default_driver_limit = limit;
        self
    }

    /// Set the limit for one driver.
    pub fn with_driver_limit(mut self, driver: impl Into<String>, limit: usize) -> Self {
        self.driver_limits.insert(driver.into(), limit);
        self
    }

    /// Fail acquisitions that wait longer than `timeout`.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Effective limit for a driver.
    pub fn limit_for(&self, driver: &str) -> usize {
        self.driver_limits
            .get(driver)
            .copied()
            .unwrap_or(self.default_driver_limit)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.global_limit == 0 {
            return Err(Error::Config("pool.global_limit must be greater than 0".into()));
        }
        if self.default_driver_limit == 0 {
            return Err(Error::Config(
                "pool.default_driver_limit must be greater than 0".into(),
            ));
        }
        if let Some((driver, _)) = self.driver_limits.iter().find(|(_, limit)| **limit == 0) {
            return Err(Error::Config(format!(
                "pool.driver_limits.{} must be greater than 0",
                driver
            )));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            global_limit: 100,
            default_driver_limit: 10,
            driver_limits: HashMap::new(),
            acquire_timeout: None,
        }
    }
}

/// Validation behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Stop at the first failing error-severity rule.
    pub fail_fast: bool,
}

impl ValidationConfig {
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.plan_cache_capacity, DEFAULT_PLAN_CACHE_CAPACITY);
        assert_eq!(config.pool.acquire_timeout, None);
        assert!(!config.validation.fail_fast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_json() {
        let config = EngineConfig::from_json_str(
            r#"{
                "plan_cache_capacity": 16,
                "pool": {
                    "global_limit": 8,
                    "driver_limits": {"postgres": 2},
                    "acquire_timeout": 250
                },
                "validation": {"fail_fast": true}
            }"#,
        )
        .unwrap();

        assert_eq!(config.plan_cache_capacity, 16);
        assert_eq!(config.default_datasource, DEFAULT_DATASOURCE);
        assert_eq!(config.pool.limit_for("postgres"), 2);
        assert_eq!(config.pool.limit_for("mongo"), 10);
        assert_eq!(config.pool.acquire_timeout, Some(Duration::from_millis(250)));
        assert!(config.validation.fail_fast);
    }

    #[test]
    fn test_rejects_zero_limits() {
        let err = EngineConfig::from_json_str(r#"{"plan_cache_capacity": 0}"#).unwrap_err();
        assert!(err.to_string().contains("plan_cache_capacity"));

        let err = EngineConfig::from_json_str(r#"{"pool": {"driver_limits": {"x": 0}}}"#).unwrap_err();
        assert!(err.to_string().contains("driver_limits.x"));

        assert!(EngineConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn test_builders() {
        let pool = PoolConfig::new()
            .with_global_limit(4)
            .with_default_driver_limit(2)
            .with_driver_limit("sled", 1)
            .with_acquire_timeout(Duration::from_secs(1));
        assert_eq!(pool.limit_for("sled"), 1);
        assert_eq!(pool.limit_for("memory"), 2);
        assert!(pool.validate().is_ok());
    }
}
