//! Engine configuration

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Tunables for the context tables, garbage collector and audit log.
///
/// Every field has a default, so a partial JSON document is a valid
/// configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Each table has `1 << hash_bits` buckets
    pub hash_bits: u32,
    /// Sweep every N-th opportunity while no transition is in flight
    pub gc_interval: usize,
    /// Cap on task-keyed records; exceeding it is an allocation failure
    pub max_task_records: Option<usize>,
    /// Cap on credential-keyed records; exceeding it is an allocation failure
    pub max_cred_records: Option<usize>,
    /// Audit events kept in memory
    pub audit_capacity: usize,
    /// Age after which a live transition record is reported as leaked
    pub transition_leak_ns: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hash_bits: 8,
            gc_interval: 1024,
            max_task_records: None,
            max_cred_records: None,
            audit_capacity: lsm_audit::DEFAULT_AUDIT_CAPACITY,
            transition_leak_ns: 60_000_000_000,
        }
    }
}

impl EngineConfig {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=16).contains(&self.hash_bits) {
            return Err(ConfigError::HashBits(self.hash_bits));
        }
        if self.gc_interval == 0 {
            return Err(ConfigError::GcInterval);
        }
        if self.audit_capacity == 0 {
            return Err(ConfigError::AuditCapacity);
        }
        if self.max_task_records == Some(0) {
            return Err(ConfigError::RecordBudget("max_task_records"));
        }
        if self.max_cred_records == Some(0) {
            return Err(ConfigError::RecordBudget("max_cred_records"));
        }
        Ok(())
    }

    /// Number of buckets per table
    pub fn bucket_count(&self) -> usize {
        1 << self.hash_bits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.bucket_count(), 256);
        assert_eq!(config.gc_interval, 1024);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "hash_bits": 4, "max_task_records": 32 }"#).unwrap();
        assert_eq!(config.hash_bits, 4);
        assert_eq!(config.max_task_records, Some(32));
        assert_eq!(config.gc_interval, 1024);
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = EngineConfig {
            hash_bits: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::HashBits(0)));

        config.hash_bits = 8;
        config.gc_interval = 0;
        assert_eq!(config.validate(), Err(ConfigError::GcInterval));

        config.gc_interval = 1;
        config.max_cred_records = Some(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::RecordBudget("max_cred_records"))
        );
    }
}
