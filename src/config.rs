use serde::{Deserialize, Serialize};

/// Runtime configuration recognized by the storage engine
///
/// Loaded from an optional `telemetry_store` config file with environment
/// overrides under the `TELEMETRY_STORE` prefix; every key has a usable
/// default so embedding SDKs can construct one directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the backing store file; ignored when `in_memory` is set
    pub cache_file_path: String,
    /// Hard size limit in bytes
    pub cache_file_size: u64,
    /// Soft threshold as a percentage of `cache_file_size`
    pub cache_file_full_notification_percentage: u8,
    /// Retry budget; a release pushing a record to this count deletes it
    pub max_retry_count: u32,
    /// Byte cap of the in-memory fallback queue
    pub ram_queue_size: u64,
    /// Minimum interval between storage-full observer notifications
    pub storage_full_notification_interval_ms: u64,
    /// Minimum interval between full quota checks
    pub db_full_check_interval_ms: u64,
    /// Percentage of an over-share tenant's records removed per trim pass
    pub trim_percentage: u8,
    /// Clear persisted leases on open instead of honoring their deadlines
    pub clear_reservations_on_open: bool,
    /// Back the store with in-process structures instead of a file
    pub in_memory: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_file_path: "telemetry.db".to_string(),
            cache_file_size: 3 * 1024 * 1024,
            cache_file_full_notification_percentage: 75,
            max_retry_count: 5,
            ram_queue_size: 512 * 1024,
            storage_full_notification_interval_ms: 600_000,
            db_full_check_interval_ms: 5_000,
            trim_percentage: 25,
            clear_reservations_on_open: true,
            in_memory: false,
        }
    }
}

impl StoreConfig {
    /// Soft notification threshold in bytes
    pub fn soft_limit_bytes(&self) -> u64 {
        self.cache_file_size * u64::from(self.cache_file_full_notification_percentage) / 100
    }
}

pub fn load_config() -> anyhow::Result<StoreConfig> {
    let config = config::Config::builder()
        .add_source(config::File::with_name("telemetry_store").required(false))
        .add_source(config::Environment::with_prefix("TELEMETRY_STORE").separator("__"))
        .build()?;

    let cfg: StoreConfig = config.try_deserialize()?;
    validate_config(&cfg)?;

    Ok(cfg)
}

pub fn validate_config(cfg: &StoreConfig) -> anyhow::Result<()> {
    if cfg.cache_file_size == 0 {
        anyhow::bail!("cache_file_size must be greater than zero");
    }

    if cfg.cache_file_full_notification_percentage == 0
        || cfg.cache_file_full_notification_percentage > 100
    {
        anyhow::bail!(
            "cache_file_full_notification_percentage must be in 1..=100, got {}",
            cfg.cache_file_full_notification_percentage
        );
    }

    if cfg.trim_percentage == 0 || cfg.trim_percentage > 100 {
        anyhow::bail!(
            "trim_percentage must be in 1..=100, got {}",
            cfg.trim_percentage
        );
    }

    if cfg.ram_queue_size == 0 {
        anyhow::bail!("ram_queue_size must be greater than zero");
    }

    if !cfg.in_memory && cfg.cache_file_path.is_empty() {
        anyhow::bail!("cache_file_path must be set for a file-backed store");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = StoreConfig::default();
        assert!(validate_config(&cfg).is_ok());
        assert_eq!(cfg.cache_file_size, 3 * 1024 * 1024);
        assert_eq!(cfg.max_retry_count, 5);
        assert_eq!(cfg.storage_full_notification_interval_ms, 600_000);
    }

    #[test]
    fn test_soft_limit_bytes() {
        let cfg = StoreConfig {
            cache_file_size: 1000,
            cache_file_full_notification_percentage: 75,
            ..StoreConfig::default()
        };
        assert_eq!(cfg.soft_limit_bytes(), 750);
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        let cfg = StoreConfig {
            cache_file_size: 0,
            ..StoreConfig::default()
        };
        let result = validate_config(&cfg);
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("cache_file_size must be greater than zero"));
    }

    #[test]
    fn test_validate_rejects_bad_percentage() {
        let cfg = StoreConfig {
            cache_file_full_notification_percentage: 101,
            ..StoreConfig::default()
        };
        assert!(validate_config(&cfg).is_err());

        let cfg = StoreConfig {
            trim_percentage: 0,
            ..StoreConfig::default()
        };
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn test_validate_requires_path_for_file_store() {
        let cfg = StoreConfig {
            cache_file_path: String::new(),
            in_memory: false,
            ..StoreConfig::default()
        };
        assert!(validate_config(&cfg).is_err());

        let cfg = StoreConfig {
            cache_file_path: String::new(),
            in_memory: true,
            ..StoreConfig::default()
        };
        assert!(validate_config(&cfg).is_ok());
    }
}
