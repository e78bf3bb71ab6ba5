use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;

use crate::domain::errors::ConfigError;
use crate::domain::models::{BackendKind, FleetConfig};

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .aqe/config.yaml (project config, created by init)
    /// 3. .aqe/local.yaml (project local overrides, optional)
    /// 4. Environment variables (AQE_* prefix, highest priority)
    pub fn load() -> Result<FleetConfig> {
        let config: FleetConfig = Figment::new()
            .merge(Serialized::defaults(FleetConfig::default()))
            .merge(Yaml::file(".aqe/config.yaml"))
            .merge(Yaml::file(".aqe/local.yaml"))
            .merge(Env::prefixed("AQE_").split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<FleetConfig> {
        let config: FleetConfig = Figment::new()
            .merge(Serialized::defaults(FleetConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading. Every violation names the
    /// offending field and the expected shape.
    pub fn validate(config: &FleetConfig) -> Result<(), ConfigError> {
        if config.adapter.kind == BackendKind::Real
            && config.adapter.db_path.as_deref().unwrap_or("").is_empty()
        {
            return Err(ConfigError::MissingField {
                field: "adapter.db_path".to_string(),
                expected: "a database file path when adapter.type = real".to_string(),
            });
        }
        if config.adapter.max_connections == 0 {
            return Err(ConfigError::InvalidValue {
                field: "adapter.max_connections".to_string(),
                value: "0".to_string(),
                expected: "at least one database connection".to_string(),
            });
        }

        if config.fleet.max_concurrent_agents == 0 || config.fleet.max_concurrent_agents > 1_000 {
            return Err(ConfigError::InvalidValue {
                field: "fleet.max_concurrent_agents".to_string(),
                value: config.fleet.max_concurrent_agents.to_string(),
                expected: "1..=1000".to_string(),
            });
        }

        if config.event_bus.topic_ring_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_bus.topic_ring_capacity".to_string(),
                value: "0".to_string(),
                expected: "a positive ring size".to_string(),
            });
        }
        if config.event_bus.mailbox_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "event_bus.mailbox_capacity".to_string(),
                value: "0".to_string(),
                expected: "a positive mailbox size".to_string(),
            });
        }

        if !(0.0..=1.0).contains(&config.learning.alpha) || config.learning.alpha == 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "learning.alpha".to_string(),
                value: config.learning.alpha.to_string(),
                expected: "a learning rate in (0, 1]".to_string(),
            });
        }
        if !(0.0..1.0).contains(&config.learning.gamma) {
            return Err(ConfigError::InvalidValue {
                field: "learning.gamma".to_string(),
                value: config.learning.gamma.to_string(),
                expected: "a discount factor in [0, 1)".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&config.learning.epsilon) {
            return Err(ConfigError::InvalidValue {
                field: "learning.epsilon".to_string(),
                value: config.learning.epsilon.to_string(),
                expected: "an exploration rate in [0, 1]".to_string(),
            });
        }
        if config.learning.batch_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "learning.batch_size".to_string(),
                value: "0".to_string(),
                expected: "a positive batch size".to_string(),
            });
        }

        for (agent_type, policy) in &config.pool.per_type {
            if policy.max_size == 0 {
                return Err(ConfigError::InvalidValue {
                    field: format!("pool.per_type.{agent_type}.max_size"),
                    value: "0".to_string(),
                    expected: "a positive pool size".to_string(),
                });
            }
            if policy.min_size > policy.max_size {
                return Err(ConfigError::InvalidValue {
                    field: format!("pool.per_type.{agent_type}.min_size"),
                    value: policy.min_size.to_string(),
                    expected: format!("at most max_size ({})", policy.max_size),
                });
            }
        }

        if config.watchdog.misses_allowed == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watchdog.misses_allowed".to_string(),
                value: "0".to_string(),
                expected: "at least one allowed miss".to_string(),
            });
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.level".to_string(),
                value: config.logging.level.clone(),
                expected: "one of: trace, debug, info, warn, error".to_string(),
            });
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidValue {
                field: "logging.format".to_string(),
                value: config.logging.format.clone(),
                expected: "one of: json, pretty".to_string(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::PoolPolicy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = FleetConfig::default();
        ConfigLoader::validate(&config).expect("default config should be valid");
    }

    #[test]
    fn test_real_without_db_path_rejected() {
        let mut config = FleetConfig::default();
        config.adapter.kind = BackendKind::Real;
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field, .. } if field == "adapter.db_path"));
    }

    #[test]
    fn test_zero_db_connections_rejected() {
        let mut config = FleetConfig::default();
        config.adapter.max_connections = 0;
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { field, .. } if field == "adapter.max_connections")
        );
    }

    #[test]
    fn test_invalid_alpha_rejected() {
        let mut config = FleetConfig::default();
        config.learning.alpha = 1.5;
        assert!(ConfigLoader::validate(&config).is_err());

        config.learning.alpha = 0.0;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_invalid_gamma_rejected() {
        let mut config = FleetConfig::default();
        config.learning.gamma = 1.0;
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = FleetConfig::default();
        config.fleet.max_concurrent_agents = 0;
        let err = ConfigLoader::validate(&config).unwrap_err();
        assert!(
            matches!(err, ConfigError::InvalidValue { field, .. } if field == "fleet.max_concurrent_agents")
        );
    }

    #[test]
    fn test_pool_min_over_max_rejected() {
        let mut config = FleetConfig::default();
        config.pool.per_type.insert(
            "test-generator".to_string(),
            PoolPolicy {
                min_size: 9,
                max_size: 4,
                ..PoolPolicy::default()
            },
        );
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let mut config = FleetConfig::default();
        config.logging.level = "verbose".to_string();
        assert!(ConfigLoader::validate(&config).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "fleet:\n  max_concurrent_agents: 7\nlearning:\n  epsilon: 0.2"
        )
        .unwrap();
        file.flush().unwrap();

        let config = ConfigLoader::load_from_file(file.path()).unwrap();
        assert_eq!(config.fleet.max_concurrent_agents, 7);
        assert!((config.learning.epsilon - 0.2).abs() < f64::EPSILON);
        // Untouched sections keep defaults.
        assert_eq!(config.memory.cache_size, 1_000);
    }

    #[test]
    fn test_hierarchical_merging() {
        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "fleet:\n  max_concurrent_agents: 5\nlogging:\n  level: info\n  format: json"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(
            override_file,
            "fleet:\n  max_concurrent_agents: 15\nlogging:\n  level: debug"
        )
        .unwrap();
        override_file.flush().unwrap();

        let config: FleetConfig = Figment::new()
            .merge(Serialized::defaults(FleetConfig::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.fleet.max_concurrent_agents, 15, "override wins");
        assert_eq!(config.logging.level, "debug", "override wins for nested fields");
        assert_eq!(
            config.logging.format, "json",
            "base value persists when not overridden"
        );
    }

    #[test]
    fn test_env_override() {
        temp_env::with_vars(
            [
                ("AQE_FLEET__MAX_CONCURRENT_AGENTS", Some("9")),
                ("AQE_LOGGING__LEVEL", Some("warn")),
            ],
            || {
                let config: FleetConfig = Figment::new()
                    .merge(Serialized::defaults(FleetConfig::default()))
                    .merge(Env::prefixed("AQE_").split("__"))
                    .extract()
                    .unwrap();
                assert_eq!(config.fleet.max_concurrent_agents, 9);
                assert_eq!(config.logging.level, "warn");
            },
        );
    }
}
