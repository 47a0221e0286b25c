//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{ensure_positive, Result, TurnstileError};

/// Prefix for environment overrides, e.g. `TURNSTILE__EVICTION__ENABLED=false`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for Turnstile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Shard count for every limiter's state table (power of two, at least 2).
    /// Unset uses the table's default.
    #[serde(default)]
    pub shards: Option<usize>,

    /// Idle-key eviction
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Named admission policies
    #[serde(default = "default_policies")]
    pub policies: BTreeMap<String, PolicyConfig>,
}

impl Default for TurnstileConfig {
    fn default() -> Self {
        Self {
            shards: None,
            eviction: EvictionConfig::default(),
            policies: default_policies(),
        }
    }
}

/// An admission policy, selected by its `algorithm` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum PolicyConfig {
    /// At most `max_requests` per trailing `window_seconds`
    SlidingWindow {
        max_requests: u32,
        window_seconds: f64,
    },
    /// Bursts up to `bucket_capacity`, sustained `refill_rate` per second
    TokenBucket {
        bucket_capacity: f64,
        refill_rate: f64,
    },
}

impl PolicyConfig {
    /// Check that every parameter is positive and finite.
    pub fn validate(&self) -> Result<()> {
        match *self {
            PolicyConfig::SlidingWindow {
                max_requests,
                window_seconds,
            } => {
                ensure_positive("max_requests", f64::from(max_requests))?;
                ensure_positive("window_seconds", window_seconds)?;
            }
            PolicyConfig::TokenBucket {
                bucket_capacity,
                refill_rate,
            } => {
                ensure_positive("bucket_capacity", bucket_capacity)?;
                ensure_positive("refill_rate", refill_rate)?;
            }
        }
        Ok(())
    }

    /// Short algorithm name, for display.
    pub fn algorithm(&self) -> &'static str {
        match self {
            PolicyConfig::SlidingWindow { .. } => "sliding_window",
            PolicyConfig::TokenBucket { .. } => "token_bucket",
        }
    }
}

/// Background eviction of keys that have gone quiet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvictionConfig {
    /// Whether the sweeper runs at all
    #[serde(default = "default_eviction_enabled")]
    pub enabled: bool,

    /// A key is a candidate once it has been idle this long
    #[serde(default = "default_idle_after")]
    pub idle_after_secs: u64,

    /// Time between sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            enabled: default_eviction_enabled(),
            idle_after_secs: default_idle_after(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl EvictionConfig {
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

fn default_eviction_enabled() -> bool {
    true
}

fn default_idle_after() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_policies() -> BTreeMap<String, PolicyConfig> {
    let mut policies = BTreeMap::new();
    policies.insert(
        "standard".to_string(),
        PolicyConfig::SlidingWindow {
            max_requests: 5,
            window_seconds: 1.0,
        },
    );
    policies.insert(
        "premium".to_string(),
        PolicyConfig::TokenBucket {
            bucket_capacity: 10.0,
            refill_rate: 10.0,
        },
    );
    policies
}

impl TurnstileConfig {
    /// Load configuration from a YAML file, then apply `TURNSTILE__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        if !path.exists() {
            return Err(TurnstileError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} does not exist", path.display()),
            )));
        }

        let config: TurnstileConfig = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would only fail later, when limiters are built.
    pub fn validate(&self) -> Result<()> {
        if let Some(shards) = self.shards {
            if shards < 2 || !shards.is_power_of_two() {
                return Err(TurnstileError::Config(format!(
                    "shards must be a power of two and at least 2, got {}",
                    shards
                )));
            }
        }

        if self.eviction.enabled && self.eviction.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "eviction.sweep_interval_secs must be positive".to_string(),
            ));
        }

        if self.policies.is_empty() {
            return Err(TurnstileError::Config(
                "at least one policy must be configured".to_string(),
            ));
        }

        for (name, policy) in &self.policies {
            policy.validate().map_err(|e| {
                TurnstileError::Config(format!("policy `{}`: {}", name, e))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    // `from_file` reads process-wide environment variables.
    static ENV_LOCK: Mutex<()> = parking_lot::const_mutex(());

    #[test]
    fn test_default_config_is_valid() {
        let config = TurnstileConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.policies["standard"].algorithm(), "sliding_window");
        assert_eq!(config.policies["premium"].algorithm(), "token_bucket");
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
shards: 16
eviction:
  enabled: true
  idle_after_secs: 120
  sweep_interval_secs: 10
policies:
  standard:
    algorithm: sliding_window
    max_requests: 5
    window_seconds: 1.0
  burst:
    algorithm: token_bucket
    bucket_capacity: 20
    refill_rate: 2.5
"#;
        let config = TurnstileConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.shards, Some(16));
        assert_eq!(config.eviction.idle_after(), Duration::from_secs(120));
        assert_eq!(
            config.policies["burst"],
            PolicyConfig::TokenBucket {
                bucket_capacity: 20.0,
                refill_rate: 2.5,
            }
        );
    }

    #[test]
    fn test_missing_sections_use_defaults() {
        let config = TurnstileConfig::from_yaml("shards: 8\n").unwrap();
        assert_eq!(config.eviction, EvictionConfig::default());
        assert!(config.policies.contains_key("standard"));
    }

    #[test]
    fn test_rejects_non_positive_policy_values() {
        let yaml = r#"
policies:
  broken:
    algorithm: token_bucket
    bucket_capacity: 0
    refill_rate: 1
"#;
        let err = TurnstileConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("broken"));
        assert!(err.to_string().contains("bucket_capacity"));
    }

    #[test]
    fn test_rejects_zero_max_requests() {
        let yaml = r#"
policies:
  broken:
    algorithm: sliding_window
    max_requests: 0
    window_seconds: 1
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_rejects_bad_shard_count() {
        assert!(TurnstileConfig::from_yaml("shards: 3\n").is_err());
        assert!(TurnstileConfig::from_yaml("shards: 1\n").is_err());
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let yaml = r#"
policies:
  odd:
    algorithm: leaky_bucket
    capacity: 3
"#;
        assert!(TurnstileConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_bundled_config_loads() {
        let _env = ENV_LOCK.lock();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/turnstile.yaml");
        let config = TurnstileConfig::from_file(path).unwrap();

        assert_eq!(config.shards, Some(64));
        assert_eq!(config.policies, default_policies());
    }

    #[test]
    fn test_from_file_missing() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, TurnstileError::Io(_)));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let _env = ENV_LOCK.lock();
        let path = std::env::temp_dir().join(format!("turnstile-config-{}.yaml", std::process::id()));
        let yaml = serde_yaml::to_string(&TurnstileConfig::default()).unwrap();
        std::fs::write(&path, yaml).unwrap();

        let config = TurnstileConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.policies, TurnstileConfig::default().policies);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let _env = ENV_LOCK.lock();
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("config/turnstile.yaml");

        std::env::set_var("TURNSTILE__POLICIES__STANDARD__MAX_REQUESTS", "10");
        std::env::set_var("TURNSTILE__EVICTION__IDLE_AFTER_SECS", "42");
        let loaded = TurnstileConfig::from_file(&path);
        std::env::remove_var("TURNSTILE__POLICIES__STANDARD__MAX_REQUESTS");
        std::env::remove_var("TURNSTILE__EVICTION__IDLE_AFTER_SECS");

        let config = loaded.unwrap();
        assert_eq!(
            config.policies["standard"],
            PolicyConfig::SlidingWindow {
                max_requests: 10,
                window_seconds: 1.0,
            }
        );
        assert_eq!(config.eviction.idle_after(), Duration::from_secs(42));
        assert_eq!(config.eviction.sweep_interval_secs, 60);
        assert_eq!(config.policies["premium"], default_policies()["premium"]);
    }
}
