//! Serving configuration: defaults, optional YAML file, environment
//! overrides with the `SERVING__` prefix (double underscore separates
//! nesting, e.g. `SERVING__MODEL__ID`).

use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

use crate::resilience::RetryConfig;
use crate::resolver::ModelVersion;

#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub id: String,
    pub hash: String,
    pub remote_path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    pub dir: String,
    pub max_entries: usize,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrySection {
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServingConfig {
    pub listen_port: u16,
    pub credential_path: String,
    pub request_timeout_ms: u64,
    pub max_concurrent_predictions: usize,
    /// The designated serving version; absent means the process starts
    /// Unconfigured and `/predict` returns 503.
    pub model: Option<ModelConfig>,
    pub remote: RemoteConfig,
    pub cache: CacheConfig,
    pub retry: RetrySection,
}

impl ServingConfig {
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder()
            .set_default("listen_port", 8080)?
            .set_default("credential_path", "service-account.json")?
            .set_default("request_timeout_ms", 2_000)?
            .set_default("max_concurrent_predictions", 64)?
            .set_default("remote.base_url", "http://127.0.0.1:9000")?
            .set_default("cache.dir", "artifact-cache")?
            .set_default("cache.max_entries", 4)?
            .set_default("cache.idle_timeout_secs", 900)?
            .set_default("cache.sweep_interval_secs", 60)?
            .set_default("retry.max_attempts", 4)?
            .set_default("retry.base_delay_ms", 100)?
            .set_default("retry.max_delay_ms", 2_000)?;
        if let Ok(file) = std::env::var("SERVING_CONFIG_FILE") {
            builder = builder.add_source(config::File::with_name(&file).required(false));
        }
        builder = builder.add_source(config::Environment::with_prefix("SERVING").separator("__"));
        let cfg = builder.build()?;
        Ok(cfg.try_deserialize()?)
    }

    pub fn serving_version(&self) -> Option<ModelVersion> {
        self.model
            .as_ref()
            .map(|m| ModelVersion::new(&m.id, &m.hash, &m.remote_path))
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry.max_attempts.max(1),
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            ..RetryConfig::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.cache.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.cache.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test body: the environment is process-global, so defaults and
    // overrides must not race each other across test threads.
    #[test]
    fn defaults_then_environment_overrides() {
        let cfg = ServingConfig::load().unwrap();
        assert_eq!(cfg.listen_port, 8080);
        assert!(cfg.model.is_none());
        assert_eq!(cfg.retry_config().max_attempts, 4);
        assert_eq!(cfg.request_timeout(), Duration::from_millis(2_000));

        std::env::set_var("SERVING__MODEL__ID", "iris-v1");
        std::env::set_var("SERVING__MODEL__HASH", "b50729b0");
        std::env::set_var("SERVING__MODEL__REMOTE_PATH", "objects/b5/0729b0");
        std::env::set_var("SERVING__LISTEN_PORT", "9001");
        let cfg = ServingConfig::load().unwrap();
        std::env::remove_var("SERVING__MODEL__ID");
        std::env::remove_var("SERVING__MODEL__HASH");
        std::env::remove_var("SERVING__MODEL__REMOTE_PATH");
        std::env::remove_var("SERVING__LISTEN_PORT");

        assert_eq!(cfg.listen_port, 9001);
        let version = cfg.serving_version().unwrap();
        assert_eq!(version.id, "iris-v1");
        assert_eq!(version.remote_path, "objects/b5/0729b0");
    }
}
