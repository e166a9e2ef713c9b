//! Resolution of a default [`BatchConfig`] for scopes opened without one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{RwLock, const_rwlock};
use tracing::debug;

use super::env::{EnvSource, StdEnvSource};
use super::BatchConfig;
use crate::error::{BatchError, BatchResult};

/// Supplies the configuration used when a scope is opened without one.
pub trait ConfigProvider: Send + Sync {
    /// Resolve a configuration.
    fn resolve(&self) -> BatchResult<BatchConfig>;
}

impl<F> ConfigProvider for F
where
    F: Fn() -> BatchResult<BatchConfig> + Send + Sync,
{
    fn resolve(&self) -> BatchResult<BatchConfig> {
        self()
    }
}

/// Always returns the same configuration.
#[derive(Debug, Clone)]
pub struct StaticConfigProvider {
    config: BatchConfig,
}

impl StaticConfigProvider {
    /// Create a provider for a fixed configuration.
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }
}

impl ConfigProvider for StaticConfigProvider {
    fn resolve(&self) -> BatchResult<BatchConfig> {
        Ok(self.config.clone())
    }
}

/// Builds a configuration from environment variables.
///
/// `DATABASE_URL` is required. These optional overrides are applied on top:
///
/// | Variable                         | Field           |
/// |----------------------------------|-----------------|
/// | `PRAX_BATCH_MAX_POOL_SIZE`       | `max_pool_size` |
/// | `PRAX_BATCH_TIMEOUT`             | `timeout` (s)   |
/// | `PRAX_BATCH_WAIT_SLICE_MS`       | `wait_slice`    |
/// | `PRAX_BATCH_RETRY_MAX_ATTEMPTS`  | retry attempts  |
/// | `PRAX_BATCH_RETRY_DELAY_MS`      | retry delay     |
pub struct EnvConfigProvider<E: EnvSource = StdEnvSource> {
    source: E,
}

impl EnvConfigProvider<StdEnvSource> {
    /// Read from the process environment.
    pub fn new() -> Self {
        Self {
            source: StdEnvSource,
        }
    }
}

impl Default for EnvConfigProvider<StdEnvSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: EnvSource> EnvConfigProvider<E> {
    /// Read from a custom environment source.
    pub fn with_source(source: E) -> Self {
        Self { source }
    }

    fn parse<T: std::str::FromStr>(&self, name: &str) -> BatchResult<Option<T>> {
        match self.source.get(name) {
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| BatchError::config(format!("invalid value for {}: {}", name, raw))),
            None => Ok(None),
        }
    }
}

impl<E: EnvSource> ConfigProvider for EnvConfigProvider<E> {
    fn resolve(&self) -> BatchResult<BatchConfig> {
        let url = self
            .source
            .get("DATABASE_URL")
            .ok_or_else(|| BatchError::config("DATABASE_URL is not set"))?;
        let mut config = BatchConfig::from_url(url)?;

        if let Some(n) = self.parse("PRAX_BATCH_MAX_POOL_SIZE")? {
            config.max_pool_size = n;
        }
        if let Some(secs) = self.parse("PRAX_BATCH_TIMEOUT")? {
            config.timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = self.parse("PRAX_BATCH_WAIT_SLICE_MS")? {
            config.wait_slice = Duration::from_millis(ms);
        }
        if let Some(n) = self.parse("PRAX_BATCH_RETRY_MAX_ATTEMPTS")? {
            config.retry = config.retry.max_attempts(n);
        }
        if let Some(ms) = self.parse("PRAX_BATCH_RETRY_DELAY_MS")? {
            config.retry = config.retry.fixed_delay(Duration::from_millis(ms));
        }

        Ok(config)
    }
}

/// Loads a `prax.toml`-style file on every resolution.
#[derive(Debug, Clone)]
pub struct TomlConfigProvider {
    path: PathBuf,
}

impl TomlConfigProvider {
    /// Create a provider for the given file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigProvider for TomlConfigProvider {
    fn resolve(&self) -> BatchResult<BatchConfig> {
        BatchConfig::from_file(&self.path)
    }
}

static DEFAULT_PROVIDER: RwLock<Option<Arc<dyn ConfigProvider>>> = const_rwlock(None);

/// Install the process-wide default provider.
pub fn set_default_provider(provider: Arc<dyn ConfigProvider>) {
    *DEFAULT_PROVIDER.write() = Some(provider);
}

/// The process-wide default provider, falling back to [`EnvConfigProvider`].
pub fn default_provider() -> Arc<dyn ConfigProvider> {
    DEFAULT_PROVIDER
        .read()
        .clone()
        .unwrap_or_else(|| Arc::new(EnvConfigProvider::new()) as Arc<dyn ConfigProvider>)
}

/// Resolve a configuration through the default provider.
pub fn resolve_default() -> BatchResult<BatchConfig> {
    let config = default_provider().resolve()?;
    debug!(kind = %config.kind, host = %config.hostname, "Resolved default batch config");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapEnvSource;

    #[test]
    fn test_env_provider() {
        let env = MapEnvSource::new()
            .set("DATABASE_URL", "mysql://root@db/app")
            .set("PRAX_BATCH_MAX_POOL_SIZE", "3")
            .set("PRAX_BATCH_TIMEOUT", "4")
            .set("PRAX_BATCH_WAIT_SLICE_MS", "50")
            .set("PRAX_BATCH_RETRY_MAX_ATTEMPTS", "1");
        let config = EnvConfigProvider::with_source(env).resolve().unwrap();

        assert_eq!(config.hostname, "db");
        assert_eq!(config.max_pool_size, 3);
        assert_eq!(config.timeout, Duration::from_secs(4));
        assert_eq!(config.wait_slice, Duration::from_millis(50));
        assert_eq!(config.retry.attempts(), 1);
    }

    #[test]
    fn test_env_provider_missing_url() {
        let err = EnvConfigProvider::with_source(MapEnvSource::new())
            .resolve()
            .unwrap_err();
        assert!(err.is_validation_error());
    }

    #[test]
    fn test_env_provider_bad_override() {
        let env = MapEnvSource::new()
            .set("DATABASE_URL", "mysql://db/app")
            .set("PRAX_BATCH_TIMEOUT", "soon");
        assert!(EnvConfigProvider::with_source(env).resolve().is_err());
    }

    #[test]
    fn test_static_and_closure_providers() {
        let provider = StaticConfigProvider::new(BatchConfig::new("shop"));
        assert_eq!(provider.resolve().unwrap().database, "shop");

        let closure = || -> BatchResult<BatchConfig> { Ok(BatchConfig::new("reports").max_pool_size(2)) };
        assert_eq!(closure.resolve().unwrap().max_pool_size, 2);
    }

    #[test]
    fn test_toml_provider_missing_file() {
        let provider = TomlConfigProvider::new("/nonexistent/prax.toml");
        assert!(matches!(provider.resolve(), Err(BatchError::Config(_))));
    }
}
