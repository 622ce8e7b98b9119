//! Shared state handed to every protocol task.

use std::sync::Arc;

use tracing::warn;

use crate::config::{ConfigStore, Settings};
use crate::error::Result;
use crate::interface::{InterfaceCache, NetworkInterface};
use crate::metrics::{Metrics, Observer};
use crate::pool::ClientPool;
use crate::radius::RadiusClient;
use crate::rate_limit::RateLimiter;

/// Built at startup, and again on reload, then cloned into each task.
/// Clones share every component.
#[derive(Debug, Clone)]
pub struct Context {
    pub settings: Arc<Settings>,
    pub store: Arc<ConfigStore>,
    pub interfaces: Arc<InterfaceCache>,
    pub metrics: Arc<Metrics>,
    pub limiter: Arc<RateLimiter>,
    pub radius_pool: Arc<ClientPool<RadiusClient>>,
}

impl Context {
    /// Resolves the settings from `store` and builds the shared components.
    ///
    /// Must be called from within a Tokio runtime (the rate limiter starts
    /// its refill task).
    pub fn new(store: ConfigStore) -> Self {
        let settings = Settings::from_store(&store);
        Self::with_settings(store, settings)
    }

    pub fn with_settings(store: ConfigStore, settings: Settings) -> Self {
        Self::assemble(
            settings,
            Arc::new(store),
            Arc::new(InterfaceCache::new()),
            Arc::new(Metrics::new()),
        )
    }

    fn assemble(
        settings: Settings,
        store: Arc<ConfigStore>,
        interfaces: Arc<InterfaceCache>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let limiter = RateLimiter::new(settings.general.rate_limit);
        let radius_pool = ClientPool::new(settings.general.pool_size);

        Self {
            settings: Arc::new(settings),
            store,
            interfaces,
            metrics,
            limiter: Arc::new(limiter),
            radius_pool: Arc::new(radius_pool),
        }
    }

    /// Re-reads the configuration file and builds a context from it.
    ///
    /// Metrics carry over. The interface cache is emptied and the rate
    /// limiter and RADIUS pool are rebuilt from the new settings. A file
    /// that no longer parses leaves the previous contents in place.
    pub fn reload(&self) -> Self {
        if let Err(error) = self.store.reload() {
            warn!("Keeping previous configuration: {}", error);
        }
        self.interfaces.clear();

        let settings = Settings::from_store(&self.store);
        Self::assemble(
            settings,
            self.store.clone(),
            self.interfaces.clone(),
            self.metrics.clone(),
        )
    }

    pub fn observer(&self) -> Arc<dyn Observer> {
        self.metrics.clone()
    }

    /// The device's configured interface, resolved through the cache.
    pub fn interface(&self) -> Result<NetworkInterface> {
        self.interfaces.get(&self.settings.general.device.interface)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_context_from_store() {
        let store = ConfigStore::parse("[general]\nrate_limit = 5\npool_size = 2\n").unwrap();
        let ctx = Context::new(store);

        assert_eq!(ctx.limiter.capacity(), 5);
        assert_eq!(ctx.radius_pool.max_size(), 2);

        let clone = ctx.clone();
        clone.observer().error();
        assert_eq!(ctx.metrics.snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_reload_rebuilds_from_file() {
        let path = std::env::temp_dir().join(format!("devsim_context_reload_{}.ini", std::process::id()));
        std::fs::write(&path, "[general]\nrate_limit = 5\npool_size = 2\n").unwrap();

        let ctx = Context::new(ConfigStore::load(&path).unwrap());
        ctx.observer().error();
        ctx.limiter.close();

        std::fs::write(&path, "[general]\nrate_limit = 7\npool_size = 4\n[ipfix]\nenabled = true\n").unwrap();
        let reloaded = ctx.reload();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(reloaded.settings.general.rate_limit, 7);
        assert!(reloaded.settings.ipfix.enabled);
        assert_eq!(reloaded.limiter.capacity(), 7);
        assert!(!reloaded.limiter.is_closed());
        assert_eq!(reloaded.radius_pool.max_size(), 4);
        assert_eq!(reloaded.metrics.snapshot().errors, 1);
        assert_eq!(ctx.settings.general.rate_limit, 5);
    }

    #[tokio::test]
    async fn test_reload_keeps_contents_of_unreadable_file() {
        let path = std::env::temp_dir().join(format!("devsim_context_broken_{}.ini", std::process::id()));
        std::fs::write(&path, "[general]\nrate_limit = 5\n").unwrap();

        let ctx = Context::new(ConfigStore::load(&path).unwrap());
        std::fs::remove_file(&path).unwrap();

        let reloaded = ctx.reload();
        assert_eq!(reloaded.settings.general.rate_limit, 5);
    }

    #[tokio::test]
    async fn test_missing_interface_is_fatal() {
        let ctx = Context::new(ConfigStore::parse("").unwrap());
        assert!(ctx.interface().unwrap_err().is_fatal());
    }
}
