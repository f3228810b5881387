//! Shared state handed to every component.

use std::sync::Arc;

use crate::cache::CacheSet;
use crate::config::ItmConfig;
use crate::coordinator::JobCoordinator;
use crate::error::ItmResult;
use crate::metrics::MetricsCollector;
use crate::provisioner::TunnelProvisioner;
use crate::store::{ConfigStore, StoreClient};
use crate::types::MonitoringConfig;

/// Explicitly constructed engine state: configuration, caches, store,
/// provisioner, coordinator and metrics.
pub struct ItmContext {
    pub config: ItmConfig,
    pub caches: CacheSet,
    pub store: StoreClient,
    pub provisioner: Arc<dyn TunnelProvisioner>,
    pub coordinator: JobCoordinator,
    pub metrics: MetricsCollector,
}

impl ItmContext {
    /// Builds a context on the current tokio runtime.
    pub fn new(
        config: ItmConfig,
        store: Arc<dyn ConfigStore>,
        provisioner: Arc<dyn TunnelProvisioner>,
    ) -> ItmResult<Arc<Self>> {
        config.validate()?;
        let metrics = MetricsCollector::new()?;
        let coordinator = JobCoordinator::new(&config.coordinator, metrics.clone())?;
        let store = StoreClient::new(store, config.store_timeout());
        Ok(Arc::new(Self {
            config,
            caches: CacheSet::new(),
            store,
            provisioner,
            coordinator,
            metrics,
        }))
    }

    /// Monitoring parameters used by zones that do not set their own.
    pub fn default_monitoring(&self) -> MonitoringConfig {
        self.config.monitoring.params()
    }

    /// Zone assumed for southbound VTEPs without a `tzname`.
    pub fn default_zone_name(&self) -> &str {
        &self.config.default_zone.name
    }
}

impl std::fmt::Debug for ItmContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItmContext")
            .field("store", &self.store)
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}
