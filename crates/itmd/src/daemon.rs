//! Engine assembly and runtime.
//!
//! The daemon owns the context, the mesh reconciler, the lifecycle manager
//! and the listeners. `start` rebuilds the caches, seeds the default zone,
//! subscribes every listener to its change stream and starts the
//! not-hosted expiry sweep.

use std::sync::Arc;

use chrono::Utc;
use itm_common::{change_stream, subscribe, Change, ChangeHandler, ChangeSink, SubscriptionStats};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::ItmContext;
use crate::error::{ItmError, ItmResult};
use crate::lifecycle::LifecycleManager;
use crate::listener::Listeners;
use crate::mesh::MeshReconciler;
use crate::metrics::MetricsCollector;
use crate::types::{DcGateway, MonitorEvent, Node, Port, TransportZone};

/// Capacity of every change stream
const STREAM_CAPACITY: usize = 1024;

/// Producer ends of the daemon's change streams.
#[derive(Debug, Clone)]
pub struct ChangeSinks {
    pub zones: ChangeSink<TransportZone>,
    pub gateways: ChangeSink<DcGateway>,
    pub nodes: ChangeSink<Node>,
    pub ports: ChangeSink<Port>,
    pub monitor: ChangeSink<MonitorEvent>,
}

/// The assembled engine.
#[derive(Debug)]
pub struct ItmDaemon {
    ctx: Arc<ItmContext>,
    mesh: Arc<MeshReconciler>,
    lifecycle: Arc<LifecycleManager>,
    listeners: Listeners,
    subscriptions: Vec<JoinHandle<SubscriptionStats>>,
    sweep: Option<JoinHandle<()>>,
}

impl ItmDaemon {
    pub fn new(ctx: Arc<ItmContext>) -> Self {
        let mesh = MeshReconciler::new(Arc::clone(&ctx));
        let lifecycle = LifecycleManager::new(Arc::clone(&ctx));
        let listeners = Listeners::new(&ctx, &mesh, &lifecycle);
        Self {
            ctx,
            mesh,
            lifecycle,
            listeners,
            subscriptions: Vec::new(),
            sweep: None,
        }
    }

    pub fn context(&self) -> &Arc<ItmContext> {
        &self.ctx
    }

    pub fn mesh(&self) -> &Arc<MeshReconciler> {
        &self.mesh
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    pub fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.ctx.metrics
    }

    /// Rebuilds state and seeds the default zone without subscribing to
    /// any stream. Listeners can then be driven directly.
    pub async fn bootstrap(&self) -> ItmResult<()> {
        self.ctx.caches.rebuild(&self.ctx.store).await?;
        self.ensure_default_zone()
    }

    /// Bootstraps, subscribes every listener and starts the expiry sweep.
    ///
    /// Returns the producer ends of the change streams.
    pub async fn start(&mut self) -> ItmResult<ChangeSinks> {
        self.bootstrap().await?;

        let (zones, zone_stream) = change_stream(STREAM_CAPACITY);
        let (gateways, gateway_stream) = change_stream(STREAM_CAPACITY);
        let (nodes, node_stream) = change_stream(STREAM_CAPACITY);
        let (ports, port_stream) = change_stream(STREAM_CAPACITY);
        let (monitor, monitor_stream) = change_stream(STREAM_CAPACITY);

        self.subscriptions = vec![
            subscribe(zone_stream, Arc::clone(&self.listeners.zones)),
            subscribe(gateway_stream, Arc::clone(&self.listeners.gateways)),
            subscribe(node_stream, Arc::clone(&self.listeners.nodes)),
            subscribe(port_stream, Arc::clone(&self.listeners.ports)),
            subscribe(monitor_stream, Arc::clone(&self.listeners.monitor)),
        ];
        self.sweep = self.spawn_sweep()?;

        info!(
            workers = self.ctx.config.coordinator.workers,
            zones = self.ctx.caches.zones.len(),
            "itmd started"
        );
        Ok(ChangeSinks {
            zones,
            gateways,
            nodes,
            ports,
            monitor,
        })
    }

    /// Waits until every queued job has run.
    pub async fn wait_idle(&self) {
        self.ctx.coordinator.wait_idle().await;
    }

    /// Stops the sweep, drains the coordinator and ends the subscriptions.
    pub async fn shutdown(&mut self) {
        if let Some(sweep) = self.sweep.take() {
            sweep.abort();
        }
        self.ctx.coordinator.shutdown().await;
        for task in self.subscriptions.drain(..) {
            task.abort();
        }
        info!(
            jobs_completed = self.ctx.metrics.jobs_completed(),
            jobs_failed = self.ctx.metrics.jobs_failed(),
            "itmd stopped"
        );
    }

    fn ensure_default_zone(&self) -> ItmResult<()> {
        let config = &self.ctx.config.default_zone;
        if !config.enabled || self.ctx.caches.zones.contains_key(&config.name) {
            return Ok(());
        }

        info!(zone = %config.name, kind = %config.tunnel_kind, "creating default transport zone");
        self.listeners
            .zones
            .on_change(Change::added(TransportZone::new(
                config.name.clone(),
                config.tunnel_kind,
            )))
            .map_err(|e| ItmError::internal(format!("default zone: {}", e)))
    }

    fn spawn_sweep(&self) -> ItmResult<Option<JoinHandle<()>>> {
        let Some(ttl) = self.ctx.config.not_hosted_ttl() else {
            debug!("not-hosted expiry disabled");
            return Ok(None);
        };
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| ItmError::invalid_config("not_hosted.ttl_secs", e.to_string()))?;
        let period = self.ctx.config.sweep_interval();
        let mesh = Arc::clone(&self.mesh);

        Ok(Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                match mesh.sweep_not_hosted(Utc::now() - ttl).await {
                    Ok(0) => {}
                    Ok(zones) => debug!(zones, "not-hosted expiry scheduled"),
                    Err(e) => warn!(error = %e, "not-hosted sweep failed"),
                }
            }
        })))
    }
}
