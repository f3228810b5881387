//! Tunnel and VM-interface lifecycle jobs.

use std::sync::Arc;

use itm_common::{Change, TaskError};
use tracing::{debug, info};

use crate::context::ItmContext;
use crate::coordinator::JobTicket;
use crate::error::ItmResult;
use crate::lifecycle::migration::MigrationGuard;
use crate::lifecycle::state::{apply, LifecycleEvent, Transition};
use crate::store::Transaction;
use crate::tables::{job_key, job_keys, Table};
use crate::types::{InterfaceBinding, Port, PortId, Tunnel, TunnelName};

/// Applies `event` to the stored tunnel `name`.
///
/// Must run under the tunnel's zone key. Returns `None` when the tunnel is
/// not (or no longer) stored.
pub async fn apply_event(
    ctx: &ItmContext,
    name: &TunnelName,
    event: LifecycleEvent,
) -> ItmResult<Option<Transition>> {
    let Some(mut tunnel) = ctx.store.get::<Tunnel>(Table::Tunnel, name.as_str()).await? else {
        debug!(tunnel = %name, ?event, "event for unknown tunnel ignored");
        return Ok(None);
    };

    let transition = apply(&mut tunnel, event);

    // Propagate before committing so a failed commit repeats the command.
    if let Some(status) = transition.oper_change {
        ctx.provisioner.set_oper_state(name, status).await?;
    }
    if transition.dirty {
        let mut tx = Transaction::new();
        tx.put(Table::Tunnel, name.as_str(), &tunnel)?;
        ctx.store.commit(tx).await?;
    }

    if let Some(status) = transition.oper_change {
        ctx.metrics.record_oper_transition(status.as_str());
        info!(
            tunnel = %name,
            from = %transition.from,
            to = %transition.to,
            oper_status = %status,
            "tunnel status changed"
        );
    } else if transition.state_changed() {
        debug!(tunnel = %name, from = %transition.from, to = %transition.to, "tunnel state changed");
    }
    Ok(Some(transition))
}

/// Schedules lifecycle events and VM-interface bindings.
pub struct LifecycleManager {
    ctx: Arc<ItmContext>,
    guard: Arc<MigrationGuard>,
}

impl LifecycleManager {
    pub fn new(ctx: Arc<ItmContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            guard: Arc::new(MigrationGuard::new()),
        })
    }

    pub fn guard(&self) -> &Arc<MigrationGuard> {
        &self.guard
    }

    /// Schedules `event` for tunnel `name`.
    ///
    /// The tunnel job only resolves the owning zone; the event itself is
    /// applied by a follow-up job on the zone key, serialised with mesh
    /// changes of that zone.
    pub fn schedule_event(self: &Arc<Self>, name: TunnelName, event: LifecycleEvent) -> ItmResult<JobTicket> {
        let this = Arc::clone(self);
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::TUNNEL, &name), move || {
                let this = Arc::clone(&this);
                let name = name.clone();
                async move { this.route_event(&name, event).await.map_err(TaskError::from) }
            })
    }

    async fn route_event(self: &Arc<Self>, name: &TunnelName, event: LifecycleEvent) -> ItmResult<()> {
        let Some(tunnel) = self.ctx.store.get::<Tunnel>(Table::Tunnel, name.as_str()).await? else {
            debug!(tunnel = %name, ?event, "event for unknown tunnel ignored");
            return Ok(());
        };
        let Some(zone) = tunnel.zone else {
            apply_event(&self.ctx, name, event).await?;
            return Ok(());
        };

        let ctx = Arc::clone(&self.ctx);
        let name = name.clone();
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::ZONE, &zone), move || {
                let ctx = Arc::clone(&ctx);
                let name = name.clone();
                async move {
                    apply_event(&ctx, &name, event)
                        .await
                        .map(|_| ())
                        .map_err(TaskError::from)
                }
            })?;
        Ok(())
    }

    /// Handles a notification for a tunnel's dataplane port.
    ///
    /// The port is cached before the event is scheduled, so a tunnel whose
    /// row is committed later still finds it.
    pub fn on_tunnel_port(self: &Arc<Self>, change: &Change<Port>) -> ItmResult<()> {
        let Some(port) = change.latest() else {
            return Ok(());
        };
        let name = TunnelName::from_raw(port.name.clone());
        match &change.new {
            Some(port) => {
                self.ctx.caches.tunnel_ports.put(name.clone(), port.clone());
            }
            None => {
                self.ctx.caches.tunnel_ports.remove(&name);
            }
        }
        self.schedule_event(name, LifecycleEvent::from_port(change.new.as_ref()))?;
        Ok(())
    }

    /// Handles a port notification for a VM interface.
    pub fn on_interface_port(self: &Arc<Self>, change: &Change<Port>) -> ItmResult<()> {
        match (&change.old, &change.new) {
            (_, Some(port)) => self.interface_up(port),
            (Some(port), None) => self.interface_down(port),
            (None, None) => Ok(()),
        }
    }

    fn interface_up(self: &Arc<Self>, port: &Port) -> ItmResult<()> {
        let name = port.name.clone();

        if let Some(bound) = self.ctx.caches.interfaces.get(&name) {
            if bound.port != port.id {
                let ticket = self.schedule_unbind(&name, bound.port)?;
                if bound.dpn() != port.id.dpn {
                    let generation = self.guard.register(&name, bound.port, port.id);
                    self.ctx.metrics.record_migration();
                    info!(
                        interface = %name,
                        from = %bound.port,
                        to = %port.id,
                        "interface migrated to another DPN"
                    );
                    self.guard
                        .watch(name.clone(), generation, ticket, self.ctx.config.guard_timeout());
                }
            }
        }

        let binding = InterfaceBinding {
            name: name.clone(),
            port: port.id,
            oper_up: port.oper_up,
        };
        if self.ctx.caches.interfaces.get(&name).as_deref() == Some(&binding) {
            debug!(interface = %name, port = %port.id, "interface already bound");
            return Ok(());
        }
        self.ctx.caches.interfaces.put(name, binding.clone());
        self.schedule_bind(binding)?;
        Ok(())
    }

    fn interface_down(self: &Arc<Self>, port: &Port) -> ItmResult<()> {
        let name = &port.name;

        if self.guard.is_guarding_remove(name, port.id) {
            debug!(interface = %name, port = %port.id, "remove of migrated port ignored");
            return Ok(());
        }
        match self.ctx.caches.interfaces.get(name) {
            Some(bound) if bound.port == port.id => {}
            _ => {
                debug!(interface = %name, port = %port.id, "stale interface remove ignored");
                return Ok(());
            }
        }

        self.ctx.caches.interfaces.remove(name);
        self.schedule_unbind(name, port.id)?;
        Ok(())
    }

    fn schedule_bind(&self, binding: InterfaceBinding) -> ItmResult<JobTicket> {
        let ctx = Arc::clone(&self.ctx);
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::INTERFACE, &binding.name), move || {
                let ctx = Arc::clone(&ctx);
                let binding = binding.clone();
                async move { bind_interface(&ctx, &binding).await.map_err(TaskError::from) }
            })
    }

    fn schedule_unbind(&self, name: &str, port: PortId) -> ItmResult<JobTicket> {
        let ctx = Arc::clone(&self.ctx);
        let name = name.to_string();
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::INTERFACE, &name), move || {
                let ctx = Arc::clone(&ctx);
                let name = name.clone();
                async move { unbind_interface(&ctx, &name, port).await.map_err(TaskError::from) }
            })
    }
}

impl std::fmt::Debug for LifecycleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleManager")
            .field("guard", &self.guard)
            .finish_non_exhaustive()
    }
}

async fn bind_interface(ctx: &ItmContext, binding: &InterfaceBinding) -> ItmResult<()> {
    ctx.provisioner.bind_interface(&binding.name, binding.port).await?;

    let mut tx = Transaction::new();
    tx.put(Table::InterfaceState, binding.name.as_str(), binding)?;
    ctx.store.commit(tx).await?;
    debug!(interface = %binding.name, port = %binding.port, "interface bound");
    Ok(())
}

async fn unbind_interface(ctx: &ItmContext, name: &str, port: PortId) -> ItmResult<()> {
    ctx.provisioner.unbind_interface(name, port).await?;

    // A newer binding may already be stored; only our own record goes.
    let stored = ctx.store.get::<InterfaceBinding>(Table::InterfaceState, name).await?;
    if stored.is_some_and(|b| b.port == port) {
        let mut tx = Transaction::new();
        tx.delete(Table::InterfaceState, name);
        ctx.store.commit(tx).await?;
    }
    debug!(interface = name, port = %port, "interface unbound");
    Ok(())
}
