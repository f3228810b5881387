//! Mesh reconciliation jobs.
//!
//! Every write to a zone's `VTEP`, `TZ_NOT_HOSTED` and `TUNNEL` rows runs in
//! a job keyed `zone:<name>`, so two reconciliations of one zone never
//! interleave. DPN and gateway events run under their own keys and only
//! work out which zones to reconcile.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use itm_common::{Change, TaskError};
use tracing::{debug, info, warn};

use crate::cache::DpnInfo;
use crate::context::ItmContext;
use crate::coordinator::JobTicket;
use crate::error::ItmResult;
use crate::lifecycle::{self, LifecycleEvent};
use crate::mesh::not_hosted::NotHostedZone;
use crate::mesh::plan::{desired_tunnels, plan_membership, plan_tunnels, MembershipInput};
use crate::provisioner::CreateTunnel;
use crate::store::Transaction;
use crate::tables::{job_key, job_keys, join_key, key_prefix, Table};
use crate::types::{
    DcGateway, DpnId, HostedVtep, TransportZone, Tunnel, TunnelName, Vtep, VtepKey,
};

/// Counters describing one zone reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ZoneReport {
    pub members: usize,
    pub parked: usize,
    pub promoted: usize,
    pub rejected: usize,
    pub created: usize,
    pub removed: usize,
    pub retuned: usize,
    pub rescheduled: bool,
}

/// DPN hosting answers and southbound VTEPs a plan was computed from.
#[derive(Debug, PartialEq, Eq)]
struct TopologyView {
    hosted: BTreeMap<DpnId, bool>,
    southbound: Vec<(VtepKey, Vtep)>,
}

/// Converges zones to their desired tunnel mesh.
pub struct MeshReconciler {
    ctx: Arc<ItmContext>,
}

impl MeshReconciler {
    pub fn new(ctx: Arc<ItmContext>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Schedules a reconciliation of `zone`.
    pub fn schedule_zone(self: &Arc<Self>, zone: &str) -> ItmResult<JobTicket> {
        let this = Arc::clone(self);
        let name = zone.to_string();
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::ZONE, zone), move || {
                let this = Arc::clone(&this);
                let name = name.clone();
                async move {
                    this.reconcile_zone(&name)
                        .await
                        .map(|_| ())
                        .map_err(TaskError::from)
                }
            })
    }

    /// Schedules the follow-up of a newly hosted DPN, or of a change of its
    /// southbound VTEP.
    pub fn schedule_dpn_hosted(
        self: &Arc<Self>,
        dpn: DpnId,
        zones: BTreeSet<String>,
    ) -> ItmResult<JobTicket> {
        let this = Arc::clone(self);
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::DPN, dpn), move || {
                let this = Arc::clone(&this);
                let zones = zones.clone();
                async move { this.on_dpn_hosted(dpn, zones).await.map_err(TaskError::from) }
            })
    }

    /// Schedules the teardown that follows the logical removal of a DPN.
    pub fn schedule_dpn_removed(self: &Arc<Self>, info: DpnInfo) -> ItmResult<JobTicket> {
        let this = Arc::clone(self);
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::DPN, info.id), move || {
                let this = Arc::clone(&this);
                let info = info.clone();
                async move { this.on_dpn_removed(&info).await.map_err(TaskError::from) }
            })
    }

    /// Schedules persistence of a gateway change and the zone fan-out.
    pub fn schedule_gateway(self: &Arc<Self>, change: Change<DcGateway>) -> ItmResult<JobTicket> {
        let ip = change
            .latest()
            .map(|gw| gw.ip.to_string())
            .unwrap_or_default();
        let this = Arc::clone(self);
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::GATEWAY, &ip), move || {
                let this = Arc::clone(&this);
                let change = change.clone();
                async move { this.on_gateway(&change).await.map_err(TaskError::from) }
            })
    }

    /// Schedules expiry of parked VTEPs of `zone` parked before `cutoff`.
    pub fn schedule_expiry(self: &Arc<Self>, zone: &str, cutoff: DateTime<Utc>) -> ItmResult<JobTicket> {
        let this = Arc::clone(self);
        let name = zone.to_string();
        self.ctx
            .coordinator
            .enqueue(job_key(job_keys::ZONE, zone), move || {
                let this = Arc::clone(&this);
                let name = name.clone();
                async move {
                    this.expire_not_hosted(&name, cutoff)
                        .await
                        .map(|_| ())
                        .map_err(TaskError::from)
                }
            })
    }

    /// Schedules an expiry job for every zone with parked VTEPs.
    pub async fn sweep_not_hosted(self: &Arc<Self>, cutoff: DateTime<Utc>) -> ItmResult<usize> {
        let records: Vec<(String, NotHostedZone)> = self.ctx.store.list(Table::NotHosted).await?;
        let mut scheduled = 0;
        for (zone, record) in records {
            if record.parked.iter().any(|(_, e)| e.parked_at < cutoff) {
                self.schedule_expiry(&zone, cutoff)?;
                scheduled += 1;
            }
        }
        Ok(scheduled)
    }

    /// Converges one zone: membership first, then tunnels, then
    /// monitoring.
    pub async fn reconcile_zone(self: &Arc<Self>, name: &str) -> ItmResult<ZoneReport> {
        let store = &self.ctx.store;
        let zone = self.ctx.caches.zones.get(&name.to_string());
        let stored: Option<TransportZone> = store.get(Table::Zone, name).await?;
        let hosted = self.load_hosted(name).await?;
        let not_hosted: NotHostedZone = store.get(Table::NotHosted, name).await?.unwrap_or_default();

        let view = self.observe(name, zone.as_deref(), &hosted, &not_hosted);
        let is_dpn_hosted = |dpn: DpnId| view.hosted.get(&dpn).copied().unwrap_or(false);
        let plan = plan_membership(&MembershipInput {
            zone_name: name,
            zone: zone.as_deref(),
            southbound: &view.southbound,
            hosted: &hosted,
            not_hosted: &not_hosted,
            is_dpn_hosted: &is_dpn_hosted,
            now: Utc::now(),
        });

        for key in &plan.rejected {
            warn!(zone = name, vtep = %key, "VTEP IP already used in zone, skipped");
        }

        let mut tx = Transaction::new();
        for key in &plan.unhost {
            tx.delete(Table::Vtep, key.store_key());
        }
        for row in &plan.host {
            tx.put(Table::Vtep, row.key.store_key(), row)?;
        }
        if plan.not_hosted != not_hosted {
            if plan.not_hosted.is_empty() {
                tx.delete(Table::NotHosted, name);
            } else {
                tx.put(Table::NotHosted, name, &plan.not_hosted)?;
            }
        }
        store.commit(tx).await?;

        if plan.changes_membership() || !plan.promoted.is_empty() {
            info!(
                zone = name,
                members = plan.members.len(),
                hosted = plan.host.len(),
                unhosted = plan.unhost.len(),
                promoted = plan.promoted.len(),
                parked = plan.not_hosted.parked.len(),
                "zone membership updated"
            );
        }

        let mut report = ZoneReport {
            members: plan.members.len(),
            parked: plan.not_hosted.parked.len(),
            promoted: plan.promoted.len(),
            rejected: plan.rejected.len(),
            ..Default::default()
        };

        let monitoring = zone
            .as_deref()
            .and_then(|z| z.monitoring)
            .unwrap_or_else(|| self.ctx.default_monitoring());
        let existing = self.load_zone_tunnels(name).await?;
        let desired = match zone.as_deref() {
            Some(z) => {
                if let Some(old) = stored.as_ref().filter(|old| old.tunnel_kind != z.tunnel_kind) {
                    info!(
                        zone = name,
                        from = %old.tunnel_kind,
                        to = %z.tunnel_kind,
                        "tunnel kind changed, rebuilding zone tunnels"
                    );
                }
                let mut gateways: Vec<DcGateway> = self
                    .ctx
                    .caches
                    .gateways
                    .values()
                    .iter()
                    .map(|gw| gw.as_ref().clone())
                    .collect();
                gateways.sort_by_key(|gw| gw.ip);
                desired_tunnels(z, &plan.members, &gateways, monitoring)
            }
            None => BTreeMap::new(),
        };

        let tunnels = plan_tunnels(&desired, &existing);
        for tunnel in tunnels.remove {
            self.remove_tunnel(name, tunnel).await?;
            report.removed += 1;
        }
        for tunnel in tunnels.create {
            self.create_tunnel(name, tunnel).await?;
            report.created += 1;
        }

        if let (Some(z), Some(old)) = (zone.as_deref(), stored.as_ref()) {
            let before = old.monitoring.unwrap_or_else(|| self.ctx.default_monitoring());
            if before != monitoring {
                info!(
                    zone = name,
                    enabled = monitoring.enabled,
                    protocol = %monitoring.protocol,
                    interval_ms = monitoring.interval_ms,
                    "zone monitoring changed"
                );
                self.ctx
                    .provisioner
                    .toggle_monitoring(&z.name, &monitoring)
                    .await?;
            }
        }
        for (tunnel, params) in tunnels.retune {
            lifecycle::apply_event(&self.ctx, &tunnel, LifecycleEvent::Monitoring(params)).await?;
            report.retuned += 1;
        }

        let mut tx = Transaction::new();
        match zone.as_deref() {
            Some(z) if stored.as_ref() != Some(z) => {
                tx.put(Table::Zone, name, z)?;
            }
            None if stored.is_some() => {
                tx.delete(Table::Zone, name);
            }
            _ => {}
        }
        store.commit(tx).await?;

        // A DPN event may have been handled between our snapshot and commit
        // and missed the rows written above.
        let now = self.observe(name, zone.as_deref(), &hosted, &not_hosted);
        if now != view {
            debug!(zone = name, "topology changed during reconciliation, rescheduling");
            self.schedule_zone(name)?;
            report.rescheduled = true;
        }

        debug!(zone = name, ?report, "zone reconciled");
        Ok(report)
    }

    fn observe(
        &self,
        name: &str,
        zone: Option<&TransportZone>,
        hosted: &BTreeMap<VtepKey, HostedVtep>,
        not_hosted: &NotHostedZone,
    ) -> TopologyView {
        let southbound = self.southbound_vteps(name);
        let mut dpns: BTreeSet<DpnId> = hosted.keys().map(|k| k.dpn).collect();
        dpns.extend(not_hosted.parked_keys().iter().map(|k| k.dpn));
        dpns.extend(southbound.iter().map(|(k, _)| k.dpn));
        if let Some(z) = zone {
            dpns.extend(z.vteps.iter().map(|v| v.dpn));
        }
        TopologyView {
            hosted: dpns
                .into_iter()
                .map(|dpn| (dpn, self.ctx.caches.is_dpn_hosted(dpn)))
                .collect(),
            southbound,
        }
    }

    /// VTEPs declared for `zone` by live bridges.
    fn southbound_vteps(&self, zone: &str) -> Vec<(VtepKey, Vtep)> {
        let mut vteps: Vec<(VtepKey, Vtep)> = self
            .ctx
            .caches
            .dpns
            .values()
            .iter()
            .filter_map(|info| info.southbound_vtep.clone())
            .filter(|key| key.zone == zone)
            .map(|key| {
                let vtep = Vtep::new(key.dpn, key.ip);
                (key, vtep)
            })
            .collect();
        vteps.sort_by(|a, b| a.0.cmp(&b.0));
        vteps
    }

    async fn load_hosted(&self, zone: &str) -> ItmResult<BTreeMap<VtepKey, HostedVtep>> {
        let rows: Vec<(String, HostedVtep)> = self
            .ctx
            .store
            .list_prefix(Table::Vtep, &key_prefix(zone))
            .await?;
        Ok(rows
            .into_iter()
            .filter(|(_, row)| row.key.zone == zone)
            .map(|(_, row)| (row.key.clone(), row))
            .collect())
    }

    async fn load_zone_tunnels(&self, zone: &str) -> ItmResult<BTreeMap<TunnelName, Tunnel>> {
        let rows: Vec<(String, Tunnel)> = self.ctx.store.list(Table::Tunnel).await?;
        Ok(rows
            .into_iter()
            .filter(|(_, t)| t.zone.as_deref() == Some(zone))
            .map(|(_, t)| (t.name.clone(), t))
            .collect())
    }

    async fn create_tunnel(&self, zone: &str, mut tunnel: Tunnel) -> ItmResult<()> {
        // The dataplane may report the port before the row exists.
        let seen = self.ctx.caches.tunnel_ports.get(&tunnel.name);
        let folded = seen
            .as_deref()
            .map(|port| lifecycle::apply(&mut tunnel, LifecycleEvent::from_port(Some(port))));

        // Provision first: a retry after a failed commit repeats an
        // idempotent command instead of skipping it.
        self.ctx
            .provisioner
            .create_tunnel(&CreateTunnel::from(&tunnel))
            .await?;
        let oper_change = folded.and_then(|t| t.oper_change);
        if let Some(status) = oper_change {
            self.ctx
                .provisioner
                .set_oper_state(&tunnel.name, status)
                .await?;
        }

        let mut tx = Transaction::new();
        tx.put(Table::Tunnel, tunnel.name.as_str(), &tunnel)?;
        for dpn in tunnel.endpoints.dpns() {
            tx.put(
                Table::DpnTunnel,
                join_key(&[&dpn.to_string(), tunnel.name.as_str()]),
                &zone,
            )?;
        }
        self.ctx.store.commit(tx).await?;

        self.ctx.metrics.record_tunnel_created();
        if let Some(status) = oper_change {
            self.ctx.metrics.record_oper_transition(status.as_str());
        }
        info!(
            zone,
            tunnel = %tunnel.name,
            kind = %tunnel.kind,
            state = %tunnel.state,
            dpns = ?tunnel.endpoints.dpns(),
            "tunnel created"
        );

        // A port event handled while the row was in flight found no tunnel
        // and was dropped; apply what the dataplane reports now.
        let latest = self.ctx.caches.tunnel_ports.get(&tunnel.name);
        if latest != seen {
            lifecycle::apply_event(
                &self.ctx,
                &tunnel.name,
                LifecycleEvent::from_port(latest.as_deref()),
            )
            .await?;
        }
        Ok(())
    }

    async fn remove_tunnel(&self, zone: &str, mut tunnel: Tunnel) -> ItmResult<()> {
        let transition = lifecycle::apply(&mut tunnel, LifecycleEvent::Remove);
        self.ctx.provisioner.remove_tunnel(&tunnel.name).await?;

        let mut tx = Transaction::new();
        tx.delete(Table::Tunnel, tunnel.name.as_str());
        for dpn in tunnel.endpoints.dpns() {
            tx.delete(
                Table::DpnTunnel,
                join_key(&[&dpn.to_string(), tunnel.name.as_str()]),
            );
        }
        self.ctx.store.commit(tx).await?;

        self.ctx.metrics.record_tunnel_removed();
        info!(
            zone,
            tunnel = %tunnel.name,
            from = %transition.from,
            "tunnel removed"
        );
        Ok(())
    }

    async fn on_dpn_hosted(self: &Arc<Self>, dpn: DpnId, mut zones: BTreeSet<String>) -> ItmResult<()> {
        let records: Vec<(String, NotHostedZone)> = self.ctx.store.list(Table::NotHosted).await?;
        zones.extend(
            records
                .into_iter()
                .filter(|(_, record)| record.waits_on_dpn(dpn))
                .map(|(zone, _)| zone),
        );

        info!(dpn = %dpn, zones = ?zones, "DPN hosted, reconciling zones");
        for zone in &zones {
            self.schedule_zone(zone)?;
        }
        Ok(())
    }

    async fn on_dpn_removed(self: &Arc<Self>, info: &DpnInfo) -> ItmResult<()> {
        let dpn = info.id;
        let mut zones: BTreeSet<String> = BTreeSet::new();

        let index: Vec<(String, String)> = self
            .ctx
            .store
            .list_prefix(Table::DpnTunnel, &key_prefix(&dpn.to_string()))
            .await?;
        let tunnel_count = index.len();
        zones.extend(index.into_iter().map(|(_, zone)| zone));

        let vteps: Vec<(String, HostedVtep)> = self.ctx.store.list(Table::Vtep).await?;
        zones.extend(
            vteps
                .into_iter()
                .filter(|(_, row)| row.key.dpn == dpn)
                .map(|(_, row)| row.key.zone),
        );
        if let Some(key) = &info.southbound_vtep {
            zones.insert(key.zone.clone());
        }

        info!(
            dpn = %dpn,
            tunnels = tunnel_count,
            zones = ?zones,
            "DPN removed, tearing down its tunnels"
        );
        for zone in &zones {
            self.schedule_zone(zone)?;
        }
        Ok(())
    }

    async fn on_gateway(self: &Arc<Self>, change: &Change<DcGateway>) -> ItmResult<()> {
        let mut tx = Transaction::new();
        if let Some(old) = &change.old {
            tx.delete(Table::Gateway, old.ip.to_string());
        }
        if let Some(new) = &change.new {
            tx.put(Table::Gateway, new.ip.to_string(), new)?;
        }
        self.ctx.store.commit(tx).await?;

        let mut zones: Vec<String> = self
            .ctx
            .caches
            .zones
            .snapshot()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        zones.sort();
        debug!(zones = zones.len(), "gateway changed, reconciling zones");
        for zone in &zones {
            self.schedule_zone(zone)?;
        }
        Ok(())
    }

    /// Drops parked VTEPs of `zone` parked before `cutoff`.
    pub async fn expire_not_hosted(&self, zone: &str, cutoff: DateTime<Utc>) -> ItmResult<usize> {
        let Some(mut record) = self
            .ctx
            .store
            .get::<NotHostedZone>(Table::NotHosted, zone)
            .await?
        else {
            return Ok(0);
        };

        let expired = record.expire(zone, cutoff);
        if expired.is_empty() {
            return Ok(0);
        }

        let mut tx = Transaction::new();
        tx.put(Table::NotHosted, zone, &record)?;
        self.ctx.store.commit(tx).await?;
        self.ctx.metrics.record_not_hosted_expired(expired.len());
        debug!(zone, count = expired.len(), "parked VTEPs expired");
        Ok(expired.len())
    }
}

impl std::fmt::Debug for MeshReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshReconciler").finish_non_exhaustive()
    }
}
