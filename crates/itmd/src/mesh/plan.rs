//! Pure mesh planning: membership diffing and desired tunnel sets.
//!
//! Everything here works on snapshots and returns plans; the reconciler
//! applies them through the store and the provisioner.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use itertools::Itertools;

use crate::mesh::not_hosted::{dpn_dependency, zone_dependency, NotHostedZone, ParkedVtep};
use crate::types::{
    DcGateway, DpnId, ExternalEndpoint, HostedVtep, MonitoringConfig, TransportZone, Tunnel,
    TunnelEndpoints, TunnelName, Vtep, VtepKey, VtepOrigin,
};

/// Snapshot a membership plan is computed from.
pub struct MembershipInput<'a> {
    pub zone_name: &'a str,
    /// Desired configuration; `None` when the zone is not configured.
    pub zone: Option<&'a TransportZone>,
    /// VTEPs declared by live bridges for this zone.
    pub southbound: &'a [(VtepKey, Vtep)],
    /// Current `VTEP` table rows of the zone.
    pub hosted: &'a BTreeMap<VtepKey, HostedVtep>,
    /// Current `TZ_NOT_HOSTED` record of the zone.
    pub not_hosted: &'a NotHostedZone,
    pub is_dpn_hosted: &'a dyn Fn(DpnId) -> bool,
    pub now: DateTime<Utc>,
}

/// Membership changes for one zone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MembershipPlan {
    /// Rows to write to the `VTEP` table.
    pub host: Vec<HostedVtep>,
    /// Rows to delete from the `VTEP` table.
    pub unhost: Vec<VtepKey>,
    /// The zone's next `TZ_NOT_HOSTED` record.
    pub not_hosted: NotHostedZone,
    /// Parked members that are hosted by this plan.
    pub promoted: Vec<VtepKey>,
    /// Members dropped because their IP is taken in the zone.
    pub rejected: Vec<VtepKey>,
    /// Hosted members after the plan is applied.
    pub members: BTreeMap<VtepKey, HostedVtep>,
}

impl MembershipPlan {
    pub fn changes_membership(&self) -> bool {
        !self.host.is_empty() || !self.unhost.is_empty()
    }
}

/// Desired members of a zone with set semantics.
///
/// Configured members win over southbound ones; within each source the
/// first declaration of an IP wins.
fn desired_members(
    zone: &TransportZone,
    southbound: &[(VtepKey, Vtep)],
) -> (BTreeMap<VtepKey, (Vtep, VtepOrigin)>, Vec<VtepKey>) {
    let configured = zone.members();
    let mut rejected: Vec<VtepKey> = zone
        .vteps
        .iter()
        .map(|v| v.key(&zone.name))
        .filter(|k| !configured.contains_key(k))
        .collect();

    let mut ips: BTreeSet<IpAddr> = configured.keys().map(|k| k.ip).collect();
    let mut desired: BTreeMap<VtepKey, (Vtep, VtepOrigin)> = configured
        .into_iter()
        .map(|(k, v)| (k, (v, VtepOrigin::Config)))
        .collect();

    for (key, vtep) in southbound {
        if desired.contains_key(key) {
            continue;
        }
        if !ips.insert(key.ip) {
            rejected.push(key.clone());
            continue;
        }
        desired.insert(key.clone(), (vtep.clone(), VtepOrigin::Southbound));
    }

    rejected.sort();
    rejected.dedup();
    (desired, rejected)
}

/// Computes the membership plan of a zone.
pub fn plan_membership(input: &MembershipInput<'_>) -> MembershipPlan {
    let mut plan = MembershipPlan {
        not_hosted: input.not_hosted.clone(),
        ..Default::default()
    };

    let Some(zone) = input.zone else {
        // Unconfigured zone: nothing is hosted; southbound VTEPs wait for it
        // until they expire.
        plan.unhost = input.hosted.keys().cloned().collect();
        let wanted: BTreeSet<String> = input.southbound.iter().map(|(k, _)| k.store_key()).collect();
        plan.not_hosted.expired.retain(|k| wanted.contains(k));
        let stale: Vec<String> = plan
            .not_hosted
            .parked
            .iter()
            .map(|(k, _)| k.clone())
            .filter(|k| !wanted.contains(k))
            .collect();
        for key in stale {
            plan.not_hosted.parked.remove(&key);
        }
        for (key, vtep) in input.southbound {
            if plan.not_hosted.expired.contains(&key.store_key()) {
                continue;
            }
            let parked = ParkedVtep {
                key: key.clone(),
                vtep: vtep.clone(),
                origin: VtepOrigin::Southbound,
            };
            plan.not_hosted.parked.park(
                key.store_key(),
                parked,
                [zone_dependency(input.zone_name)],
                input.now,
            );
        }
        return plan;
    };

    let (desired, rejected) = desired_members(zone, input.southbound);
    plan.rejected = rejected;

    let desired_keys: BTreeSet<String> = desired.keys().map(|k| k.store_key()).collect();
    plan.not_hosted.expired.retain(|k| desired_keys.contains(k));

    let stale: Vec<String> = plan
        .not_hosted
        .parked
        .iter()
        .map(|(k, _)| k.clone())
        .filter(|k| !desired_keys.contains(k))
        .collect();
    for key in stale {
        plan.not_hosted.parked.remove(&key);
    }

    let mut keep: BTreeSet<VtepKey> = BTreeSet::new();
    for (key, (vtep, origin)) in desired {
        let store_key = key.store_key();
        if plan.not_hosted.expired.contains(&store_key) {
            continue;
        }

        if (input.is_dpn_hosted)(key.dpn) {
            if plan.not_hosted.parked.remove(&store_key).is_some() {
                plan.promoted.push(key.clone());
            }
            let row = HostedVtep {
                key: key.clone(),
                vtep,
                kind: zone.tunnel_kind,
                origin,
            };
            if input.hosted.get(&key) != Some(&row) {
                plan.host.push(row.clone());
            }
            plan.members.insert(key.clone(), row);
            keep.insert(key);
        } else {
            let dpn = key.dpn;
            plan.not_hosted.parked.park(
                store_key,
                ParkedVtep { key, vtep, origin },
                [dpn_dependency(dpn)],
                input.now,
            );
        }
    }

    plan.unhost = input
        .hosted
        .keys()
        .filter(|k| !keep.contains(k))
        .cloned()
        .collect();
    plan
}

/// Computes every tunnel a zone should have.
///
/// - one internal tunnel per unordered pair of members on different DPNs
/// - one external tunnel per (member, hardware VTEP device)
/// - one external tunnel per (member, DC gateway)
pub fn desired_tunnels(
    zone: &TransportZone,
    members: &BTreeMap<VtepKey, HostedVtep>,
    gateways: &[DcGateway],
    monitoring: MonitoringConfig,
) -> BTreeMap<TunnelName, Tunnel> {
    let mut tunnels = BTreeMap::new();
    let mut add = |tunnel: Tunnel| {
        tunnels.entry(tunnel.name.clone()).or_insert(tunnel);
    };

    for (a, b) in members.values().tuple_combinations() {
        if a.key.dpn == b.key.dpn {
            continue;
        }
        let endpoints = TunnelEndpoints::internal(a.key.clone(), b.key.clone());
        let parent = if endpoints.src_dpn() == a.key.dpn {
            &a.vtep.port_name
        } else {
            &b.vtep.port_name
        };
        add(Tunnel::new(endpoints, zone.tunnel_kind, monitoring).with_parent_interface(parent.clone()));
    }

    for member in members.values() {
        let external = |remote: ExternalEndpoint| TunnelEndpoints::External {
            dpn: member.key.dpn,
            src_ip: member.key.ip,
            zone: Some(zone.name.clone()),
            remote,
        };
        for device in zone.devices() {
            let endpoints = external(ExternalEndpoint::DeviceVtep {
                node_id: device.node_id,
                ip: device.ip,
            });
            add(Tunnel::new(endpoints, zone.tunnel_kind, monitoring)
                .with_parent_interface(member.vtep.port_name.clone()));
        }
        for gateway in gateways {
            let endpoints = external(ExternalEndpoint::DcGateway { ip: gateway.ip });
            add(Tunnel::new(endpoints, gateway.tunnel_kind, monitoring)
                .with_parent_interface(member.vtep.port_name.clone()));
        }
    }

    tunnels
}

/// Tunnel changes for one zone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TunnelPlan {
    pub create: Vec<Tunnel>,
    pub remove: Vec<Tunnel>,
    /// Existing tunnels whose monitoring parameters changed.
    pub retune: Vec<(TunnelName, MonitoringConfig)>,
}

impl TunnelPlan {
    pub fn is_empty(&self) -> bool {
        self.create.is_empty() && self.remove.is_empty() && self.retune.is_empty()
    }
}

/// Diffs desired tunnels against existing ones by name.
///
/// Names cover endpoints and kind, so a kind change shows up as a full
/// remove plus create.
pub fn plan_tunnels(
    desired: &BTreeMap<TunnelName, Tunnel>,
    existing: &BTreeMap<TunnelName, Tunnel>,
) -> TunnelPlan {
    let mut plan = TunnelPlan::default();
    for (name, tunnel) in existing {
        match desired.get(name) {
            None => plan.remove.push(tunnel.clone()),
            Some(want) if want.monitoring != tunnel.monitoring => {
                plan.retune.push((name.clone(), want.monitoring));
            }
            Some(_) => {}
        }
    }
    for (name, tunnel) in desired {
        if !existing.contains_key(name) {
            plan.create.push(tunnel.clone());
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeviceVtep, TunnelKind};
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn zone(members: &[(u64, &str)]) -> TransportZone {
        members.iter().fold(TransportZone::new("tz", TunnelKind::Vxlan), |z, (dpn, addr)| {
            z.with_vtep(Vtep::new(DpnId(*dpn), ip(addr)))
        })
    }

    fn plan(
        zone: Option<&TransportZone>,
        southbound: &[(VtepKey, Vtep)],
        hosted: &BTreeMap<VtepKey, HostedVtep>,
        not_hosted: &NotHostedZone,
        live: &[u64],
    ) -> MembershipPlan {
        let live: Vec<DpnId> = live.iter().map(|d| DpnId(*d)).collect();
        let is_dpn_hosted = move |dpn: DpnId| live.contains(&dpn);
        plan_membership(&MembershipInput {
            zone_name: "tz",
            zone,
            southbound,
            hosted,
            not_hosted,
            is_dpn_hosted: &is_dpn_hosted,
            now: Utc::now(),
        })
    }

    fn members(plan: &MembershipPlan) -> Vec<u64> {
        plan.members.keys().map(|k| k.dpn.0).collect()
    }

    #[test]
    fn test_hosted_and_parked_split() {
        let z = zone(&[(1, "10.0.0.1"), (2, "10.0.0.2"), (3, "10.0.0.3")]);
        let p = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1, 2]);

        assert_eq!(members(&p), vec![1, 2]);
        assert_eq!(p.host.len(), 2);
        assert!(p.unhost.is_empty());
        assert!(p.not_hosted.waits_on_dpn(DpnId(3)));
        assert_eq!(p.not_hosted.parked.len(), 1);
    }

    #[test]
    fn test_replay_is_a_no_op() {
        let z = zone(&[(1, "10.0.0.1"), (2, "10.0.0.2"), (3, "10.0.0.3")]);
        let first = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1, 2]);
        let second = plan(Some(&z), &[], &first.members, &first.not_hosted, &[1, 2]);

        assert!(!second.changes_membership());
        assert_eq!(second.members, first.members);
        assert_eq!(second.not_hosted, first.not_hosted);
    }

    #[test]
    fn test_parked_member_is_promoted() {
        let z = zone(&[(1, "10.0.0.1"), (3, "10.0.0.3")]);
        let first = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1]);
        let second = plan(Some(&z), &[], &first.members, &first.not_hosted, &[1, 3]);

        assert_eq!(second.promoted, vec![VtepKey::new("tz", DpnId(3), ip("10.0.0.3"))]);
        assert_eq!(second.host.len(), 1);
        assert!(second.not_hosted.parked.is_empty());
        assert_eq!(members(&second), vec![1, 3]);
    }

    #[test]
    fn test_lost_dpn_is_unhosted_and_re_parked() {
        let z = zone(&[(1, "10.0.0.1"), (2, "10.0.0.2")]);
        let first = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1, 2]);
        let second = plan(Some(&z), &[], &first.members, &first.not_hosted, &[1]);

        assert_eq!(second.unhost, vec![VtepKey::new("tz", DpnId(2), ip("10.0.0.2"))]);
        assert!(second.not_hosted.waits_on_dpn(DpnId(2)));
        assert_eq!(members(&second), vec![1]);
    }

    #[test]
    fn test_duplicate_ip_rejected() {
        let z = zone(&[(1, "10.0.0.1"), (2, "10.0.0.1")]);
        let sb_vtep = Vtep::new(DpnId(4), ip("10.0.0.1"));
        let southbound = vec![(sb_vtep.key("tz"), sb_vtep)];
        let p = plan(Some(&z), &southbound, &BTreeMap::new(), &NotHostedZone::default(), &[1, 2, 4]);

        assert_eq!(members(&p), vec![1]);
        assert_eq!(
            p.rejected,
            vec![
                VtepKey::new("tz", DpnId(2), ip("10.0.0.1")),
                VtepKey::new("tz", DpnId(4), ip("10.0.0.1")),
            ]
        );
    }

    #[test]
    fn test_unconfigured_zone_parks_southbound_vteps() {
        let z = zone(&[(1, "10.0.0.1")]);
        let hosted = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1]).members;

        let sb_vtep = Vtep::new(DpnId(1), ip("10.0.0.1"));
        let southbound = vec![(sb_vtep.key("tz"), sb_vtep)];
        let p = plan(None, &southbound, &hosted, &NotHostedZone::default(), &[1]);

        assert_eq!(p.unhost.len(), 1);
        assert!(p.members.is_empty());
        assert!(p
            .not_hosted
            .parked
            .is_waiting_on(&zone_dependency("tz")));
    }

    #[test]
    fn test_southbound_vtep_waiting_for_zone_stays_expired() {
        let sb_vtep = Vtep::new(DpnId(5), ip("10.0.0.5"));
        let southbound = vec![(sb_vtep.key("tz"), sb_vtep)];
        let first = plan(None, &southbound, &BTreeMap::new(), &NotHostedZone::default(), &[5]);
        let mut record = first.not_hosted.clone();
        record.expire("tz", Utc::now() + chrono::Duration::seconds(1));

        let second = plan(None, &southbound, &BTreeMap::new(), &record, &[5]);
        assert!(second.not_hosted.parked.is_empty());
        assert_eq!(second.not_hosted.expired, record.expired);

        // The bridge stops declaring it, so it is forgotten.
        let third = plan(None, &[], &BTreeMap::new(), &second.not_hosted, &[5]);
        assert!(third.not_hosted.is_empty());
    }

    #[test]
    fn test_expired_member_is_ignored_until_removed_from_config() {
        let z = zone(&[(1, "10.0.0.1"), (3, "10.0.0.3")]);
        let first = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1]);
        let mut record = first.not_hosted.clone();
        record.expire("tz", Utc::now() + chrono::Duration::seconds(1));
        assert_eq!(record.expired.len(), 1);

        let second = plan(Some(&z), &[], &first.members, &record, &[1, 3]);
        assert_eq!(members(&second), vec![1]);
        assert!(second.not_hosted.parked.is_empty());

        let shrunk = zone(&[(1, "10.0.0.1")]);
        let third = plan(Some(&shrunk), &[], &second.members, &second.not_hosted, &[1, 3]);
        assert!(third.not_hosted.expired.is_empty());
    }

    #[test]
    fn test_full_mesh_one_tunnel_per_pair() {
        let z = zone(&[(1, "10.0.0.1"), (2, "10.0.0.2"), (3, "10.0.0.3"), (3, "10.0.0.33")]);
        let p = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1, 2, 3]);
        let tunnels = desired_tunnels(&z, &p.members, &[], MonitoringConfig::default());

        // 4 members, C(4,2) = 6 pairs, minus the same-DPN pair on DPN 3.
        assert_eq!(tunnels.len(), 5);
        for t in tunnels.values() {
            match &t.endpoints {
                TunnelEndpoints::Internal { src, dst } => assert!(src.dpn < dst.dpn),
                other => panic!("unexpected endpoints {:?}", other),
            }
        }
    }

    #[test]
    fn test_external_tunnels_per_member() {
        let z = zone(&[(1, "10.0.0.1"), (2, "10.0.0.2")]).with_device(DeviceVtep {
            node_id: "hwvtep://tor1".into(),
            ip: ip("192.168.1.1"),
        });
        let p = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1, 2]);
        let gateways = [DcGateway {
            ip: ip("172.16.0.1"),
            tunnel_kind: TunnelKind::MplsOverGre,
        }];
        let tunnels = desired_tunnels(&z, &p.members, &gateways, MonitoringConfig::default());

        // 1 internal + 2 device + 2 gateway
        assert_eq!(tunnels.len(), 5);
        let gw: Vec<_> = tunnels
            .values()
            .filter(|t| t.kind == TunnelKind::MplsOverGre)
            .collect();
        assert_eq!(gw.len(), 2);
    }

    #[test]
    fn test_plan_tunnels_diff() {
        let z = zone(&[(1, "10.0.0.1"), (2, "10.0.0.2"), (3, "10.0.0.3")]);
        let all = plan(Some(&z), &[], &BTreeMap::new(), &NotHostedZone::default(), &[1, 2, 3]);
        let existing = desired_tunnels(&z, &all.members, &[], MonitoringConfig::default());

        let monitored = MonitoringConfig {
            enabled: true,
            ..Default::default()
        };
        let fewer = plan(Some(&z), &[], &all.members, &all.not_hosted, &[1, 2]);
        let desired = desired_tunnels(&z, &fewer.members, &[], monitored);

        let diff = plan_tunnels(&desired, &existing);
        assert_eq!(diff.remove.len(), 2);
        assert!(diff.create.is_empty());
        assert_eq!(diff.retune.len(), 1);

        let mut gre = z.clone();
        gre.tunnel_kind = TunnelKind::Gre;
        let rebuilt = desired_tunnels(&gre, &all.members, &[], MonitoringConfig::default());
        let diff = plan_tunnels(&rebuilt, &existing);
        assert_eq!(diff.remove.len(), 3);
        assert_eq!(diff.create.len(), 3);
    }
}
