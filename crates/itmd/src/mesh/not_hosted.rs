//! Not-hosted VTEP registry.
//!
//! One record per zone in `TZ_NOT_HOSTED`, owned by that zone's jobs. An
//! entry waits on `dpn:<id>` until its datapath is discovered, or on
//! `zone:<name>` for a southbound VTEP naming a zone that is not configured.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use itm_common::{Dependency, ParkedSet};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::tables::dependency;
use crate::types::{DpnId, Vtep, VtepKey, VtepOrigin};

/// A zone member waiting for its hosting DPN or its zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedVtep {
    pub key: VtepKey,
    pub vtep: Vtep,
    pub origin: VtepOrigin,
}

/// The `TZ_NOT_HOSTED` record of a zone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotHostedZone {
    pub parked: ParkedSet<ParkedVtep>,
    /// Members given up on by the expiry sweep, ignored until they leave
    /// the zone configuration.
    #[serde(default)]
    pub expired: BTreeSet<String>,
}

impl NotHostedZone {
    pub fn is_empty(&self) -> bool {
        self.parked.is_empty() && self.expired.is_empty()
    }

    /// Returns true if any entry waits on `dpn`.
    pub fn waits_on_dpn(&self, dpn: DpnId) -> bool {
        self.parked.is_waiting_on(&dpn_dependency(dpn))
    }

    pub fn parked_keys(&self) -> Vec<VtepKey> {
        self.parked.iter().map(|(_, e)| e.data.key.clone()).collect()
    }

    /// Drops entries parked before `cutoff` and remembers them as expired.
    pub fn expire(&mut self, zone: &str, cutoff: DateTime<Utc>) -> Vec<VtepKey> {
        let expired: Vec<VtepKey> = self
            .parked
            .expire(cutoff)
            .into_iter()
            .map(|(key, parked)| {
                self.expired.insert(key);
                parked.key
            })
            .collect();
        for key in &expired {
            warn!(zone, vtep = %key, "not-hosted VTEP expired");
        }
        expired
    }
}

pub fn dpn_dependency(dpn: DpnId) -> Dependency {
    Dependency::new(dependency::DPN, dpn.to_string())
}

pub fn zone_dependency(zone: &str) -> Dependency {
    Dependency::new(dependency::ZONE, zone)
}
