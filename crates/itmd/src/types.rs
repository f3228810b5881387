//! Overlay data model: datapaths, endpoints, zones, tunnels.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use itm_common::Attributes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lifecycle::TunnelState;
use crate::tables::{external_ids, join_key, KEY_SEPARATOR};

/// Default liveness monitoring interval in milliseconds.
pub const DEFAULT_MONITOR_INTERVAL_MS: u32 = 1000;

/// Tunnel interface names must fit the 15-character kernel limit.
pub const TUNNEL_NAME_PREFIX: &str = "tun";
const TUNNEL_NAME_HASH_LEN: usize = 12;

/// Datapath node identity (64-bit datapath id).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DpnId(pub u64);

impl fmt::Display for DpnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DpnId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(DpnId)
            .map_err(|_| format!("Invalid DPN id: {}", s))
    }
}

impl From<u64> for DpnId {
    fn from(id: u64) -> Self {
        DpnId(id)
    }
}

/// Tunnel encapsulation, decided once at ingestion.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelKind {
    #[default]
    Vxlan,
    Gre,
    MplsOverGre,
}

impl TunnelKind {
    /// Returns the config string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelKind::Vxlan => "vxlan",
            TunnelKind::Gre => "gre",
            TunnelKind::MplsOverGre => "mpls-over-gre",
        }
    }
}

impl FromStr for TunnelKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vxlan" => Ok(TunnelKind::Vxlan),
            "gre" => Ok(TunnelKind::Gre),
            "mpls-over-gre" | "mplsovergre" => Ok(TunnelKind::MplsOverGre),
            _ => Err(format!("Unknown tunnel kind: {}", s)),
        }
    }
}

impl fmt::Display for TunnelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness monitoring protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorProtocol {
    #[default]
    Bfd,
    Lldp,
}

impl MonitorProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitorProtocol::Bfd => "bfd",
            MonitorProtocol::Lldp => "lldp",
        }
    }
}

impl fmt::Display for MonitorProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Liveness monitoring parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MonitoringConfig {
    pub enabled: bool,
    pub protocol: MonitorProtocol,
    pub interval_ms: u32,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            protocol: MonitorProtocol::Bfd,
            interval_ms: DEFAULT_MONITOR_INTERVAL_MS,
        }
    }
}

/// VTEP identity: (zone, DPN, IP).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VtepKey {
    pub zone: String,
    pub dpn: DpnId,
    pub ip: IpAddr,
}

impl VtepKey {
    pub fn new(zone: impl Into<String>, dpn: DpnId, ip: IpAddr) -> Self {
        Self {
            zone: zone.into(),
            dpn,
            ip,
        }
    }

    /// Store key `zone|dpn|ip`.
    pub fn store_key(&self) -> String {
        join_key(&[&self.zone, &self.dpn.to_string(), &self.ip.to_string()])
    }

    /// Parses a store key produced by [`VtepKey::store_key`].
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.rsplitn(3, KEY_SEPARATOR);
        let ip = parts.next()?.parse().ok()?;
        let dpn = parts.next()?.parse().ok()?;
        let zone = parts.next()?;
        Some(Self::new(zone, dpn, ip))
    }
}

impl fmt::Display for VtepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.store_key())
    }
}

/// A tunnel endpoint as configured in a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Vtep {
    pub dpn: DpnId,
    pub ip: IpAddr,
    #[serde(default)]
    pub port_name: String,
    #[serde(default)]
    pub vlan: u16,
    #[serde(default)]
    pub tos: Option<u8>,
}

impl Vtep {
    pub fn new(dpn: DpnId, ip: IpAddr) -> Self {
        Self {
            dpn,
            ip,
            port_name: String::new(),
            vlan: 0,
            tos: None,
        }
    }

    pub fn with_port_name(mut self, port_name: impl Into<String>) -> Self {
        self.port_name = port_name.into();
        self
    }

    pub fn key(&self, zone: &str) -> VtepKey {
        VtepKey::new(zone, self.dpn, self.ip)
    }
}

/// How a VTEP entered its zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VtepOrigin {
    /// Listed in the operator's zone configuration
    Config,
    /// Declared by a bridge's `tep-ip` external id
    Southbound,
}

/// A hosted zone member (VTEP table record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostedVtep {
    pub key: VtepKey,
    pub vtep: Vtep,
    pub kind: TunnelKind,
    pub origin: VtepOrigin,
}

/// A hardware VTEP device referenced by a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceVtep {
    pub node_id: String,
    pub ip: IpAddr,
}

/// An operator-declared transport zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportZone {
    pub name: String,
    #[serde(default)]
    pub tunnel_kind: TunnelKind,
    #[serde(default)]
    pub vteps: Vec<Vtep>,
    #[serde(default)]
    pub device_vteps: Vec<DeviceVtep>,
    /// Legacy IP-pool subnets; carried, not interpreted.
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub monitoring: Option<MonitoringConfig>,
}

impl TransportZone {
    pub fn new(name: impl Into<String>, tunnel_kind: TunnelKind) -> Self {
        Self {
            name: name.into(),
            tunnel_kind,
            vteps: Vec::new(),
            device_vteps: Vec::new(),
            subnets: Vec::new(),
            monitoring: None,
        }
    }

    pub fn with_vtep(mut self, vtep: Vtep) -> Self {
        self.vteps.push(vtep);
        self
    }

    pub fn with_device(mut self, device: DeviceVtep) -> Self {
        self.device_vteps.push(device);
        self
    }

    pub fn with_monitoring(mut self, monitoring: MonitoringConfig) -> Self {
        self.monitoring = Some(monitoring);
        self
    }

    /// Members keyed by identity, with set semantics.
    ///
    /// Duplicate identities collapse; a second member reusing an IP already
    /// claimed in this zone is dropped (first declaration wins).
    pub fn members(&self) -> BTreeMap<VtepKey, Vtep> {
        let mut members = BTreeMap::new();
        let mut ips = BTreeSet::new();
        for vtep in &self.vteps {
            let key = vtep.key(&self.name);
            if members.contains_key(&key) || !ips.insert(vtep.ip) {
                continue;
            }
            members.insert(key, vtep.clone());
        }
        members
    }

    /// Device VTEPs with set semantics.
    pub fn devices(&self) -> BTreeSet<DeviceVtep> {
        self.device_vteps.iter().cloned().collect()
    }
}

/// A DC gateway external endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DcGateway {
    pub ip: IpAddr,
    #[serde(default)]
    pub tunnel_kind: TunnelKind,
}

/// A southbound bridge as discovered on a switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub node_id: String,
    /// Datapath id, absent until the bridge reports it
    pub dpn_id: Option<DpnId>,
    pub bridge_name: String,
    pub connected: bool,
    #[serde(default)]
    pub external_ids: Attributes,
}

impl Node {
    pub fn new(node_id: impl Into<String>, dpn_id: DpnId, bridge_name: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            dpn_id: Some(dpn_id),
            bridge_name: bridge_name.into(),
            connected: true,
            external_ids: Attributes::new(),
        }
    }

    pub fn with_external_id(mut self, field: &str, value: impl Into<String>) -> Self {
        self.external_ids.set_field(field, value);
        self
    }

    /// The `tep-ip` external id, if present and well formed.
    pub fn tep_ip(&self) -> Option<IpAddr> {
        self.external_ids
            .get_field(external_ids::TEP_IP)
            .and_then(|ip| ip.parse().ok())
    }

    /// The `tzname` external id.
    pub fn tz_name(&self) -> Option<&str> {
        self.external_ids
            .get_field(external_ids::TZ_NAME)
            .filter(|name| !name.is_empty())
    }

    /// Returns false if `dpn-br-name` designates another bridge as the
    /// datapath bridge of this switch.
    pub fn is_dpn_bridge(&self) -> bool {
        self.external_ids
            .get_field(external_ids::DPN_BR_NAME)
            .map_or(true, |name| name.is_empty() || name == self.bridge_name)
    }
}

/// Dataplane port identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId {
    pub dpn: DpnId,
    pub port_no: u32,
}

impl PortId {
    pub fn new(dpn: DpnId, port_no: u32) -> Self {
        Self { dpn, port_no }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "openflow:{}:{}", self.dpn, self.port_no)
    }
}

impl FromStr for PortId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 3 || parts[0] != "openflow" {
            return Err(format!("Invalid port id: {}", s));
        }
        let dpn = parts[1].parse()?;
        let port_no = parts[2]
            .parse()
            .map_err(|_| format!("Invalid port number in: {}", s))?;
        Ok(Self::new(dpn, port_no))
    }
}

/// Operational reason code reported with a port notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortReason {
    Add,
    Delete,
    Update,
    #[default]
    Unspecified,
}

/// A dataplane port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: PortId,
    pub name: String,
    #[serde(default)]
    pub reason: PortReason,
    pub oper_up: bool,
}

impl Port {
    pub fn new(id: PortId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            reason: PortReason::Add,
            oper_up: true,
        }
    }

    pub fn with_oper_up(mut self, oper_up: bool) -> Self {
        self.oper_up = oper_up;
        self
    }
}

/// A dataplane interface bound to a port (INTERFACE_STATE record).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceBinding {
    pub name: String,
    pub port: PortId,
    pub oper_up: bool,
}

impl InterfaceBinding {
    pub fn dpn(&self) -> DpnId {
        self.port.dpn
    }
}

/// A liveness verdict reported by the monitoring collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub tunnel: TunnelName,
    pub alive: bool,
}

/// Operational status of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperStatus {
    Up,
    Down,
    #[default]
    Unknown,
}

impl OperStatus {
    pub fn from_up(up: bool) -> Self {
        if up {
            OperStatus::Up
        } else {
            OperStatus::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperStatus::Up => "up",
            OperStatus::Down => "down",
            OperStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The far end of an external tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalEndpoint {
    DcGateway { ip: IpAddr },
    DeviceVtep { node_id: String, ip: IpAddr },
}

impl ExternalEndpoint {
    fn identity(&self) -> String {
        match self {
            ExternalEndpoint::DcGateway { ip } => format!("gw:{}", ip),
            ExternalEndpoint::DeviceVtep { node_id, ip } => format!("hwvtep:{}:{}", node_id, ip),
        }
    }
}

/// The two ends of a tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelEndpoints {
    /// Full-mesh tunnel between two hosted VTEPs; `src` has the lower DPN id.
    Internal { src: VtepKey, dst: VtepKey },
    /// Tunnel from a DPN to an external endpoint.
    External {
        dpn: DpnId,
        src_ip: IpAddr,
        zone: Option<String>,
        remote: ExternalEndpoint,
    },
}

impl TunnelEndpoints {
    /// Builds an internal pair with the deterministic direction.
    pub fn internal(a: VtepKey, b: VtepKey) -> Self {
        if (a.dpn, &a.ip) <= (b.dpn, &b.ip) {
            TunnelEndpoints::Internal { src: a, dst: b }
        } else {
            TunnelEndpoints::Internal { src: b, dst: a }
        }
    }

    /// DPNs terminating this tunnel.
    pub fn dpns(&self) -> Vec<DpnId> {
        match self {
            TunnelEndpoints::Internal { src, dst } => vec![src.dpn, dst.dpn],
            TunnelEndpoints::External { dpn, .. } => vec![*dpn],
        }
    }

    /// Source DPN (the one that owns the tunnel port).
    pub fn src_dpn(&self) -> DpnId {
        match self {
            TunnelEndpoints::Internal { src, .. } => src.dpn,
            TunnelEndpoints::External { dpn, .. } => *dpn,
        }
    }

    fn identity(&self, kind: TunnelKind) -> String {
        match self {
            TunnelEndpoints::Internal { src, dst } => format!(
                "internal:{}:{}:{}:{}:{}:{}",
                src.zone, src.dpn, src.ip, dst.dpn, dst.ip, kind
            ),
            TunnelEndpoints::External {
                dpn,
                src_ip,
                zone,
                remote,
            } => format!(
                "external:{}:{}:{}:{}:{}",
                zone.as_deref().unwrap_or_default(),
                dpn,
                src_ip,
                remote.identity(),
                kind
            ),
        }
    }
}

/// Deterministic tunnel interface name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunnelName(String);

impl TunnelName {
    /// Derives the name from the tunnel identity.
    ///
    /// Both endpoints derive the same name because internal endpoints are
    /// normalised by [`TunnelEndpoints::internal`] first.
    pub fn derive(endpoints: &TunnelEndpoints, kind: TunnelKind) -> Self {
        let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, endpoints.identity(kind).as_bytes());
        let hex = id.simple().to_string();
        TunnelName(format!(
            "{}{}",
            TUNNEL_NAME_PREFIX,
            &hex[..TUNNEL_NAME_HASH_LEN]
        ))
    }

    /// Wraps an existing name (e.g. from a port notification).
    pub fn from_raw(name: impl Into<String>) -> Self {
        TunnelName(name.into())
    }

    /// Returns true if the interface name looks like a tunnel port.
    pub fn is_tunnel_name(name: &str) -> bool {
        name.len() == TUNNEL_NAME_PREFIX.len() + TUNNEL_NAME_HASH_LEN
            && name.starts_with(TUNNEL_NAME_PREFIX)
            && name[TUNNEL_NAME_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_hexdigit())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TunnelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tunnel record (TUNNEL table).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tunnel {
    pub name: TunnelName,
    pub endpoints: TunnelEndpoints,
    pub kind: TunnelKind,
    pub zone: Option<String>,
    /// Port name of the source VTEP
    pub parent_interface: String,
    pub state: TunnelState,
    pub oper_status: OperStatus,
    pub monitoring: MonitoringConfig,
    /// Last port state reported by the dataplane
    pub port_up: bool,
    /// Last liveness verdict, absent until monitoring reports one
    pub liveness: Option<bool>,
    /// Operational index assigned by the dataplane
    pub if_index: Option<u32>,
}

impl Tunnel {
    pub fn new(endpoints: TunnelEndpoints, kind: TunnelKind, monitoring: MonitoringConfig) -> Self {
        let name = TunnelName::derive(&endpoints, kind);
        let zone = match &endpoints {
            TunnelEndpoints::Internal { src, .. } => Some(src.zone.clone()),
            TunnelEndpoints::External { zone, .. } => zone.clone(),
        };
        Self {
            name,
            endpoints,
            kind,
            zone,
            parent_interface: String::new(),
            state: TunnelState::Provisioning,
            oper_status: OperStatus::Unknown,
            monitoring,
            port_up: false,
            liveness: None,
            if_index: None,
        }
    }

    pub fn with_parent_interface(mut self, parent: impl Into<String>) -> Self {
        self.parent_interface = parent.into();
        self
    }

    /// Effective status: port up, and alive when monitoring is enabled.
    pub fn evaluate(&self) -> OperStatus {
        let alive = !self.monitoring.enabled || self.liveness.unwrap_or(true);
        OperStatus::from_up(self.port_up && alive)
    }
}
