//! Table, key and field name constants for itmd

use std::fmt;

/// Logical tables of the transactional store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    /// Transport zones keyed by zone name
    Zone,
    /// Hosted zone members keyed by `zone|dpn|ip`
    Vtep,
    /// Parked (not-hosted) members keyed by zone name
    NotHosted,
    /// Tunnels keyed by tunnel name
    Tunnel,
    /// Reverse index keyed by `dpn|tunnel`
    DpnTunnel,
    /// DC gateways keyed by gateway IP
    Gateway,
    /// Dataplane interface bindings keyed by interface name
    InterfaceState,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Zone,
        Table::Vtep,
        Table::NotHosted,
        Table::Tunnel,
        Table::DpnTunnel,
        Table::Gateway,
        Table::InterfaceState,
    ];

    /// Returns the table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Zone => "TRANSPORT_ZONE",
            Table::Vtep => "VTEP",
            Table::NotHosted => "TZ_NOT_HOSTED",
            Table::Tunnel => "TUNNEL",
            Table::DpnTunnel => "DPN_TUNNEL",
            Table::Gateway => "DC_GATEWAY",
            Table::InterfaceState => "INTERFACE_STATE",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Separator between key components.
pub const KEY_SEPARATOR: char = '|';

/// Joins key components with [`KEY_SEPARATOR`].
pub fn join_key(parts: &[&str]) -> String {
    parts.join("|")
}

/// Prefix matching every key that starts with `part|`.
pub fn key_prefix(part: &str) -> String {
    format!("{}{}", part, KEY_SEPARATOR)
}

/// Southbound bridge external-id fields
pub mod external_ids {
    pub const TEP_IP: &str = "tep-ip";
    pub const TZ_NAME: &str = "tzname";
    pub const DPN_BR_NAME: &str = "dpn-br-name";
}

/// Dependency tables used for parked VTEPs
pub mod dependency {
    pub const DPN: &str = "dpn";
    pub const ZONE: &str = "zone";
}

/// Builds a coordinator job key `namespace:id`.
pub fn job_key(namespace: &str, id: impl fmt::Display) -> String {
    format!("{}:{}", namespace, id)
}

/// Job key namespaces
pub mod job_keys {
    pub const ZONE: &str = "zone";
    pub const DPN: &str = "dpn";
    pub const TUNNEL: &str = "tunnel";
    pub const GATEWAY: &str = "gateway";
    pub const INTERFACE: &str = "interface";
}
