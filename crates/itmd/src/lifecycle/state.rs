//! Tunnel lifecycle states and the transition function.
//!
//! ```text
//! Provisioning ──port with valid index──> Up <──────> Down
//!      │                                   │            │
//!      └──────────────── remove ───────────┴────────────┴──> Removed
//! ```
//!
//! Monitoring is an orthogonal flag on the tunnel: toggling it re-runs the
//! Up/Down evaluation and never re-provisions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::{MonitoringConfig, OperStatus, Port, Tunnel};

/// Lifecycle state of a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelState {
    /// Requested from the provisioner, dataplane port not seen yet.
    #[default]
    Provisioning,
    /// Dataplane port present and effective status up.
    Up,
    /// Dataplane port missing or down, or liveness lost.
    Down,
    /// Torn down. Terminal.
    Removed,
}

impl TunnelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "provisioning",
            Self::Up => "up",
            Self::Down => "down",
            Self::Removed => "removed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Removed)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs that drive the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// The tunnel's dataplane port was reported with its operational index.
    PortUp { if_index: u32, oper_up: bool },
    /// The tunnel's dataplane port was deleted.
    PortRemoved,
    /// Liveness verdict from the monitoring collaborator.
    Liveness { alive: bool },
    /// Operator changed the zone's monitoring parameters.
    Monitoring(MonitoringConfig),
    /// The mesh no longer wants this tunnel.
    Remove,
}

impl LifecycleEvent {
    /// The event a tunnel port notification stands for; `None` is a deleted
    /// port.
    pub fn from_port(port: Option<&Port>) -> Self {
        match port {
            Some(port) => LifecycleEvent::PortUp {
                if_index: port.id.port_no,
                oper_up: port.oper_up,
            },
            None => LifecycleEvent::PortRemoved,
        }
    }
}

/// Result of applying one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: TunnelState,
    pub to: TunnelState,
    /// Set when the operational status changed and must be propagated.
    pub oper_change: Option<OperStatus>,
    /// Set when any persisted field changed.
    pub dirty: bool,
}

impl Transition {
    pub fn state_changed(&self) -> bool {
        self.from != self.to
    }
}

/// Applies `event` to `tunnel` in place.
pub fn apply(tunnel: &mut Tunnel, event: LifecycleEvent) -> Transition {
    let before = tunnel.clone();
    let from = tunnel.state;

    if from.is_terminal() {
        return Transition {
            from,
            to: from,
            oper_change: None,
            dirty: false,
        };
    }

    match event {
        LifecycleEvent::PortUp { if_index, oper_up } => {
            // Index 0 is never a valid dataplane port.
            if if_index != 0 {
                tunnel.if_index = Some(if_index);
                tunnel.port_up = oper_up;
                if from == TunnelState::Provisioning {
                    tunnel.state = TunnelState::Down;
                }
            }
        }
        LifecycleEvent::PortRemoved => {
            tunnel.port_up = false;
            tunnel.if_index = None;
        }
        LifecycleEvent::Liveness { alive } => {
            tunnel.liveness = Some(alive);
        }
        LifecycleEvent::Monitoring(params) => {
            if !params.enabled {
                tunnel.liveness = None;
            }
            tunnel.monitoring = params;
        }
        LifecycleEvent::Remove => {
            tunnel.state = TunnelState::Removed;
        }
    }

    if matches!(tunnel.state, TunnelState::Up | TunnelState::Down) {
        let status = tunnel.evaluate();
        tunnel.state = match status {
            OperStatus::Up => TunnelState::Up,
            _ => TunnelState::Down,
        };
        tunnel.oper_status = status;
    }

    let oper_change = (tunnel.oper_status != before.oper_status
        && tunnel.state != TunnelState::Removed)
        .then_some(tunnel.oper_status);

    Transition {
        from,
        to: tunnel.state,
        oper_change,
        dirty: *tunnel != before,
    }
}
