//! Node configuration.
//!
//! This module provides the configuration record the kernel and the
//! peering layer consume: node identity, the egress port pool, hold and
//! tick timing, and transport limits.

use crate::ports::PortRange;
use crate::route::PeerInfo;
use std::time::Duration;

/// Default hold time in seconds.
///
/// A peer that stays silent longer than this is treated as disconnected;
/// keepalives go out after a third of it.
pub const DEFAULT_HOLD_TIME_SECS: u64 = 60;

/// Default tick cadence for the action queue's timekeeping.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default per-call deadline for peer RPCs.
pub const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(5);

/// Default egress port pool.
///
/// 256 ports is comfortable for the scale this node targets (hundreds of
/// routes, tens of peers).
pub const DEFAULT_PORT_RANGE: PortRange = PortRange::new(20000, 20255);

/// Default cap on concurrent in-flight RPCs per peer.
pub const DEFAULT_PEER_INFLIGHT: usize = 4;

/// Node configuration.
///
/// # Examples
///
/// ```
/// use trellis_core::config::NodeConfig;
/// use trellis_core::ports::PortRange;
///
/// let config = NodeConfig::new("node-a", "http://a.internal:4000")
///     .with_domains(vec!["a.internal".into()])
///     .with_port_range(PortRange::new(21000, 21255))
///     .with_hold_time(90);
/// ```
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's name; appears first in node-paths it originates.
    pub name: String,

    /// Endpoint other nodes dial to reach this node's peering listener.
    pub endpoint: String,

    /// Domains this node serves; advertised in its peer identity.
    pub domains: Vec<String>,

    /// Port pool for data-plane egress listeners.
    pub port_ranges: Vec<PortRange>,

    /// Hold time stamped onto newly configured peers, in seconds.
    pub hold_time: u64,

    /// Cadence of the queue's periodic tick.
    pub tick_interval: Duration,

    /// Per-call deadline on peer RPCs; exceeding it settles as rejected.
    pub rpc_deadline: Duration,

    /// Cap on concurrent in-flight RPCs per peer.
    pub peer_inflight: usize,

    /// Fallback capability token used when a peer record carries none.
    pub node_token: Option<String>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            domains: Vec::new(),
            port_ranges: vec![DEFAULT_PORT_RANGE],
            hold_time: DEFAULT_HOLD_TIME_SECS,
            tick_interval: DEFAULT_TICK_INTERVAL,
            rpc_deadline: DEFAULT_RPC_DEADLINE,
            peer_inflight: DEFAULT_PEER_INFLIGHT,
            node_token: None,
        }
    }

    #[must_use]
    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    #[must_use]
    pub fn with_port_range(mut self, range: PortRange) -> Self {
        self.port_ranges = vec![range];
        self
    }

    #[must_use]
    pub fn with_port_ranges(mut self, ranges: Vec<PortRange>) -> Self {
        self.port_ranges = ranges;
        self
    }

    #[must_use]
    pub const fn with_hold_time(mut self, secs: u64) -> Self {
        self.hold_time = secs;
        self
    }

    #[must_use]
    pub const fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_rpc_deadline(mut self, deadline: Duration) -> Self {
        self.rpc_deadline = deadline;
        self
    }

    #[must_use]
    pub const fn with_peer_inflight(mut self, n: usize) -> Self {
        self.peer_inflight = n;
        self
    }

    #[must_use]
    pub fn with_node_token(mut self, token: impl Into<String>) -> Self {
        self.node_token = Some(token.into());
        self
    }

    /// This node's identity as presented to peers.
    ///
    /// The capability token is not part of the advertised identity; it is
    /// attached per-call by the transport sink.
    #[must_use]
    pub fn local_info(&self) -> PeerInfo {
        PeerInfo {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            domains: self.domains.clone(),
            peer_token: None,
        }
    }
}
