//! Route and peer data model.
//!
//! Plain value types shared by the kernel, the wire layer and the public
//! API: route descriptors, learned routes with node-path attributes, and
//! peer records with session timing fields.

use smallvec::SmallVec;
use std::fmt;

/// Application protocol spoken by a service.
///
/// The data-plane adapter uses this to choose between an HTTP connection
/// manager and a TCP passthrough listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    HttpGraphql,
    Tcp,
}

impl Protocol {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::HttpGraphql => "http:graphql",
            Self::Tcp => "tcp",
        }
    }

    /// Parse a protocol tag. Returns `None` for unknown tags.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(Self::Http),
            "http:graphql" => Some(Self::HttpGraphql),
            "tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered list of node names a route has traversed, origin first.
///
/// Used for loop detection and best-path selection. Paths are short in
/// practice (mesh diameters of a handful of hops), hence the inline
/// capacity.
pub type NodePath = SmallVec<[String; 4]>;

/// A route descriptor: the shape that travels on the wire and the shape
/// of a locally exposed service.
///
/// `envoy_port` is the local proxy port for routes this node terminates,
/// and the *remote* upstream port on routes learned from a peer. It is
/// stamped by the port allocator after planning; a route without a port is
/// not yet installable by the data plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub name: String,
    pub protocol: Protocol,
    pub endpoint: String,
    pub envoy_port: Option<u16>,
}

impl Route {
    pub fn new(name: impl Into<String>, protocol: Protocol, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            protocol,
            endpoint: endpoint.into(),
            envoy_port: None,
        }
    }

    /// Same route with a stamped proxy port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.envoy_port = Some(port);
        self
    }
}

/// A route learned from a peer.
///
/// Uniqueness key is `(route.name, peer_name)`: the same service learned
/// from two peers appears twice with different node-paths. `peer_name` is
/// the join key back to the peer record; no pointers are held across the
/// snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRoute {
    pub route: Route,
    pub peer_name: String,
    pub peer: PeerInfo,
    pub node_path: NodePath,
}

impl InternalRoute {
    /// Allocator key for the local egress listener of this route.
    #[must_use]
    pub fn egress_key(&self) -> String {
        egress_key(&self.route.name, &self.peer_name)
    }
}

/// Allocator key for the egress listener of `(route, source peer)`.
#[must_use]
pub fn egress_key(route_name: &str, peer_name: &str) -> String {
    format!("egress_{route_name}_via_{peer_name}")
}

/// Peer identity as presented on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub name: String,
    pub endpoint: String,
    pub domains: Vec<String>,
    /// Opaque capability token; transits the kernel unchanged.
    pub peer_token: Option<String>,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
            domains: Vec::new(),
            peer_token: None,
        }
    }

    #[must_use]
    pub fn with_domains(mut self, domains: Vec<String>) -> Self {
        self.domains = domains;
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.peer_token = Some(token.into());
        self
    }
}

/// Session state of a configured peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Configured but no session established yet
    Initializing,
    /// A session is established (inbound accepted or outbound reached)
    Connected,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Connected => "connected",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A configured peer plus its session bookkeeping.
///
/// Timing fields are milliseconds since the Unix epoch; `hold_time` is in
/// seconds. Silence past `hold_time` is treated as disconnection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub name: String,
    pub endpoint: String,
    pub domains: Vec<String>,
    pub peer_token: Option<String>,
    pub status: ConnectionStatus,
    pub last_connected: Option<u64>,
    pub last_received: Option<u64>,
    pub last_sent: Option<u64>,
    pub hold_time: Option<u64>,
}

impl PeerRecord {
    /// Fresh record for a newly configured peer.
    #[must_use]
    pub fn initializing(info: &PeerInfo, hold_time: Option<u64>) -> Self {
        Self {
            name: info.name.clone(),
            endpoint: info.endpoint.clone(),
            domains: info.domains.clone(),
            peer_token: info.peer_token.clone(),
            status: ConnectionStatus::Initializing,
            last_connected: None,
            last_received: None,
            last_sent: None,
            hold_time,
        }
    }

    /// Wire identity of this peer.
    #[must_use]
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            name: self.name.clone(),
            endpoint: self.endpoint.clone(),
            domains: self.domains.clone(),
            peer_token: self.peer_token.clone(),
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.status, ConnectionStatus::Connected)
    }

    /// True if the hold timer has expired at `now`.
    ///
    /// Requires an established session with both a hold time and a
    /// last-received stamp; otherwise there is nothing to expire.
    #[must_use]
    pub fn hold_expired(&self, now: u64) -> bool {
        match (self.is_connected(), self.hold_time, self.last_received) {
            (true, Some(hold), Some(received)) => now.saturating_sub(received) > hold * 1000,
            _ => false,
        }
    }

    /// True if a keepalive is due at `now`.
    ///
    /// Keepalives fire once a third of the hold time has passed since the
    /// last outbound message.
    #[must_use]
    pub fn keepalive_due(&self, now: u64) -> bool {
        match (self.is_connected(), self.hold_time, self.last_sent) {
            (true, Some(hold), Some(sent)) => now.saturating_sub(sent) > hold * 1000 / 3,
            _ => false,
        }
    }
}
