//! The action set.
//!
//! Every externally-originated stimulus — admin calls, inbound peer
//! messages, the periodic tick — is reified as one of these tagged
//! variants and fed through the queue, so the kernel sees a single
//! serialized stream of transitions.

use crate::route::{NodePath, PeerInfo, Route};

/// Direction of a single update entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Add,
    Remove,
}

/// One route announcement or withdrawal inside an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateEntry {
    pub action: UpdateAction,
    pub route: Route,
    /// Present on announcements; withdrawals carry none.
    pub node_path: Option<NodePath>,
}

impl UpdateEntry {
    #[must_use]
    pub fn add(route: Route, node_path: NodePath) -> Self {
        Self {
            action: UpdateAction::Add,
            route,
            node_path: Some(node_path),
        }
    }

    #[must_use]
    pub fn remove(route: Route) -> Self {
        Self {
            action: UpdateAction::Remove,
            route,
            node_path: None,
        }
    }

    #[must_use]
    pub const fn is_add(&self) -> bool {
        matches!(self.action, UpdateAction::Add)
    }
}

/// A batch of route changes announced by a peer (or to a peer).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteUpdate {
    pub updates: Vec<UpdateEntry>,
}

impl RouteUpdate {
    #[must_use]
    pub fn new(updates: Vec<UpdateEntry>) -> Self {
        Self { updates }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }
}

/// Everything the kernel can be asked to do.
#[derive(Debug, Clone)]
pub enum Action {
    /// Admin adds a peer. Requires a capability token.
    LocalPeerCreate(PeerInfo),
    /// Admin edits a peer; status resets to initializing.
    LocalPeerUpdate(PeerInfo),
    /// Admin removes a peer.
    LocalPeerDelete { name: String },
    /// Admin exposes a local service.
    LocalRouteCreate(Route),
    /// Admin withdraws a local service.
    LocalRouteDelete { name: String },
    /// Peer session accepted inbound.
    InternalProtocolOpen { peer: PeerInfo },
    /// Peer session established outbound.
    InternalProtocolConnected { peer: PeerInfo },
    /// Peer announced route changes.
    InternalProtocolUpdate { peer: PeerInfo, update: RouteUpdate },
    /// Peer session closed.
    InternalProtocolClose {
        peer: PeerInfo,
        code: u16,
        reason: Option<String>,
    },
    /// Periodic timekeeping; `now` is milliseconds since the epoch.
    Tick { now: u64 },
}

impl Action {
    /// Stable tag for logging and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::LocalPeerCreate(_) => "local_peer_create",
            Self::LocalPeerUpdate(_) => "local_peer_update",
            Self::LocalPeerDelete { .. } => "local_peer_delete",
            Self::LocalRouteCreate(_) => "local_route_create",
            Self::LocalRouteDelete { .. } => "local_route_delete",
            Self::InternalProtocolOpen { .. } => "internal_open",
            Self::InternalProtocolConnected { .. } => "internal_connected",
            Self::InternalProtocolUpdate { .. } => "internal_update",
            Self::InternalProtocolClose { .. } => "internal_close",
            Self::Tick { .. } => "tick",
        }
    }

    #[must_use]
    pub const fn is_tick(&self) -> bool {
        matches!(self, Self::Tick { .. })
    }
}
