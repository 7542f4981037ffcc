//! Propagation computer.
//!
//! Pure derivation of the outbound messages a committed transition
//! produces: session opens, route updates (announcements, withdrawals,
//! full syncs), keepalives and closes. All filtering lives here —
//! split-horizon, loop avoidance, egress-port rewriting — so the
//! transport sink only ever sees messages that are safe to deliver.
//!
//! Runs inside commit, after port operations have executed, so the
//! allocator it reads already holds the egress ports it rewrites to.

use crate::action::{Action, RouteUpdate, UpdateAction, UpdateEntry};
use crate::config::NodeConfig;
use crate::ports::PortAllocator;
use crate::route::{egress_key, InternalRoute, NodePath, PeerRecord, Route};
use crate::table::RouteTable;
use smallvec::smallvec;
use tracing::trace;

/// Close code used when the admin removes a peer.
pub const CLOSE_NORMAL: u16 = 1000;

/// An outbound message to one peer, produced by a commit.
#[derive(Debug, Clone)]
pub enum Propagation {
    /// Initiate an outbound session
    Open { peer: PeerRecord },
    /// Announce or withdraw routes
    Update { peer: PeerRecord, update: RouteUpdate },
    /// Liveness probe
    Keepalive { peer: PeerRecord },
    /// Terminate the session
    Close {
        peer: PeerRecord,
        code: u16,
        reason: String,
    },
}

impl Propagation {
    #[must_use]
    pub fn peer(&self) -> &PeerRecord {
        match self {
            Self::Open { peer }
            | Self::Update { peer, .. }
            | Self::Keepalive { peer }
            | Self::Close { peer, .. } => peer,
        }
    }

    /// Stable tag for logging and metrics.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Update { .. } => "update",
            Self::Keepalive { .. } => "keepalive",
            Self::Close { .. } => "close",
        }
    }

    /// True for the kinds that stamp `last_sent` on the target peer.
    #[must_use]
    pub const fn stamps_last_sent(&self) -> bool {
        matches!(self, Self::Update { .. } | Self::Keepalive { .. })
    }
}

/// Compute the propagations for a committed transition.
pub fn compute(
    action: &Action,
    prev: &RouteTable,
    next: &RouteTable,
    ports: &PortAllocator,
    config: &NodeConfig,
) -> Vec<Propagation> {
    match action {
        Action::LocalPeerCreate(info) => next
            .peer(&info.name)
            .map(|record| Propagation::Open {
                peer: record.clone(),
            })
            .into_iter()
            .collect(),

        Action::InternalProtocolOpen { peer } | Action::InternalProtocolConnected { peer } => {
            full_sync(next, &peer.name, ports, config)
        }

        Action::LocalPeerDelete { name } => {
            let mut out = Vec::new();
            if let Some(record) = prev.peer(name) {
                out.push(Propagation::Close {
                    peer: record.clone(),
                    code: CLOSE_NORMAL,
                    reason: "Peer removed".to_string(),
                });
            }
            out.extend(withdrawals_for_sources(prev, next, &[name.as_str()]));
            out
        }

        Action::LocalRouteCreate(route) => {
            // The committed copy carries the stamped port; advertise that.
            let Some(committed) = next.local_route(&route.name) else {
                return Vec::new();
            };
            let entry = UpdateEntry::add(committed.clone(), smallvec![config.name.clone()]);
            next.connected_peers()
                .map(|peer| Propagation::Update {
                    peer: peer.clone(),
                    update: RouteUpdate::new(vec![entry.clone()]),
                })
                .collect()
        }

        Action::LocalRouteDelete { name } => {
            let Some(removed) = prev.local_route(name) else {
                return Vec::new();
            };
            let entry = UpdateEntry::remove(removed.clone());
            next.connected_peers()
                .map(|peer| Propagation::Update {
                    peer: peer.clone(),
                    update: RouteUpdate::new(vec![entry.clone()]),
                })
                .collect()
        }

        Action::InternalProtocolUpdate { peer, update } => {
            relay_update(next, &peer.name, update, ports, config)
        }

        Action::InternalProtocolClose { peer, .. } => {
            if prev.peer(&peer.name).is_none() {
                return Vec::new();
            }
            withdrawals_for_sources(prev, next, &[peer.name.as_str()])
        }

        Action::Tick { now } => {
            let expired: Vec<&str> = prev
                .internal
                .peers
                .iter()
                .filter(|p| next.peer(&p.name).is_none())
                .map(|p| p.name.as_str())
                .collect();
            let mut out = withdrawals_for_sources(prev, next, &expired);
            for peer in next.connected_peers() {
                if peer.keepalive_due(*now) {
                    out.push(Propagation::Keepalive { peer: peer.clone() });
                }
            }
            out
        }

        Action::LocalPeerUpdate(_) => Vec::new(),
    }
}

/// Full-sync payload for a freshly opened session: every local route plus
/// every learned route the target may legitimately hear about.
fn full_sync(
    next: &RouteTable,
    target_name: &str,
    ports: &PortAllocator,
    config: &NodeConfig,
) -> Vec<Propagation> {
    let Some(target) = next.peer(target_name) else {
        return Vec::new();
    };
    if target.peer_token.is_none() {
        trace!(peer = %target_name, "no peerToken on record, skipping full sync");
        return Vec::new();
    }

    let mut entries = Vec::new();
    for route in next.local.routes.iter() {
        entries.push(UpdateEntry::add(route.clone(), smallvec![config.name.clone()]));
    }
    for learned in next.internal.routes.iter() {
        if let Some(entry) = relay_entry(learned, target_name, ports, config) {
            entries.push(entry);
        }
    }

    vec![Propagation::Update {
        peer: target.clone(),
        update: RouteUpdate::new(entries),
    }]
}

/// Re-advertise a learned route toward `target`, or None when
/// split-horizon or loop avoidance filters it.
fn relay_entry(
    learned: &InternalRoute,
    target_name: &str,
    ports: &PortAllocator,
    config: &NodeConfig,
) -> Option<UpdateEntry> {
    relay_add(
        &learned.route,
        &learned.node_path,
        &learned.peer_name,
        target_name,
        ports,
        config,
    )
}

/// Filter and rewrite a single announcement for onward propagation:
/// drop paths that already contain us or the target, rewrite the port to
/// our egress listener, and prepend ourselves to the path.
fn relay_add(
    route: &Route,
    node_path: &NodePath,
    source_peer: &str,
    target_name: &str,
    ports: &PortAllocator,
    config: &NodeConfig,
) -> Option<UpdateEntry> {
    if node_path
        .iter()
        .any(|n| n == &config.name || n == target_name)
    {
        return None;
    }
    let mut rewritten = route.clone();
    if let Some(port) = ports.port_of(&egress_key(&route.name, source_peer)) {
        rewritten.envoy_port = Some(port);
    }
    let mut path: NodePath = smallvec![config.name.clone()];
    path.extend(node_path.iter().cloned());
    Some(UpdateEntry::add(rewritten, path))
}

/// Forward a peer's update to every other connected peer, filtered and
/// rewritten per target.
fn relay_update(
    next: &RouteTable,
    source_peer: &str,
    update: &RouteUpdate,
    ports: &PortAllocator,
    config: &NodeConfig,
) -> Vec<Propagation> {
    let mut out = Vec::new();
    for target in next.connected_peers() {
        if target.name == source_peer {
            continue;
        }
        let mut entries = Vec::new();
        for entry in &update.updates {
            match entry.action {
                UpdateAction::Remove => entries.push(entry.clone()),
                UpdateAction::Add => {
                    let Some(path) = entry.node_path.as_ref() else {
                        continue;
                    };
                    if let Some(relayed) = relay_add(
                        &entry.route,
                        path,
                        source_peer,
                        &target.name,
                        ports,
                        config,
                    ) {
                        entries.push(relayed);
                    }
                }
            }
        }
        if !entries.is_empty() {
            out.push(Propagation::Update {
                peer: target.clone(),
                update: RouteUpdate::new(entries),
            });
        }
    }
    out
}

/// Withdraw every route sourced from `sources` toward the peers that
/// remain connected. The departed peers themselves get nothing.
fn withdrawals_for_sources(
    prev: &RouteTable,
    next: &RouteTable,
    sources: &[&str],
) -> Vec<Propagation> {
    if sources.is_empty() {
        return Vec::new();
    }
    let withdrawn: Vec<UpdateEntry> = prev
        .internal
        .routes
        .iter()
        .filter(|r| sources.contains(&r.peer_name.as_str()))
        .map(|r| UpdateEntry::remove(r.route.clone()))
        .collect();
    if withdrawn.is_empty() {
        return Vec::new();
    }
    next.connected_peers()
        .map(|peer| Propagation::Update {
            peer: peer.clone(),
            update: RouteUpdate::new(withdrawn.clone()),
        })
        .collect()
}
