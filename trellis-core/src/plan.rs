//! Pure state transition.
//!
//! `plan` maps `(action, current snapshot)` to a candidate next snapshot
//! plus the port operations and route metadata the commit will need. It
//! never mutates its inputs: validation failures return an error and the
//! caller's snapshot is untouched; protocol-level garbage (loops, unknown
//! peers on racy connects) is absorbed as a no-op transition.

use crate::action::{Action, RouteUpdate, UpdateAction};
use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::ports::{PortAllocator, PortOp};
use crate::route::{ConnectionStatus, InternalRoute, PeerInfo, PeerRecord};
use crate::selection::LocRib;
use crate::table::RouteTable;
use tracing::debug;

/// Output of a successful plan: the candidate snapshot, the port
/// operations to execute at commit, and the recomputed best-path
/// metadata.
#[derive(Debug, Clone)]
pub struct Plan {
    pub new_state: RouteTable,
    pub port_ops: Vec<PortOp>,
    pub metadata: LocRib,
}

/// Plan the transition for `action` against `state`.
///
/// Reads the allocator to derive port operations but performs none of
/// them. `now` is the commit timestamp in milliseconds; `Tick` carries
/// its own.
pub fn plan(
    action: &Action,
    state: &RouteTable,
    ports: &PortAllocator,
    config: &NodeConfig,
    now: u64,
) -> Result<Plan> {
    let new_state = transition(action, state, config, now)?;
    let port_ops = derive_port_ops(state, &new_state, ports);
    let metadata = LocRib::compute(&new_state);
    Ok(Plan {
        new_state,
        port_ops,
        metadata,
    })
}

fn transition(
    action: &Action,
    state: &RouteTable,
    config: &NodeConfig,
    now: u64,
) -> Result<RouteTable> {
    match action {
        Action::LocalPeerCreate(info) => {
            if info.peer_token.as_deref().map_or(true, str::is_empty) {
                return Err(Error::PeerTokenRequired);
            }
            if state.peer(&info.name).is_some() {
                return Err(Error::peer_exists(&info.name));
            }
            Ok(state.with_peer(PeerRecord::initializing(info, Some(config.hold_time))))
        }

        Action::LocalPeerUpdate(info) => {
            let existing = state
                .peer(&info.name)
                .ok_or_else(|| Error::peer_not_found(&info.name))?;
            let mut record = existing.clone();
            record.endpoint = info.endpoint.clone();
            record.domains = info.domains.clone();
            record.peer_token = info.peer_token.clone();
            record.status = ConnectionStatus::Initializing;
            record.last_connected = None;
            // Live sessions are not force-closed here; the next message in
            // either direction re-establishes connected status.
            Ok(state.with_peer_replaced(record))
        }

        Action::LocalPeerDelete { name } => {
            if state.peer(name).is_none() {
                return Err(Error::peer_not_found(name));
            }
            Ok(state.without_peers(&[name.as_str()]))
        }

        Action::LocalRouteCreate(route) => {
            if state.local_route(&route.name).is_some() {
                return Err(Error::route_exists(&route.name));
            }
            Ok(state.with_local_route(route.clone()))
        }

        Action::LocalRouteDelete { name } => {
            if state.local_route(name).is_none() {
                return Err(Error::route_not_found(name));
            }
            Ok(state.without_local_route(name))
        }

        Action::InternalProtocolOpen { peer } => {
            if state.peer(&peer.name).is_none() {
                return Err(Error::peer_not_found(&peer.name));
            }
            Ok(mark_connected(state, &peer.name, now))
        }

        Action::InternalProtocolConnected { peer } => {
            // The outbound open may race a concurrent peer removal; a
            // connect for a peer no longer configured is absorbed.
            if state.peer(&peer.name).is_none() {
                debug!(peer = %peer.name, "connected for unknown peer, ignoring");
                return Ok(state.clone());
            }
            Ok(mark_connected(state, &peer.name, now))
        }

        Action::InternalProtocolUpdate { peer, update } => {
            if state.peer(&peer.name).is_none() {
                debug!(peer = %peer.name, "update from unknown peer, ignoring");
                return Ok(state.clone());
            }
            let mut next = apply_update(state, peer, update, &config.name);
            next = next.with_peer_mutated(&peer.name, |p| p.last_received = Some(now));
            Ok(next)
        }

        Action::InternalProtocolClose { peer, code, .. } => {
            if state.peer(&peer.name).is_none() {
                debug!(peer = %peer.name, code, "close for unknown peer, ignoring");
                return Ok(state.clone());
            }
            Ok(state.without_peers(&[peer.name.as_str()]))
        }

        Action::Tick { now } => {
            let expired: Vec<&str> = state
                .internal
                .peers
                .iter()
                .filter(|p| p.hold_expired(*now))
                .map(|p| p.name.as_str())
                .collect();
            if !expired.is_empty() {
                debug!(peers = ?expired, "hold timer expired");
            }
            Ok(state.without_peers(&expired))
        }
    }
}

fn mark_connected(state: &RouteTable, name: &str, now: u64) -> RouteTable {
    state.with_peer_mutated(name, |p| {
        p.status = ConnectionStatus::Connected;
        p.last_connected = Some(now);
        p.last_received = Some(now);
    })
}

fn apply_update(
    state: &RouteTable,
    peer: &PeerInfo,
    update: &RouteUpdate,
    local_node: &str,
) -> RouteTable {
    let mut next = state.clone();
    for entry in &update.updates {
        match entry.action {
            UpdateAction::Add => {
                let Some(node_path) = entry.node_path.clone() else {
                    debug!(route = %entry.route.name, peer = %peer.name, "add without nodePath, dropping");
                    continue;
                };
                if node_path.iter().any(|n| n == local_node) {
                    debug!(route = %entry.route.name, peer = %peer.name, "nodePath loops through us, dropping");
                    continue;
                }
                next = next.with_internal_upserted(InternalRoute {
                    route: entry.route.clone(),
                    peer_name: peer.name.clone(),
                    peer: peer.clone(),
                    node_path,
                });
            }
            UpdateAction::Remove => {
                next = next.without_internal(&entry.route.name, &peer.name);
            }
        }
    }
    next
}

/// Derive the port operations that reconcile the allocator with the
/// candidate snapshot: allocate for routes that appeared without a port
/// entry, release for routes that disappeared.
fn derive_port_ops(prev: &RouteTable, next: &RouteTable, ports: &PortAllocator) -> Vec<PortOp> {
    let mut ops = Vec::new();

    for route in next.local.routes.iter() {
        if route.envoy_port.is_none() && ports.port_of(&route.name).is_none() {
            ops.push(PortOp::allocate(&route.name));
        }
    }
    for route in prev.local.routes.iter() {
        if next.local_route(&route.name).is_none() {
            ops.push(PortOp::release(&route.name));
        }
    }
    for route in next.internal.routes.iter() {
        let key = route.egress_key();
        if ports.port_of(&key).is_none() {
            ops.push(PortOp::Allocate { key });
        }
    }
    for route in prev.internal.routes.iter() {
        if next
            .internal_route(&route.route.name, &route.peer_name)
            .is_none()
        {
            ops.push(PortOp::Release {
                key: route.egress_key(),
            });
        }
    }
    ops
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{RouteUpdate, UpdateEntry};
    use crate::route::{Protocol, Route};
    use smallvec::smallvec;
    use std::sync::Arc;

    fn config() -> NodeConfig {
        NodeConfig::new("node-a", "http://a.internal:4000")
    }

    fn ports() -> PortAllocator {
        PortAllocator::single(20000, 20255)
    }

    fn peer_info(name: &str) -> PeerInfo {
        PeerInfo::new(name, format!("http://{name}.internal:4000")).with_token("tok")
    }

    fn connected_state(peer: &str) -> RouteTable {
        let state = RouteTable::new()
            .with_peer(PeerRecord::initializing(&peer_info(peer), Some(60)));
        state.with_peer_mutated(peer, |p| {
            p.status = ConnectionStatus::Connected;
            p.last_received = Some(0);
        })
    }

    #[test]
    fn test_duplicate_route_is_rejected_without_state_change() {
        let state = RouteTable::new().with_local_route(Route::new(
            "svc",
            Protocol::Http,
            "http://svc:8080",
        ));
        let action = Action::LocalRouteCreate(Route::new("svc", Protocol::Http, "http://x:1"));
        let err = plan(&action, &state, &ports(), &config(), 0).unwrap_err();
        assert_eq!(err.to_string(), "Route already exists");
        assert_eq!(state.local.routes.len(), 1);
    }

    #[test]
    fn test_peer_requires_token() {
        let info = PeerInfo::new("b", "http://b:4000");
        let err = plan(
            &Action::LocalPeerCreate(info),
            &RouteTable::new(),
            &ports(),
            &config(),
            0,
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "peerToken is required to create a peer");
    }

    #[test]
    fn test_connected_for_unknown_peer_is_a_noop() {
        let state = RouteTable::new();
        let out = plan(
            &Action::InternalProtocolConnected {
                peer: peer_info("ghost"),
            },
            &state,
            &ports(),
            &config(),
            7,
        )
        .unwrap();
        assert!(Arc::ptr_eq(
            &state.internal.peers,
            &out.new_state.internal.peers
        ));
        assert!(out.port_ops.is_empty());
    }

    #[test]
    fn test_open_for_unknown_peer_fails() {
        let err = plan(
            &Action::InternalProtocolOpen {
                peer: peer_info("ghost"),
            },
            &RouteTable::new(),
            &ports(),
            &config(),
            0,
        )
        .unwrap_err();
        assert_eq!(err, Error::PeerNotFound("ghost".into()));
    }

    #[test]
    fn test_open_marks_connected_and_stamps_received() {
        let state = RouteTable::new()
            .with_peer(PeerRecord::initializing(&peer_info("b"), Some(60)));
        let out = plan(
            &Action::InternalProtocolOpen {
                peer: peer_info("b"),
            },
            &state,
            &ports(),
            &config(),
            123,
        )
        .unwrap();
        let record = out.new_state.peer("b").unwrap();
        assert!(record.is_connected());
        assert_eq!(record.last_received, Some(123));
        assert_eq!(record.last_connected, Some(123));
    }

    #[test]
    fn test_update_add_with_loop_is_dropped() {
        let state = connected_state("b");
        let update = RouteUpdate::new(vec![UpdateEntry::add(
            Route::new("svc", Protocol::Http, "http://up:1"),
            smallvec!["c".to_string(), "node-a".to_string()],
        )]);
        let out = plan(
            &Action::InternalProtocolUpdate {
                peer: peer_info("b"),
                update,
            },
            &state,
            &ports(),
            &config(),
            50,
        )
        .unwrap();
        assert!(out.new_state.internal.routes.is_empty());
        // lastReceived still refreshed
        assert_eq!(out.new_state.peer("b").unwrap().last_received, Some(50));
    }

    #[test]
    fn test_update_upserts_on_name_and_peer() {
        let state = connected_state("b");
        let add = |port| {
            Action::InternalProtocolUpdate {
                peer: peer_info("b"),
                update: RouteUpdate::new(vec![UpdateEntry::add(
                    Route::new("svc", Protocol::Http, "http://up:1").with_port(port),
                    smallvec!["c".to_string()],
                )]),
            }
        };
        let first = plan(&add(5000), &state, &ports(), &config(), 1).unwrap();
        let second = plan(&add(5001), &first.new_state, &ports(), &config(), 2).unwrap();
        assert_eq!(second.new_state.internal.routes.len(), 1);
        assert_eq!(
            second.new_state.internal.routes[0].route.envoy_port,
            Some(5001)
        );
    }

    #[test]
    fn test_update_remove_deletes_matching_key() {
        let state = connected_state("b");
        let added = plan(
            &Action::InternalProtocolUpdate {
                peer: peer_info("b"),
                update: RouteUpdate::new(vec![UpdateEntry::add(
                    Route::new("svc", Protocol::Http, "http://up:1"),
                    smallvec!["c".to_string()],
                )]),
            },
            &state,
            &ports(),
            &config(),
            1,
        )
        .unwrap();
        let removed = plan(
            &Action::InternalProtocolUpdate {
                peer: peer_info("b"),
                update: RouteUpdate::new(vec![UpdateEntry::remove(Route::new(
                    "svc",
                    Protocol::Http,
                    "http://up:1",
                ))]),
            },
            &added.new_state,
            &ports(),
            &config(),
            2,
        )
        .unwrap();
        assert!(removed.new_state.internal.routes.is_empty());
    }

    #[test]
    fn test_tick_expires_silent_peers() {
        let state = connected_state("b").with_peer_mutated("b", |p| {
            p.last_received = Some(1000);
        });
        let out = plan(
            &Action::Tick { now: 62_000 },
            &state,
            &ports(),
            &config(),
            62_000,
        )
        .unwrap();
        assert!(out.new_state.peer("b").is_none());
    }

    #[test]
    fn test_tick_without_expiry_keeps_snapshot_identity() {
        let state = connected_state("b").with_peer_mutated("b", |p| {
            p.last_received = Some(1000);
        });
        let out = plan(
            &Action::Tick { now: 2_000 },
            &state,
            &ports(),
            &config(),
            2_000,
        )
        .unwrap();
        assert!(Arc::ptr_eq(
            &state.internal.routes,
            &out.new_state.internal.routes
        ));
        assert!(Arc::ptr_eq(&state.local.routes, &out.new_state.local.routes));
    }

    #[test]
    fn test_peer_delete_releases_egress_ports() {
        let state = connected_state("b");
        let added = plan(
            &Action::InternalProtocolUpdate {
                peer: peer_info("b"),
                update: RouteUpdate::new(vec![UpdateEntry::add(
                    Route::new("svc", Protocol::Http, "http://up:1"),
                    smallvec!["c".to_string()],
                )]),
            },
            &state,
            &ports(),
            &config(),
            1,
        )
        .unwrap();
        let mut allocator = ports();
        for op in &added.port_ops {
            if let PortOp::Allocate { key } = op {
                allocator.allocate(key).unwrap();
            }
        }
        let deleted = plan(
            &Action::LocalPeerDelete { name: "b".into() },
            &added.new_state,
            &allocator,
            &config(),
            2,
        )
        .unwrap();
        assert!(deleted
            .port_ops
            .contains(&PortOp::release("egress_svc_via_b")));
    }

    #[test]
    fn test_plan_is_deterministic() {
        let state = connected_state("b");
        let action = Action::LocalRouteCreate(Route::new("svc", Protocol::Http, "http://s:1"));
        let a = plan(&action, &state, &ports(), &config(), 9).unwrap();
        let b = plan(&action, &state, &ports(), &config(), 9).unwrap();
        assert_eq!(a.new_state.local.routes, b.new_state.local.routes);
        assert_eq!(a.port_ops, b.port_ops);
    }

    #[test]
    fn test_peer_update_resets_session_fields() {
        let state = connected_state("b").with_peer_mutated("b", |p| {
            p.last_connected = Some(10);
        });
        let out = plan(
            &Action::LocalPeerUpdate(
                PeerInfo::new("b", "http://b2.internal:4000").with_token("tok2"),
            ),
            &state,
            &ports(),
            &config(),
            20,
        )
        .unwrap();
        let record = out.new_state.peer("b").unwrap();
        assert_eq!(record.status, ConnectionStatus::Initializing);
        assert_eq!(record.endpoint, "http://b2.internal:4000");
        assert_eq!(record.peer_token.as_deref(), Some("tok2"));
        assert!(record.last_connected.is_none());
    }
}
