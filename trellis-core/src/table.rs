//! Immutable route-table snapshot.
//!
//! The table is replaced, never mutated: every transition builds a fresh
//! snapshot that shares unchanged sequences with its predecessor via `Arc`.
//! Change detection is by sequence identity, so a transition that touches
//! nothing reports nothing changed, cheaply.
//!
//! Peers and learned routes live in separate indexed sequences joined by
//! `peer_name`; no snapshot holds pointers into itself.

use crate::ports::PortAllocator;
use crate::route::{InternalRoute, PeerRecord, Route};
use std::sync::Arc;

/// Locally terminated services, unique by name.
#[derive(Debug, Clone, Default)]
pub struct LocalRib {
    pub routes: Arc<Vec<Route>>,
}

/// Learned routes and configured peers.
///
/// Learned routes are unique by `(name, peer_name)`; peers are unique by
/// name.
#[derive(Debug, Clone, Default)]
pub struct InternalRib {
    pub routes: Arc<Vec<InternalRoute>>,
    pub peers: Arc<Vec<PeerRecord>>,
}

/// One immutable snapshot of the node's routing state.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    pub local: LocalRib,
    pub internal: InternalRib,
}

impl RouteTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ---- lookups ----

    #[must_use]
    pub fn local_route(&self, name: &str) -> Option<&Route> {
        self.local.routes.iter().find(|r| r.name == name)
    }

    #[must_use]
    pub fn peer(&self, name: &str) -> Option<&PeerRecord> {
        self.internal.peers.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn internal_route(&self, name: &str, peer_name: &str) -> Option<&InternalRoute> {
        self.internal
            .routes
            .iter()
            .find(|r| r.route.name == name && r.peer_name == peer_name)
    }

    /// Peers with an established session.
    pub fn connected_peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.internal.peers.iter().filter(|p| p.is_connected())
    }

    // ---- pure builders (return a new snapshot) ----

    /// Append a local route. The caller has validated uniqueness.
    #[must_use]
    pub fn with_local_route(&self, route: Route) -> Self {
        let mut routes = self.local.routes.as_ref().clone();
        routes.push(route);
        Self {
            local: LocalRib {
                routes: Arc::new(routes),
            },
            internal: self.internal.clone(),
        }
    }

    /// Remove a local route by name.
    #[must_use]
    pub fn without_local_route(&self, name: &str) -> Self {
        let routes: Vec<Route> = self
            .local
            .routes
            .iter()
            .filter(|r| r.name != name)
            .cloned()
            .collect();
        Self {
            local: LocalRib {
                routes: Arc::new(routes),
            },
            internal: self.internal.clone(),
        }
    }

    /// Append a peer record. The caller has validated uniqueness.
    #[must_use]
    pub fn with_peer(&self, record: PeerRecord) -> Self {
        let mut peers = self.internal.peers.as_ref().clone();
        peers.push(record);
        Self {
            local: self.local.clone(),
            internal: InternalRib {
                routes: self.internal.routes.clone(),
                peers: Arc::new(peers),
            },
        }
    }

    /// Replace the peer record with the same name.
    #[must_use]
    pub fn with_peer_replaced(&self, record: PeerRecord) -> Self {
        let peers: Vec<PeerRecord> = self
            .internal
            .peers
            .iter()
            .map(|p| {
                if p.name == record.name {
                    record.clone()
                } else {
                    p.clone()
                }
            })
            .collect();
        Self {
            local: self.local.clone(),
            internal: InternalRib {
                routes: self.internal.routes.clone(),
                peers: Arc::new(peers),
            },
        }
    }

    /// Apply `f` to the named peer record, if present.
    #[must_use]
    pub fn with_peer_mutated(&self, name: &str, f: impl FnOnce(&mut PeerRecord)) -> Self {
        let mut peers = self.internal.peers.as_ref().clone();
        if let Some(p) = peers.iter_mut().find(|p| p.name == name) {
            f(p);
        }
        Self {
            local: self.local.clone(),
            internal: InternalRib {
                routes: self.internal.routes.clone(),
                peers: Arc::new(peers),
            },
        }
    }

    /// Remove the named peers and every learned route sourced from them.
    ///
    /// Sequences that lose no element keep their snapshot identity, so
    /// change detection stays quiet for peers that were already gone.
    #[must_use]
    pub fn without_peers(&self, names: &[&str]) -> Self {
        let drops_peer = self
            .internal
            .peers
            .iter()
            .any(|p| names.contains(&p.name.as_str()));
        let drops_route = self
            .internal
            .routes
            .iter()
            .any(|r| names.contains(&r.peer_name.as_str()));
        if !drops_peer && !drops_route {
            return self.clone();
        }
        let peers = if drops_peer {
            Arc::new(
                self.internal
                    .peers
                    .iter()
                    .filter(|p| !names.contains(&p.name.as_str()))
                    .cloned()
                    .collect(),
            )
        } else {
            self.internal.peers.clone()
        };
        let routes = if drops_route {
            Arc::new(
                self.internal
                    .routes
                    .iter()
                    .filter(|r| !names.contains(&r.peer_name.as_str()))
                    .cloned()
                    .collect(),
            )
        } else {
            self.internal.routes.clone()
        };
        Self {
            local: self.local.clone(),
            internal: InternalRib { routes, peers },
        }
    }

    /// Insert or replace a learned route keyed on `(name, peer_name)`.
    #[must_use]
    pub fn with_internal_upserted(&self, route: InternalRoute) -> Self {
        let mut routes = self.internal.routes.as_ref().clone();
        match routes
            .iter_mut()
            .find(|r| r.route.name == route.route.name && r.peer_name == route.peer_name)
        {
            Some(existing) => *existing = route,
            None => routes.push(route),
        }
        Self {
            local: self.local.clone(),
            internal: InternalRib {
                routes: Arc::new(routes),
                peers: self.internal.peers.clone(),
            },
        }
    }

    /// Remove the learned route keyed on `(name, peer_name)`.
    ///
    /// A withdrawal for a route that was never stored keeps the snapshot
    /// identity.
    #[must_use]
    pub fn without_internal(&self, name: &str, peer_name: &str) -> Self {
        if self.internal_route(name, peer_name).is_none() {
            return self.clone();
        }
        let routes: Vec<InternalRoute> = self
            .internal
            .routes
            .iter()
            .filter(|r| !(r.route.name == name && r.peer_name == peer_name))
            .cloned()
            .collect();
        Self {
            local: self.local.clone(),
            internal: InternalRib {
                routes: Arc::new(routes),
                peers: self.internal.peers.clone(),
            },
        }
    }

    /// Stamp `last_sent = now` on the named peers.
    #[must_use]
    pub fn with_last_sent(&self, names: &[&str], now: u64) -> Self {
        if names.is_empty() {
            return self.clone();
        }
        let mut peers = self.internal.peers.as_ref().clone();
        for p in peers.iter_mut() {
            if names.contains(&p.name.as_str()) {
                p.last_sent = Some(now);
            }
        }
        Self {
            local: self.local.clone(),
            internal: InternalRib {
                routes: self.internal.routes.clone(),
                peers: Arc::new(peers),
            },
        }
    }

    /// Stamp allocator ports onto routes that lack one.
    ///
    /// Local routes take the port under their name; learned routes take
    /// the port under their egress key. A route that already carries a
    /// port keeps it — on learned routes that is the *remote* upstream
    /// port and must be preserved. Sequences with nothing to stamp keep
    /// their snapshot identity.
    #[must_use]
    pub fn with_ports_stamped(&self, ports: &PortAllocator) -> Self {
        let stamp_local = self
            .local
            .routes
            .iter()
            .any(|r| r.envoy_port.is_none() && ports.port_of(&r.name).is_some());
        let stamp_internal = self
            .internal
            .routes
            .iter()
            .any(|r| r.route.envoy_port.is_none() && ports.port_of(&r.egress_key()).is_some());
        if !stamp_local && !stamp_internal {
            return self.clone();
        }

        let local = if stamp_local {
            let mut routes = self.local.routes.as_ref().clone();
            for r in routes.iter_mut() {
                if r.envoy_port.is_none() {
                    r.envoy_port = ports.port_of(&r.name);
                }
            }
            LocalRib {
                routes: Arc::new(routes),
            }
        } else {
            self.local.clone()
        };

        let routes = if stamp_internal {
            let mut routes = self.internal.routes.as_ref().clone();
            for r in routes.iter_mut() {
                if r.route.envoy_port.is_none() {
                    r.route.envoy_port = ports.port_of(&r.egress_key());
                }
            }
            Arc::new(routes)
        } else {
            self.internal.routes.clone()
        };

        Self {
            local,
            internal: InternalRib {
                routes,
                peers: self.internal.peers.clone(),
            },
        }
    }

    // ---- change detection ----

    /// True iff the local or learned route sequences are different
    /// snapshots. Peer-only transitions (timing stamps, status flips) do
    /// not count as route changes.
    #[must_use]
    pub fn routes_changed(prev: &Self, next: &Self) -> bool {
        !Arc::ptr_eq(&prev.local.routes, &next.local.routes)
            || !Arc::ptr_eq(&prev.internal.routes, &next.internal.routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{PeerInfo, Protocol};

    fn table_with_route() -> RouteTable {
        RouteTable::new().with_local_route(Route::new(
            "svc",
            Protocol::Http,
            "http://svc.internal:8080",
        ))
    }

    #[test]
    fn test_identity_change_detection() {
        let a = table_with_route();
        let b = a.clone();
        assert!(!RouteTable::routes_changed(&a, &b));

        let c = a.with_local_route(Route::new("svc2", Protocol::Tcp, "tcp://db:5432"));
        assert!(RouteTable::routes_changed(&a, &c));
    }

    #[test]
    fn test_peer_only_transition_is_not_a_route_change() {
        let a = table_with_route().with_peer(PeerRecord::initializing(
            &PeerInfo::new("b", "http://b:4000").with_token("t"),
            Some(60),
        ));
        let b = a.with_last_sent(&["b"], 42);
        assert!(!RouteTable::routes_changed(&a, &b));
        assert_eq!(b.peer("b").unwrap().last_sent, Some(42));
    }

    #[test]
    fn test_upsert_replaces_by_key() {
        let info = PeerInfo::new("b", "http://b:4000");
        let mk = |port| InternalRoute {
            route: Route::new("svc", Protocol::Http, "http://a:1").with_port(port),
            peer_name: "b".into(),
            peer: info.clone(),
            node_path: smallvec::smallvec!["a".to_string()],
        };
        let t = RouteTable::new()
            .with_internal_upserted(mk(5000))
            .with_internal_upserted(mk(5001));
        assert_eq!(t.internal.routes.len(), 1);
        assert_eq!(t.internal.routes[0].route.envoy_port, Some(5001));
    }

    #[test]
    fn test_without_peers_strips_routes() {
        let info = PeerInfo::new("b", "http://b:4000");
        let t = RouteTable::new()
            .with_peer(PeerRecord::initializing(&info, None))
            .with_internal_upserted(InternalRoute {
                route: Route::new("svc", Protocol::Http, "http://a:1"),
                peer_name: "b".into(),
                peer: info,
                node_path: smallvec::smallvec!["a".to_string()],
            });
        let stripped = t.without_peers(&["b"]);
        assert!(stripped.peer("b").is_none());
        assert!(stripped.internal.routes.is_empty());
    }

    #[test]
    fn test_snapshot_isolation() {
        let a = table_with_route();
        let b = a.with_local_route(Route::new("svc2", Protocol::Tcp, "tcp://db:5432"));
        // the original snapshot is untouched by building a successor
        assert_eq!(a.local.routes.len(), 1);
        assert_eq!(b.local.routes.len(), 2);
    }
}
