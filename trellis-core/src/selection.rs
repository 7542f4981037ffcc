//! Best-path selection (LocRIB).
//!
//! For each route name with at least one learned candidate, the LocRIB
//! holds the best path, the remaining alternatives, and why the best one
//! won. Consumers install `best` only; alternatives exist for
//! observability and future preference knobs.

use crate::route::InternalRoute;
use crate::table::RouteTable;
use hashbrown::HashMap;
use std::cmp::Ordering;
use std::fmt;

/// Why a candidate was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionReason {
    /// The only learned candidate for this name
    OnlyCandidate,
    /// Won on node-path length (ties broken lexicographically)
    ShortestNodePath,
}

impl SelectionReason {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OnlyCandidate => "only candidate",
            Self::ShortestNodePath => "shortest nodePath",
        }
    }
}

impl fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Selection result for one route name.
#[derive(Debug, Clone)]
pub struct LocRibEntry {
    pub best: InternalRoute,
    pub alternatives: Vec<InternalRoute>,
    pub reason: SelectionReason,
}

/// Per-name best paths, recomputed on every commit.
#[derive(Debug, Clone, Default)]
pub struct LocRib {
    entries: HashMap<String, LocRibEntry>,
}

/// Total order over candidates for one route name.
///
/// Shorter node-paths win; equal lengths compare lexicographically on the
/// path elements, then on the source peer name (two peers can advertise
/// identical paths).
#[must_use]
pub fn compare_candidates(a: &InternalRoute, b: &InternalRoute) -> Ordering {
    a.node_path
        .len()
        .cmp(&b.node_path.len())
        .then_with(|| a.node_path.as_slice().cmp(b.node_path.as_slice()))
        .then_with(|| a.peer_name.cmp(&b.peer_name))
}

impl LocRib {
    /// Build the LocRIB from a snapshot's learned routes.
    #[must_use]
    pub fn compute(table: &RouteTable) -> Self {
        let mut groups: HashMap<String, Vec<InternalRoute>> = HashMap::new();
        for route in table.internal.routes.iter() {
            groups
                .entry(route.route.name.clone())
                .or_default()
                .push(route.clone());
        }

        let mut entries = HashMap::with_capacity(groups.len());
        for (name, mut candidates) in groups {
            let entry = if candidates.len() == 1 {
                LocRibEntry {
                    best: candidates.remove(0),
                    alternatives: Vec::new(),
                    reason: SelectionReason::OnlyCandidate,
                }
            } else {
                candidates.sort_by(compare_candidates);
                let best = candidates.remove(0);
                LocRibEntry {
                    best,
                    alternatives: candidates,
                    reason: SelectionReason::ShortestNodePath,
                }
            };
            entries.insert(name, entry);
        }
        Self { entries }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&LocRibEntry> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &LocRibEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::{PeerInfo, Protocol, Route};

    fn learned(name: &str, peer: &str, path: &[&str]) -> InternalRoute {
        InternalRoute {
            route: Route::new(name, Protocol::Http, "http://up:1"),
            peer_name: peer.to_string(),
            peer: PeerInfo::new(peer, "http://p:4000"),
            node_path: path.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_only_candidate() {
        let table = RouteTable::new().with_internal_upserted(learned("svc", "b", &["a"]));
        let rib = LocRib::compute(&table);
        let entry = rib.get("svc").unwrap();
        assert_eq!(entry.reason, SelectionReason::OnlyCandidate);
        assert!(entry.alternatives.is_empty());
    }

    #[test]
    fn test_shortest_path_wins() {
        let table = RouteTable::new()
            .with_internal_upserted(learned("svc", "b", &["c", "d", "a"]))
            .with_internal_upserted(learned("svc", "e", &["a"]));
        let rib = LocRib::compute(&table);
        let entry = rib.get("svc").unwrap();
        assert_eq!(entry.best.peer_name, "e");
        assert_eq!(entry.reason, SelectionReason::ShortestNodePath);
        assert_eq!(entry.alternatives.len(), 1);
    }

    #[test]
    fn test_equal_length_tiebreak_is_lexicographic() {
        let table = RouteTable::new()
            .with_internal_upserted(learned("svc", "b", &["x", "a"]))
            .with_internal_upserted(learned("svc", "c", &["w", "a"]));
        let rib = LocRib::compute(&table);
        // ["w","a"] < ["x","a"]
        assert_eq!(rib.get("svc").unwrap().best.peer_name, "c");
    }

    #[test]
    fn test_identical_paths_tiebreak_on_peer_name() {
        let a = learned("svc", "b", &["a"]);
        let b = learned("svc", "c", &["a"]);
        assert_eq!(compare_candidates(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_deterministic_across_insert_order() {
        let routes = [
            learned("svc", "b", &["x", "a"]),
            learned("svc", "c", &["w", "a"]),
            learned("svc", "d", &["a"]),
        ];
        let forward = routes
            .iter()
            .fold(RouteTable::new(), |t, r| t.with_internal_upserted(r.clone()));
        let reverse = routes
            .iter()
            .rev()
            .fold(RouteTable::new(), |t, r| t.with_internal_upserted(r.clone()));
        let a = LocRib::compute(&forward);
        let b = LocRib::compute(&reverse);
        assert_eq!(a.get("svc").unwrap().best.peer_name, b.get("svc").unwrap().best.peer_name);
    }
}
