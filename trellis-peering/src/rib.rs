//! RIB engine: plan + commit.
//!
//! Owns the current snapshot, the port allocator and the published
//! best-path metadata. `apply` is the single write path: it plans the
//! transition, executes the derived port operations, stamps ports,
//! computes propagations, stamps `last_sent` on the recipients, and
//! publishes the new state. Everything here runs on the queue task;
//! readers elsewhere go through the shared [`StateHandle`].

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, warn};
use trellis_core::action::Action;
use trellis_core::config::NodeConfig;
use trellis_core::error::Result;
use trellis_core::plan::plan;
use trellis_core::ports::{PortAllocator, PortOp};
use trellis_core::propagate::{compute, Propagation};
use trellis_core::selection::LocRib;
use trellis_core::table::RouteTable;

/// Result of one committed action.
#[derive(Debug)]
pub struct CommitOutcome {
    pub action: Action,
    pub prev: RouteTable,
    pub next: RouteTable,
    pub propagations: Vec<Propagation>,
    pub port_ops: Vec<PortOp>,
    /// True iff the local or learned route sequences were replaced.
    pub routes_changed: bool,
    /// Published state revision after this commit.
    pub revision: u64,
}

struct Shared {
    table: RouteTable,
    metadata: LocRib,
    revision: u64,
}

/// Cloneable read handle onto the published state.
///
/// Readers take a snapshot reference without locking against the queue:
/// the table inside is immutable, and the lock is held only for the
/// pointer swap.
#[derive(Clone)]
pub struct StateHandle {
    inner: Arc<RwLock<Shared>>,
}

impl StateHandle {
    fn new(table: RouteTable, metadata: LocRib) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Shared {
                table,
                metadata,
                revision: 0,
            })),
        }
    }

    /// Current published snapshot.
    #[must_use]
    pub fn table(&self) -> RouteTable {
        self.inner.read().table.clone()
    }

    /// Current published best-path metadata.
    #[must_use]
    pub fn metadata(&self) -> LocRib {
        self.inner.read().metadata.clone()
    }

    /// Monotonic revision counter, bumped on every commit.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.inner.read().revision
    }

    fn publish(&self, table: RouteTable, metadata: LocRib) -> u64 {
        let mut shared = self.inner.write();
        shared.table = table;
        shared.metadata = metadata;
        shared.revision += 1;
        shared.revision
    }
}

/// The Routing Information Base and its commit machinery.
pub struct Rib {
    config: NodeConfig,
    ports: PortAllocator,
    state: RouteTable,
    handle: StateHandle,
}

impl Rib {
    #[must_use]
    pub fn new(config: NodeConfig) -> Self {
        Self::with_initial_state(config, RouteTable::new())
    }

    /// Restore from a checkpointed snapshot.
    ///
    /// Local routes that carry a stamped port get that port re-reserved
    /// so restarts keep their assignments. Egress ports for learned
    /// routes are not recorded in the snapshot; they are re-derived on
    /// the first transition that touches them.
    #[must_use]
    pub fn with_initial_state(config: NodeConfig, state: RouteTable) -> Self {
        let mut ports = PortAllocator::new(config.port_ranges.clone());
        for route in state.local.routes.iter() {
            if let Some(port) = route.envoy_port {
                if let Err(error) = ports.reserve(&route.name, port) {
                    warn!(route = %route.name, port, %error, "could not re-reserve checkpointed port");
                }
            }
        }
        let metadata = LocRib::compute(&state);
        let handle = StateHandle::new(state.clone(), metadata);
        Self {
            config,
            ports,
            state,
            handle,
        }
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Current committed snapshot (queue-task view).
    #[must_use]
    pub fn state(&self) -> &RouteTable {
        &self.state
    }

    #[must_use]
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Shared read handle for code outside the queue task.
    #[must_use]
    pub fn handle(&self) -> StateHandle {
        self.handle.clone()
    }

    /// Plan and commit one action.
    ///
    /// Plan rejections leave every piece of state untouched. Port
    /// allocation failures during commit are logged and leave the
    /// affected route unstamped; they never fail the action.
    pub fn apply(&mut self, action: Action, now: u64) -> Result<CommitOutcome> {
        // a tick carries its own timestamp; stamping uses the same one
        let now = match &action {
            Action::Tick { now } => *now,
            _ => now,
        };
        let planned = plan(&action, &self.state, &self.ports, &self.config, now)?;

        for op in &planned.port_ops {
            match op {
                PortOp::Allocate { key } => {
                    if let Err(error) = self.ports.allocate(key) {
                        warn!(key = %key, %error, "port allocation failed; route stays unstamped");
                    }
                }
                PortOp::Release { key } => self.ports.release(key),
            }
        }

        let stamped = planned.new_state.with_ports_stamped(&self.ports);
        let propagations = compute(&action, &self.state, &stamped, &self.ports, &self.config);

        let recipients: Vec<&str> = propagations
            .iter()
            .filter(|p| p.stamps_last_sent())
            .map(|p| p.peer().name.as_str())
            .collect();
        let next = stamped.with_last_sent(&recipients, now);

        let metadata = LocRib::compute(&next);
        let routes_changed = RouteTable::routes_changed(&self.state, &next);
        let prev = std::mem::replace(&mut self.state, next.clone());
        let revision = self.handle.publish(next.clone(), metadata);

        debug!(
            action = action.kind(),
            routes_changed,
            propagations = propagations.len(),
            revision,
            "committed"
        );

        Ok(CommitOutcome {
            action,
            prev,
            next,
            propagations,
            port_ops: planned.port_ops,
            routes_changed,
            revision,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_core::ports::PortRange;
    use trellis_core::route::{PeerInfo, Protocol, Route};

    fn rib() -> Rib {
        Rib::new(NodeConfig::new("node-a", "http://a.internal:4000"))
    }

    #[test]
    fn test_commit_stamps_local_port() {
        let mut rib = rib();
        let outcome = rib
            .apply(
                Action::LocalRouteCreate(Route::new("svc", Protocol::Http, "http://s:8080")),
                10,
            )
            .unwrap();
        let committed = outcome.next.local_route("svc").unwrap();
        assert_eq!(committed.envoy_port, Some(20000));
        assert!(outcome.routes_changed);
        assert_eq!(outcome.revision, 1);
    }

    #[test]
    fn test_plan_rejection_leaves_state_untouched() {
        let mut rib = rib();
        rib.apply(
            Action::LocalRouteCreate(Route::new("svc", Protocol::Http, "http://s:8080")),
            10,
        )
        .unwrap();
        let before = rib.handle().revision();
        let err = rib
            .apply(
                Action::LocalRouteCreate(Route::new("svc", Protocol::Http, "http://s:8080")),
                11,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "Route already exists");
        assert_eq!(rib.handle().revision(), before);
        assert_eq!(rib.state().local.routes.len(), 1);
    }

    #[test]
    fn test_allocation_failure_is_nonfatal() {
        let config = NodeConfig::new("node-a", "http://a:4000")
            .with_port_range(PortRange::new(20000, 20000));
        let mut rib = Rib::new(config);
        rib.apply(
            Action::LocalRouteCreate(Route::new("one", Protocol::Http, "http://s:1")),
            1,
        )
        .unwrap();
        // pool exhausted: the second route commits but stays unstamped
        let outcome = rib
            .apply(
                Action::LocalRouteCreate(Route::new("two", Protocol::Http, "http://s:2")),
                2,
            )
            .unwrap();
        assert_eq!(outcome.next.local_route("two").unwrap().envoy_port, None);
        assert!(outcome.routes_changed);
    }

    #[test]
    fn test_last_sent_stamped_on_update_recipients() {
        let mut rib = rib();
        let info = PeerInfo::new("node-b", "http://b:4000").with_token("tok");
        rib.apply(Action::LocalPeerCreate(info.clone()), 1).unwrap();
        rib.apply(Action::InternalProtocolOpen { peer: info }, 2)
            .unwrap();
        // open's full sync is an update, so last_sent is stamped at 2
        assert_eq!(rib.state().peer("node-b").unwrap().last_sent, Some(2));

        let outcome = rib
            .apply(
                Action::LocalRouteCreate(Route::new("svc", Protocol::Http, "http://s:1")),
                30,
            )
            .unwrap();
        assert_eq!(outcome.next.peer("node-b").unwrap().last_sent, Some(30));
    }

    #[test]
    fn test_open_propagation_not_stamped_as_sent() {
        let mut rib = rib();
        let info = PeerInfo::new("node-b", "http://b:4000").with_token("tok");
        let outcome = rib.apply(Action::LocalPeerCreate(info), 5).unwrap();
        assert_eq!(outcome.propagations.len(), 1);
        assert_eq!(outcome.propagations[0].kind(), "open");
        assert_eq!(outcome.next.peer("node-b").unwrap().last_sent, None);
    }

    #[test]
    fn test_checkpoint_restore_reserves_ports() {
        let mut rib = rib();
        rib.apply(
            Action::LocalRouteCreate(Route::new("svc", Protocol::Http, "http://s:1")),
            1,
        )
        .unwrap();
        let snapshot = rib.handle().table();

        let restored = Rib::with_initial_state(
            NodeConfig::new("node-a", "http://a.internal:4000"),
            snapshot,
        );
        assert_eq!(restored.ports().port_of("svc"), Some(20000));
    }

    #[test]
    fn test_tick_without_changes_reports_unchanged() {
        let mut rib = rib();
        let outcome = rib.apply(Action::Tick { now: 1000 }, 1000).unwrap();
        assert!(!outcome.routes_changed);
        assert!(outcome.propagations.is_empty());
    }
}
