//! Node event monitoring.
//!
//! Provides an event stream for tracking committed lifecycle changes:
//! route-table revisions, peer sessions coming and going, and failed
//! propagations. The data-plane adapter watches `RoutesChanged` and
//! re-renders its snapshot from the published state.

use std::fmt;

/// Committed lifecycle events.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The local or learned route set changed; `revision` is the
    /// published state revision that carries the change.
    RoutesChanged { revision: u64 },

    /// A peer session became established.
    PeerUp { peer: String },

    /// A peer was removed (admin delete, close, or hold expiry).
    PeerDown { peer: String },

    /// An outbound propagation settled rejected.
    PropagationFailed {
        peer: String,
        kind: &'static str,
        reason: String,
    },
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoutesChanged { revision } => write!(f, "Routes changed (revision {revision})"),
            Self::PeerUp { peer } => write!(f, "Peer up: {peer}"),
            Self::PeerDown { peer } => write!(f, "Peer down: {peer}"),
            Self::PropagationFailed { peer, kind, reason } => {
                write!(f, "Propagation {kind} to {peer} failed: {reason}")
            }
        }
    }
}

/// Handle for receiving node events.
pub type NodeMonitor = flume::Receiver<NodeEvent>;

/// Internal sender for node events.
///
/// Exposed so runtime components (queue runner, connection pool) can emit.
pub type NodeEventSender = flume::Sender<NodeEvent>;

/// Creates a new monitoring channel pair.
#[must_use]
pub fn create_monitor() -> (NodeEventSender, NodeMonitor) {
    flume::unbounded()
}
