/// Trellis Error Types
///
/// Errors surfaced by the routing kernel: plan rejections, port pool
/// exhaustion, and queue lifecycle failures.

use thiserror::Error;

/// Main error type for kernel operations.
///
/// Plan rejections carry the stable message the admin surface returns
/// verbatim, so the `Display` strings here are part of the API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// A local route with this name already exists
    #[error("Route already exists")]
    RouteExists(String),

    /// No local route with this name
    #[error("Route not found")]
    RouteNotFound(String),

    /// A peer with this name already exists
    #[error("Peer already exists")]
    PeerExists(String),

    /// No peer with this name
    #[error("Peer not found")]
    PeerNotFound(String),

    /// Peer creation requires a capability token
    #[error("peerToken is required to create a peer")]
    PeerTokenRequired,

    /// Port pool has no free ports left
    #[error("No free ports in configured range")]
    PortsExhausted,

    /// A specific port is already held by another key
    #[error("Port {0} already in use")]
    PortInUse(u16),

    /// Action queue has shut down and rejects submissions
    #[error("Action queue is closed")]
    QueueClosed,
}

/// Result type alias for kernel operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a duplicate-route rejection
    pub fn route_exists(name: impl Into<String>) -> Self {
        Self::RouteExists(name.into())
    }

    /// Create a missing-route rejection
    pub fn route_not_found(name: impl Into<String>) -> Self {
        Self::RouteNotFound(name.into())
    }

    /// Create a duplicate-peer rejection
    pub fn peer_exists(name: impl Into<String>) -> Self {
        Self::PeerExists(name.into())
    }

    /// Create a missing-peer rejection
    pub fn peer_not_found(name: impl Into<String>) -> Self {
        Self::PeerNotFound(name.into())
    }

    /// Check if this is a plan-time validation rejection.
    ///
    /// Validation rejections never mutate state and are returned to the
    /// submitter of the offending action.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::RouteExists(_)
                | Self::RouteNotFound(_)
                | Self::PeerExists(_)
                | Self::PeerNotFound(_)
                | Self::PeerTokenRequired
        )
    }

    /// Check if this is a resource-exhaustion condition.
    ///
    /// Exhaustion is non-fatal: the route stays unstamped and a later
    /// allocation may succeed.
    #[must_use]
    pub const fn is_exhaustion(&self) -> bool {
        matches!(self, Self::PortsExhausted | Self::PortInUse(_))
    }
}
