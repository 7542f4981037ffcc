//! # Trellis
//!
//! A service-mesh control plane in which independent nodes peer over a
//! BGP-inspired `open / update / keepalive / close` dialogue, exchange
//! routes to application services with node-path attributes, and program
//! a local port map so a data-plane proxy can forward traffic — possibly
//! through transit nodes — to wherever a named service terminates.
//!
//! ## Architecture
//!
//! Trellis is structured as a **routing kernel** with clean layering:
//!
//! - **`trellis-core`**: deterministic kernel — snapshots, pure plan
//!   transitions, propagation computation, best-path selection, port
//!   accounting. No I/O, no clocks.
//! - **`trellis-peering`**: protocol and runtime — wire codec, sessions,
//!   the serialized action queue, the one-shot RPC transport sink.
//! - **`trellis`**: public API surface (this crate).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use trellis::{Node, NodeConfig, PeerInfo, Protocol, Route};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let node = Node::builder(
//!     NodeConfig::new("node-a", "http://a.internal:4000")
//!         .with_node_token("capability-token"),
//! )
//! .with_listen_addr("0.0.0.0:4000")
//! .start()
//! .await?;
//!
//! // peer with node-b and expose a local service
//! node.create_peer(
//!     PeerInfo::new("node-b", "http://b.internal:4000").with_token("token-for-b"),
//! )
//! .await?;
//! node.create_route(Route::new("books-api", Protocol::Http, "http://books:8080"))
//!     .await?;
//!
//! // the data-plane adapter re-renders on every RoutesChanged event
//! while let Ok(event) = node.events().recv_async().await {
//!     println!("{event}");
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - Actions commit one at a time, in submission order
//! - Learned routes never contain this node in their path (loop freedom)
//! - Routes are never re-advertised toward a peer already on their path
//!   (split-horizon)
//! - A peer silent past its hold time is withdrawn everywhere within a
//!   tick

#![deny(unsafe_code)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::future_not_send)] // single-threaded compio runtime

mod node;

pub use node::{Node, NodeBuilder};

// Re-export the kernel vocabulary
pub use trellis_core::action::{Action, RouteUpdate, UpdateAction, UpdateEntry};
pub use trellis_core::config::NodeConfig;
pub use trellis_core::endpoint::Endpoint;
pub use trellis_core::error::{Error, Result};
pub use trellis_core::ports::{PortAllocator, PortRange};
pub use trellis_core::route::{
    ConnectionStatus, InternalRoute, NodePath, PeerInfo, PeerRecord, Protocol, Route,
};
pub use trellis_core::selection::{LocRib, LocRibEntry, SelectionReason};
pub use trellis_core::table::RouteTable;

// Re-export the runtime seams
pub use trellis_peering::monitor::{NodeEvent, NodeMonitor};
pub use trellis_peering::queue::CommitSummary;
pub use trellis_peering::rib::StateHandle;
pub use trellis_peering::sink::{PeerSink, Settled, SinkError};

/// Development helpers (tests/demos)
pub mod dev_tracing;
