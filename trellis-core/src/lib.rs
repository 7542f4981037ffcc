//! Trellis Core
//!
//! This crate contains the deterministic routing kernel:
//! - Immutable route-table snapshots with identity-based change detection (`table`)
//! - The action set fed through the single-writer queue (`action`)
//! - Pure plan transitions with port-operation derivation (`plan`)
//! - The propagation computer: split-horizon, loop avoidance, egress rewriting (`propagate`)
//! - Best-path selection / LocRIB (`selection`)
//! - The bijective port allocator backing egress listeners (`ports`)
//! - Node configuration, endpoints, and error types
//!
//! Nothing here does I/O or touches a clock; timestamps arrive as
//! arguments. The peering layer drives this kernel from its action queue.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

pub mod action;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod plan;
pub mod ports;
pub mod propagate;
pub mod route;
pub mod selection;
pub mod table;

// A small prelude for downstream crates. Kept minimal to avoid API
// lock-in.
pub mod prelude {
    pub use crate::action::{Action, RouteUpdate, UpdateAction, UpdateEntry};
    pub use crate::config::NodeConfig;
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{Error, Result};
    pub use crate::plan::{plan, Plan};
    pub use crate::ports::{PortAllocator, PortOp, PortRange};
    pub use crate::propagate::{compute, Propagation};
    pub use crate::route::{
        egress_key, ConnectionStatus, InternalRoute, NodePath, PeerInfo, PeerRecord, Protocol,
        Route,
    };
    pub use crate::selection::{LocRib, LocRibEntry, SelectionReason};
    pub use crate::table::RouteTable;
}
