//! Trellis Peering
//!
//! The protocol and runtime layer on top of the `trellis-core` kernel:
//! - Wire frame codec and command encoding (`codec`, `command`)
//! - Sans-IO inbound session state machine (`session`)
//! - The RIB engine: plan + commit + published state (`rib`)
//! - The serialized action queue with integrated tick (`queue`)
//! - The peer transport sink: one-shot RPCs, settled fan-out (`sink`)
//! - The connection pool owning inbound sessions (`pool`)
//! - Node event monitoring (`monitor`)
//!
//! Layering matches the kernel/protocol split: everything deterministic
//! lives below in `trellis-core`; everything that touches a socket, a
//! clock or a channel lives here.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::future_not_send)] // single-threaded compio runtime

pub mod codec;
pub mod command;
pub mod monitor;
pub mod pool;
pub mod queue;
pub mod rib;
pub mod session;
pub mod sink;

pub mod prelude {
    pub use crate::codec::{encode_frame, Frame, FrameDecoder, WireError};
    pub use crate::command::PeerCommand;
    pub use crate::monitor::{create_monitor, NodeEvent, NodeEventSender, NodeMonitor};
    pub use crate::pool::ConnectionPool;
    pub use crate::queue::{now_millis, CommitSummary, QueueHandle, QueueRunner};
    pub use crate::rib::{CommitOutcome, Rib, StateHandle};
    pub use crate::session::{PeerMessage, PeerSession, SessionEvent};
    pub use crate::sink::{NullSink, PeerSink, RetryState, RpcSink, Settled, SinkError};
}
