//! The `Node` handle: admin surface and runtime wiring.
//!
//! `NodeBuilder::start` assembles the full stack on the current compio
//! runtime: the RIB and its action queue, the RPC sink, the inbound
//! listener (optional), and the dialer that establishes outbound
//! sessions with backoff. The returned `Node` is the admin surface —
//! every method funnels an action through the queue and returns the
//! commit result or the plan error.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use compio::net::TcpListener;
use hashbrown::HashMap;
use tracing::{debug, info, warn};
use trellis_core::action::Action;
use trellis_core::config::NodeConfig;
use trellis_core::error::Result;
use trellis_core::route::{PeerInfo, Route};
use trellis_core::selection::LocRib;
use trellis_core::table::RouteTable;
use trellis_peering::monitor::{create_monitor, NodeMonitor};
use trellis_peering::pool::ConnectionPool;
use trellis_peering::queue::{CommitSummary, QueueHandle, QueueRunner};
use trellis_peering::rib::{Rib, StateHandle};
use trellis_peering::sink::{PeerSink, RetryState, RpcSink};

/// Base delay between outbound dial attempts.
const DIAL_BASE_DELAY: Duration = Duration::from_millis(500);

/// Cap on the dial backoff.
const DIAL_MAX_DELAY: Duration = Duration::from_secs(30);

/// Builder for a running node.
pub struct NodeBuilder {
    config: NodeConfig,
    listen: Option<String>,
    initial: Option<RouteTable>,
}

impl NodeBuilder {
    #[must_use]
    pub fn from_config(config: NodeConfig) -> Self {
        Self {
            config,
            listen: None,
            initial: None,
        }
    }

    /// Bind the inbound peering listener on `addr` (`host:port`).
    #[must_use]
    pub fn with_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.listen = Some(addr.into());
        self
    }

    /// Restore a checkpointed snapshot instead of starting empty.
    #[must_use]
    pub fn with_initial_state(mut self, state: RouteTable) -> Self {
        self.initial = Some(state);
        self
    }

    /// Start the node on the current runtime.
    pub async fn start(self) -> io::Result<Node> {
        let config = self.config;
        let rib = match self.initial {
            Some(state) => Rib::with_initial_state(config.clone(), state),
            None => Rib::new(config.clone()),
        };
        let state = rib.handle();

        let (events, monitor) = create_monitor();
        let sink = Arc::new(RpcSink::new(&config));
        let (queue, runner) = QueueRunner::new(rib, sink.clone(), events);
        compio::runtime::spawn(runner.run()).detach();

        let pool = ConnectionPool::new();
        if let Some(addr) = &self.listen {
            let listener = TcpListener::bind(addr.as_str()).await?;
            info!(addr = %addr, node = %config.name, "peering listener bound");
            let serve_pool = pool.clone();
            let serve_queue = queue.clone();
            compio::runtime::spawn(async move {
                serve_pool.serve(listener, serve_queue).await;
            })
            .detach();
        }

        compio::runtime::spawn(dial_initializing_peers(
            config.clone(),
            state.clone(),
            sink.clone(),
            queue.clone(),
        ))
        .detach();

        Ok(Node {
            config,
            queue,
            state,
            monitor,
            pool,
        })
    }
}

/// A running control-plane node.
pub struct Node {
    config: NodeConfig,
    queue: QueueHandle,
    state: StateHandle,
    monitor: NodeMonitor,
    pool: ConnectionPool,
}

impl Node {
    /// Builder entry point.
    #[must_use]
    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::from_config(config)
    }

    #[must_use]
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    // ---- admin actions ----

    /// Add a peer. Requires `peer_token` on the info.
    pub async fn create_peer(&self, info: PeerInfo) -> Result<CommitSummary> {
        self.queue.submit(Action::LocalPeerCreate(info)).await
    }

    /// Edit a peer; its session state resets to initializing.
    pub async fn update_peer(&self, info: PeerInfo) -> Result<CommitSummary> {
        self.queue.submit(Action::LocalPeerUpdate(info)).await
    }

    /// Remove a peer; its routes are withdrawn everywhere.
    pub async fn delete_peer(&self, name: impl Into<String>) -> Result<CommitSummary> {
        self.queue
            .submit(Action::LocalPeerDelete { name: name.into() })
            .await
    }

    /// Expose a local service to the mesh.
    pub async fn create_route(&self, route: Route) -> Result<CommitSummary> {
        self.queue.submit(Action::LocalRouteCreate(route)).await
    }

    /// Withdraw a local service.
    pub async fn delete_route(&self, name: impl Into<String>) -> Result<CommitSummary> {
        self.queue
            .submit(Action::LocalRouteDelete { name: name.into() })
            .await
    }

    // ---- observation ----

    /// Current committed snapshot.
    #[must_use]
    pub fn snapshot(&self) -> RouteTable {
        self.state.table()
    }

    /// Current best-path metadata.
    #[must_use]
    pub fn loc_rib(&self) -> LocRib {
        self.state.metadata()
    }

    /// Lifecycle event stream; the data-plane adapter re-renders its
    /// snapshot on `RoutesChanged`.
    #[must_use]
    pub fn events(&self) -> &NodeMonitor {
        &self.monitor
    }

    /// In-flight inbound sessions.
    #[must_use]
    pub fn inbound_sessions(&self) -> usize {
        self.pool.session_count()
    }

    /// Stop the queue: pending actions drain, then submissions fail.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

/// Establish outbound sessions for peers stuck in `initializing`.
///
/// The queue never retries a failed open; this task owns re-dialing with
/// exponential backoff per peer, and marks the session connected once a
/// dial lands.
async fn dial_initializing_peers(
    config: NodeConfig,
    state: StateHandle,
    sink: Arc<RpcSink>,
    queue: QueueHandle,
) {
    let local = config.local_info();
    let mut backoff: HashMap<String, (RetryState, Instant)> = HashMap::new();

    loop {
        compio::time::sleep(config.tick_interval).await;
        let table = state.table();

        // forget peers that are gone or established
        backoff.retain(|name, _| {
            table
                .peer(name)
                .is_some_and(|p| !p.is_connected())
        });

        let waiting: Vec<_> = table
            .internal
            .peers
            .iter()
            .filter(|p| !p.is_connected())
            .cloned()
            .collect();

        for peer in waiting {
            let now = Instant::now();
            let due = match backoff.get(&peer.name) {
                Some((_, at)) => *at <= now,
                None => true,
            };
            if !due {
                continue;
            }

            match sink.send_open(&peer, &local).await {
                Ok(()) => {
                    debug!(peer = %peer.name, "outbound session established");
                    backoff.remove(&peer.name);
                    let _ = queue
                        .submit(Action::InternalProtocolConnected { peer: peer.info() })
                        .await;
                }
                Err(error) => {
                    let entry = backoff.entry(peer.name.clone()).or_insert_with(|| {
                        (RetryState::new(DIAL_BASE_DELAY, DIAL_MAX_DELAY), now)
                    });
                    let delay = entry.0.next_delay();
                    entry.1 = now + delay;
                    warn!(peer = %peer.name, %error, attempt = entry.0.attempt(), next_in = ?delay, "dial failed");
                }
            }
        }
    }
}
