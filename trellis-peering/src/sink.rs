//! Peer transport sink.
//!
//! Consumes propagations produced by commits and delivers them as
//! one-shot RPCs: connect, send one command frame, await the `OK`/`ERROR`
//! reply, hang up. `fan_out` dispatches a batch concurrently and returns
//! settled outcomes — one peer's failure never masks another's result and
//! never propagates back into the queue.
//!
//! Concurrency per peer is capped by a semaphore so a slow peer
//! accumulates bounded in-flight calls instead of unbounded tasks.

use crate::codec::{encode_frame, FrameDecoder, WireError};
use crate::command::{self, PeerCommand};
use async_lock::Semaphore;
use async_trait::async_trait;
use bytes::BytesMut;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::TcpStream;
use dashmap::DashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, trace};
use trellis_core::action::RouteUpdate;
use trellis_core::config::NodeConfig;
use trellis_core::endpoint::Endpoint;
use trellis_core::propagate::Propagation;
use trellis_core::route::{PeerInfo, PeerRecord};

/// Transport-layer errors, surfaced per propagation.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("No peerToken for {0} and no nodeToken configured")]
    NoToken(String),

    #[error("RPC deadline exceeded after {0:?}")]
    Deadline(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Peer rejected the call: {0}")]
    Rejected(String),

    #[error("Invalid peer endpoint: {0}")]
    Endpoint(String),

    #[error("Wire error: {0}")]
    Wire(#[from] WireError),
}

/// Outcome of one dispatched propagation, in batch order.
#[derive(Debug)]
pub enum Settled {
    Fulfilled {
        peer: String,
        kind: &'static str,
    },
    Rejected {
        peer: String,
        kind: &'static str,
        error: SinkError,
    },
}

impl Settled {
    #[must_use]
    pub const fn is_fulfilled(&self) -> bool {
        matches!(self, Self::Fulfilled { .. })
    }

    #[must_use]
    pub fn peer(&self) -> &str {
        match self {
            Self::Fulfilled { peer, .. } | Self::Rejected { peer, .. } => peer,
        }
    }

    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Fulfilled { kind, .. } | Self::Rejected { kind, .. } => kind,
        }
    }
}

/// Delivery seam between the commit path and the wire.
///
/// The queue hands each commit's propagations to `fan_out` from a
/// detached task; implementations must not assume they run on the queue.
#[async_trait(?Send)]
pub trait PeerSink {
    async fn send_open(&self, peer: &PeerRecord, local: &PeerInfo) -> Result<(), SinkError>;

    async fn send_update(
        &self,
        peer: &PeerRecord,
        local: &PeerInfo,
        update: &RouteUpdate,
    ) -> Result<(), SinkError>;

    async fn send_keepalive(&self, peer: &PeerRecord, local: &PeerInfo) -> Result<(), SinkError>;

    async fn send_close(
        &self,
        peer: &PeerRecord,
        local: &PeerInfo,
        code: u16,
        reason: Option<&str>,
    ) -> Result<(), SinkError>;

    /// Dispatch one propagation and fold the result into a settled
    /// outcome.
    async fn dispatch(&self, local: &PeerInfo, propagation: &Propagation) -> Settled {
        let peer = propagation.peer();
        let kind = propagation.kind();
        let result = match propagation {
            Propagation::Open { .. } => self.send_open(peer, local).await,
            Propagation::Update { update, .. } => self.send_update(peer, local, update).await,
            Propagation::Keepalive { .. } => self.send_keepalive(peer, local).await,
            Propagation::Close { code, reason, .. } => {
                self.send_close(peer, local, *code, Some(reason.as_str())).await
            }
        };
        match result {
            Ok(()) => Settled::Fulfilled {
                peer: peer.name.clone(),
                kind,
            },
            Err(error) => Settled::Rejected {
                peer: peer.name.clone(),
                kind,
                error,
            },
        }
    }

    /// Dispatch a batch concurrently; outcomes come back in batch order.
    async fn fan_out(&self, local: &PeerInfo, propagations: &[Propagation]) -> Vec<Settled> {
        futures::future::join_all(propagations.iter().map(|p| self.dispatch(local, p))).await
    }
}

/// Sink that drops every propagation on the floor.
///
/// Useful for single-node deployments and tests that only exercise the
/// state machine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

#[async_trait(?Send)]
impl PeerSink for NullSink {
    async fn send_open(&self, _peer: &PeerRecord, _local: &PeerInfo) -> Result<(), SinkError> {
        Ok(())
    }

    async fn send_update(
        &self,
        _peer: &PeerRecord,
        _local: &PeerInfo,
        _update: &RouteUpdate,
    ) -> Result<(), SinkError> {
        Ok(())
    }

    async fn send_keepalive(&self, _peer: &PeerRecord, _local: &PeerInfo) -> Result<(), SinkError> {
        Ok(())
    }

    async fn send_close(
        &self,
        _peer: &PeerRecord,
        _local: &PeerInfo,
        _code: u16,
        _reason: Option<&str>,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}

/// One-shot RPC sink over TCP.
pub struct RpcSink {
    deadline: Duration,
    node_token: Option<String>,
    per_peer: usize,
    permits: DashMap<String, Arc<Semaphore>>,
}

impl RpcSink {
    #[must_use]
    pub fn new(config: &NodeConfig) -> Self {
        Self {
            deadline: config.rpc_deadline,
            node_token: config.node_token.clone(),
            per_peer: config.peer_inflight.max(1),
            permits: DashMap::new(),
        }
    }

    /// Token attached to calls toward `peer`: the peer's own token, or
    /// the configured node token. Missing both is a configuration error,
    /// failed fast rather than retried.
    fn resolve_token(&self, peer: &PeerRecord) -> Result<String, SinkError> {
        peer.peer_token
            .clone()
            .or_else(|| self.node_token.clone())
            .ok_or_else(|| SinkError::NoToken(peer.name.clone()))
    }

    fn permit_for(&self, peer: &str) -> Arc<Semaphore> {
        self.permits
            .entry(peer.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_peer)))
            .clone()
    }

    async fn call(&self, peer: &PeerRecord, command: &PeerCommand) -> Result<(), SinkError> {
        let semaphore = self.permit_for(&peer.name);
        let _permit = semaphore.acquire_arc().await;

        let authority = Endpoint::parse(&peer.endpoint)
            .map_err(|e| SinkError::Endpoint(e.to_string()))?
            .authority();
        let payload = command::encode(command)?;
        trace!(peer = %peer.name, verb = command.verb(), "rpc dispatch");

        let rpc = async {
            let mut stream = TcpStream::connect(authority.as_str()).await?;

            let frame = encode_frame(&payload);
            let BufResult(written, _) = stream.write_all(frame.to_vec()).await;
            written?;

            let mut decoder = FrameDecoder::new();
            let mut recv = BytesMut::with_capacity(256);
            loop {
                if let Some(frame) = decoder.decode(&mut recv)? {
                    return match command::parse(&frame.payload)? {
                        PeerCommand::Ok => Ok(()),
                        PeerCommand::Error { reason } => Err(SinkError::Rejected(reason)),
                        _ => Err(SinkError::Wire(WireError::Protocol)),
                    };
                }
                let BufResult(read, buf) = stream.read(Vec::with_capacity(1024)).await;
                let n = read?;
                if n == 0 {
                    return Err(SinkError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
                recv.extend_from_slice(&buf);
            }
        };

        match compio::time::timeout(self.deadline, rpc).await {
            Ok(result) => result,
            Err(_) => {
                debug!(peer = %peer.name, deadline = ?self.deadline, "rpc deadline exceeded");
                Err(SinkError::Deadline(self.deadline))
            }
        }
    }
}

#[async_trait(?Send)]
impl PeerSink for RpcSink {
    async fn send_open(&self, peer: &PeerRecord, local: &PeerInfo) -> Result<(), SinkError> {
        let token = self.resolve_token(peer)?;
        self.call(
            peer,
            &PeerCommand::Open {
                peer: local.clone(),
                token: Some(token),
            },
        )
        .await
    }

    async fn send_update(
        &self,
        peer: &PeerRecord,
        local: &PeerInfo,
        update: &RouteUpdate,
    ) -> Result<(), SinkError> {
        let token = self.resolve_token(peer)?;
        self.call(
            peer,
            &PeerCommand::Update {
                peer: local.clone(),
                update: update.clone(),
                token: Some(token),
            },
        )
        .await
    }

    async fn send_keepalive(&self, peer: &PeerRecord, local: &PeerInfo) -> Result<(), SinkError> {
        let token = self.resolve_token(peer)?;
        self.call(
            peer,
            &PeerCommand::Keepalive {
                peer: local.clone(),
                token: Some(token),
            },
        )
        .await
    }

    async fn send_close(
        &self,
        peer: &PeerRecord,
        local: &PeerInfo,
        code: u16,
        reason: Option<&str>,
    ) -> Result<(), SinkError> {
        let token = self.resolve_token(peer)?;
        self.call(
            peer,
            &PeerCommand::Close {
                peer: local.clone(),
                code,
                reason: reason.map(str::to_string),
                token: Some(token),
            },
        )
        .await
    }
}

/// Backoff bookkeeping for re-dialing peers after transport failure.
///
/// The queue never retries; the dialer that owns outbound session
/// establishment consults this between attempts.
#[derive(Debug, Clone)]
pub struct RetryState {
    base_interval: Duration,
    max_interval: Duration,
    attempt: u32,
    current_interval: Duration,
}

impl RetryState {
    #[must_use]
    pub const fn new(base_interval: Duration, max_interval: Duration) -> Self {
        Self {
            base_interval,
            max_interval,
            attempt: 0,
            current_interval: base_interval,
        }
    }

    /// Delay before the next attempt; doubles per attempt up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current_interval;
        self.attempt += 1;
        self.current_interval = self.base_interval * (1_u32 << self.attempt.min(10));
        if self.current_interval > self.max_interval {
            self.current_interval = self.max_interval;
        }
        delay
    }

    /// Reset after a successful attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_interval = self.base_interval;
    }

    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }
}
