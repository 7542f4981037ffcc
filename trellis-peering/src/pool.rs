//! Connection pool and peer bus.
//!
//! Owns inbound peer sessions: accepts connections, drives one session
//! actor per stream, converts decoded peer messages into queue actions,
//! and writes the `OK`/`ERROR` reply the commit result dictates.
//!
//! Peers deliver over one-shot connections, so a connection ending is
//! not a disconnection signal; a peer that stops calling altogether is
//! expired by the hold timer.
//!
//! The registry tracks in-flight sessions by peer name with an epoch
//! guard: a stale actor unwinding late cannot evict its successor's
//! entry.

use crate::codec::encode_frame;
use crate::command::{self, PeerCommand};
use crate::queue::QueueHandle;
use crate::session::{PeerMessage, PeerSession, SessionEvent};
use bytes::Bytes;
use compio::buf::BufResult;
use compio::io::{AsyncRead, AsyncWriteExt};
use compio::net::{TcpListener, TcpStream};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use trellis_core::action::{Action, RouteUpdate};
use trellis_core::error::Error;

/// Shared inbound-session registry.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    sessions: Arc<DashMap<String, u64>>,
    epochs: Arc<AtomicU64>,
}

impl ConnectionPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live inbound sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// True if the named peer currently has an inbound session.
    #[must_use]
    pub fn has_session(&self, peer: &str) -> bool {
        self.sessions.contains_key(peer)
    }

    fn register(&self, peer: &str) -> u64 {
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        self.sessions.insert(peer.to_string(), epoch);
        epoch
    }

    fn deregister(&self, peer: &str, epoch: u64) {
        // Epoch check: only the actor that registered this entry may
        // remove it (a reconnect may have replaced it already).
        self.sessions
            .remove_if(peer, |_, current| *current == epoch);
    }

    /// Accept loop: one session actor per inbound connection.
    pub async fn serve(self, listener: TcpListener, queue: QueueHandle) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    trace!(%addr, "inbound peer connection");
                    let pool = self.clone();
                    let queue = queue.clone();
                    compio::runtime::spawn(async move {
                        pool.run_session(stream, queue).await;
                    })
                    .detach();
                }
                Err(error) => {
                    warn!(%error, "accept failed");
                    break;
                }
            }
        }
    }

    /// Drive one inbound session to completion.
    async fn run_session(&self, mut stream: TcpStream, queue: QueueHandle) {
        let mut session = PeerSession::new();
        let mut registered: Option<(String, u64)> = None;

        'io: loop {
            let BufResult(read, buf) = stream.read(Vec::with_capacity(8192)).await;
            let n = match read {
                Ok(0) => break,
                Ok(n) => n,
                Err(error) => {
                    debug!(%error, "session read failed");
                    break;
                }
            };
            trace!(bytes = n, "session read");

            for event in session.on_bytes(&buf) {
                match event {
                    SessionEvent::Message(message) => {
                        if registered.is_none() {
                            let name = &message.peer().name;
                            let epoch = self.register(name);
                            registered = Some((name.clone(), epoch));
                        }
                        let closing = matches!(message, PeerMessage::Close { .. });
                        let reply = match queue.submit(action_for(message)).await {
                            Ok(_) => ok_frame(),
                            Err(error) => error_frame(&error),
                        };
                        if write_frame(&mut stream, reply).await.is_err() {
                            break 'io;
                        }
                        if closing {
                            break 'io;
                        }
                    }
                    SessionEvent::Fault { reply, error } => {
                        warn!(%error, "session protocol fault");
                        let _ = write_frame(&mut stream, reply).await;
                        break 'io;
                    }
                }
            }
        }

        if let Some((peer, epoch)) = registered {
            self.deregister(&peer, epoch);
        }
    }
}

fn action_for(message: PeerMessage) -> Action {
    match message {
        PeerMessage::Open { peer } => Action::InternalProtocolOpen { peer },
        PeerMessage::Update { peer, update } => Action::InternalProtocolUpdate { peer, update },
        // a keepalive is an empty update: it refreshes the hold timer and
        // propagates nothing
        PeerMessage::Keepalive { peer } => Action::InternalProtocolUpdate {
            peer,
            update: RouteUpdate::default(),
        },
        PeerMessage::Close { peer, code, reason } => {
            Action::InternalProtocolClose { peer, code, reason }
        }
    }
}

fn ok_frame() -> Bytes {
    encode_frame(&command::encode(&PeerCommand::Ok).unwrap_or_default())
}

fn error_frame(error: &Error) -> Bytes {
    encode_frame(
        &command::encode(&PeerCommand::Error {
            reason: error.to_string(),
        })
        .unwrap_or_default(),
    )
}

async fn write_frame(stream: &mut TcpStream, frame: Bytes) -> std::io::Result<()> {
    let BufResult(written, _) = stream.write_all(frame.to_vec()).await;
    written?;
    Ok(())
}
