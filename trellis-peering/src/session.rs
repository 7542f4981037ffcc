//! Sans-IO inbound peer session.
//!
//! Consumes raw bytes, yields decoded peer messages and fault replies.
//! Peers deliver propagations over one-shot connections, so every
//! request command is self-attributing: the first command pins the
//! session's peer identity, and any later command on the same connection
//! must carry the same name. Nothing is accepted after `CLOSE`. The
//! session does no I/O and submits no actions — the connection pool owns
//! both.

use crate::codec::{Frame, FrameDecoder, WireError};
use crate::command::{self, PeerCommand};
use bytes::{Bytes, BytesMut};
use trellis_core::action::RouteUpdate;
use trellis_core::route::PeerInfo;

/// A decoded inbound message attributed to the session's peer.
#[derive(Debug, Clone)]
pub enum PeerMessage {
    Open {
        peer: PeerInfo,
    },
    Update {
        peer: PeerInfo,
        update: RouteUpdate,
    },
    /// Liveness probe.
    Keepalive {
        peer: PeerInfo,
    },
    Close {
        peer: PeerInfo,
        code: u16,
        reason: Option<String>,
    },
}

impl PeerMessage {
    #[must_use]
    pub fn peer(&self) -> &PeerInfo {
        match self {
            Self::Open { peer }
            | Self::Update { peer, .. }
            | Self::Keepalive { peer }
            | Self::Close { peer, .. } => peer,
        }
    }
}

/// Events emitted by the session.
#[derive(Debug)]
pub enum SessionEvent {
    /// Dispatch as an action; the pool replies `OK`/`ERROR` from the
    /// commit result.
    Message(PeerMessage),
    /// Protocol violation: write `reply` and drop the connection.
    Fault { reply: Bytes, error: WireError },
}

enum State {
    AwaitRequest,
    Attributed { peer: PeerInfo },
    Closed,
}

/// Inbound session state machine.
pub struct PeerSession {
    state: State,
    decoder: FrameDecoder,
    recv: BytesMut,
}

impl Default for PeerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerSession {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: State::AwaitRequest,
            decoder: FrameDecoder::new(),
            recv: BytesMut::with_capacity(256),
        }
    }

    /// The pinned peer identity, once a request has attributed it.
    #[must_use]
    pub fn peer(&self) -> Option<&PeerInfo> {
        match &self.state {
            State::Attributed { peer } => Some(peer),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self.state, State::Closed)
    }

    /// Feed received bytes into the session.
    pub fn on_bytes(&mut self, bytes: &[u8]) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        self.recv.extend_from_slice(bytes);

        loop {
            if self.is_closed() {
                break;
            }
            match self.decoder.decode(&mut self.recv) {
                Ok(Some(frame)) => {
                    if let Some(event) = self.on_frame(&frame) {
                        let fatal = matches!(event, SessionEvent::Fault { .. });
                        events.push(event);
                        if fatal {
                            self.state = State::Closed;
                            break;
                        }
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    events.push(fault(error));
                    self.state = State::Closed;
                    break;
                }
            }
        }
        events
    }

    fn on_frame(&mut self, frame: &Frame) -> Option<SessionEvent> {
        if !frame.is_command() {
            return Some(fault(WireError::Protocol));
        }
        let command = match command::parse(&frame.payload) {
            Ok(command) => command,
            Err(error) => return Some(fault(error)),
        };

        let message = match command {
            PeerCommand::Open { peer, .. } => PeerMessage::Open { peer },
            PeerCommand::Update { peer, update, .. } => PeerMessage::Update { peer, update },
            PeerCommand::Keepalive { peer, .. } => PeerMessage::Keepalive { peer },
            PeerCommand::Close {
                peer, code, reason, ..
            } => PeerMessage::Close { peer, code, reason },
            // OK / ERROR are replies; a peer never sends them unprompted
            PeerCommand::Ok | PeerCommand::Error { .. } => {
                return Some(fault(WireError::Protocol));
            }
        };

        match &self.state {
            State::AwaitRequest => {
                self.state = State::Attributed {
                    peer: message.peer().clone(),
                };
            }
            State::Attributed { peer } => {
                // identity is pinned for the life of the connection
                if message.peer().name != peer.name {
                    return Some(fault(WireError::Protocol));
                }
            }
            State::Closed => return None,
        }

        if matches!(message, PeerMessage::Close { .. }) {
            self.state = State::Closed;
        }
        Some(SessionEvent::Message(message))
    }
}

fn fault(error: WireError) -> SessionEvent {
    let reply = crate::codec::encode_frame(
        &command::encode(&PeerCommand::Error {
            reason: error.to_string(),
        })
        .unwrap_or_default(),
    );
    SessionEvent::Fault { reply, error }
}
