//! Serialized action queue.
//!
//! Goals:
//! - Single consumer: one action is planned/committed at any instant
//! - Submissions resolve asynchronously with the commit result or the
//!   plan error, without submitters blocking each other
//! - Propagations are handed to the sink fire-and-forget: a slow peer
//!   RPC never stalls the next commit
//! - The periodic tick is enqueued like any other action so its effects
//!   interleave correctly with user actions
//! - Shutdown drains accepted actions, then rejects further submissions

use crate::monitor::{NodeEvent, NodeEventSender};
use crate::rib::{CommitOutcome, Rib};
use crate::sink::{PeerSink, Settled};
use flume::{Receiver, Sender};
use futures::channel::oneshot;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, trace, warn};
use trellis_core::action::Action;
use trellis_core::error::{Error, Result};
use trellis_core::propagate::Propagation;
use trellis_core::route::{PeerInfo, PeerRecord};

/// Wall-clock milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

enum QueueMsg {
    Submit {
        action: Action,
        reply: Option<oneshot::Sender<Result<CommitSummary>>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

/// What a submitter gets back from a committed action.
#[derive(Debug, Clone)]
pub struct CommitSummary {
    pub routes_changed: bool,
    pub propagations: usize,
    pub revision: u64,
}

impl CommitSummary {
    fn of(outcome: &CommitOutcome) -> Self {
        Self {
            routes_changed: outcome.routes_changed,
            propagations: outcome.propagations.len(),
            revision: outcome.revision,
        }
    }
}

/// Cloneable submission handle.
#[derive(Clone)]
pub struct QueueHandle {
    tx: Sender<QueueMsg>,
}

impl QueueHandle {
    /// Submit an action and await its commit result (or plan error).
    pub async fn submit(&self, action: Action) -> Result<CommitSummary> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send_async(QueueMsg::Submit {
                action,
                reply: Some(reply_tx),
            })
            .await
            .map_err(|_| Error::QueueClosed)?;
        reply_rx.await.map_err(|_| Error::QueueClosed)?
    }

    /// Enqueue without awaiting the result.
    pub fn enqueue(&self, action: Action) -> Result<()> {
        self.tx
            .send(QueueMsg::Submit {
                action,
                reply: None,
            })
            .map_err(|_| Error::QueueClosed)
    }

    /// Stop the queue: accepted actions are processed first, then the
    /// runner exits and later submissions fail with `QueueClosed`.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .tx
            .send_async(QueueMsg::Shutdown { done: done_tx })
            .await
            .is_ok()
        {
            let _ = done_rx.await;
        }
    }
}

/// The queue's single consumer.
///
/// Owns the RIB; nothing else writes it. Runs until shutdown or until
/// every handle is dropped.
pub struct QueueRunner {
    rib: Rib,
    rx: Receiver<QueueMsg>,
    tx: Sender<QueueMsg>,
    sink: Arc<dyn PeerSink>,
    events: NodeEventSender,
    local: PeerInfo,
    tick_interval: Duration,
}

impl QueueRunner {
    pub fn new(
        rib: Rib,
        sink: Arc<dyn PeerSink>,
        events: NodeEventSender,
    ) -> (QueueHandle, Self) {
        let (tx, rx) = flume::unbounded();
        let local = rib.config().local_info();
        let tick_interval = rib.config().tick_interval;
        (
            QueueHandle { tx: tx.clone() },
            Self {
                rib,
                rx,
                tx,
                sink,
                events,
                local,
                tick_interval,
            },
        )
    }

    /// Main loop: multiplex submissions with the tick deadline.
    pub async fn run(mut self) {
        use futures::{select, FutureExt};

        let mut next_tick = Instant::now() + self.tick_interval;
        loop {
            let until_tick = next_tick.saturating_duration_since(Instant::now());
            let tick = compio::time::sleep(until_tick).fuse();
            futures::pin_mut!(tick);

            select! {
                msg = self.rx.recv_async().fuse() => match msg {
                    Ok(QueueMsg::Submit { action, reply }) => self.process(action, reply),
                    Ok(QueueMsg::Shutdown { done }) => {
                        self.drain();
                        let _ = done.send(());
                        break;
                    }
                    Err(_) => break, // every handle dropped
                },
                () = tick => {
                    next_tick = Instant::now() + self.tick_interval;
                    // enqueue rather than apply inline, so the tick lands
                    // behind already-queued actions
                    let _ = self.tx.send(QueueMsg::Submit {
                        action: Action::Tick { now: now_millis() },
                        reply: None,
                    });
                }
            }
        }
        debug!("action queue stopped");
    }

    /// Process everything already accepted, without waiting for more.
    fn drain(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            match msg {
                QueueMsg::Submit { action, reply } => self.process(action, reply),
                QueueMsg::Shutdown { done } => {
                    let _ = done.send(());
                }
            }
        }
    }

    fn process(&mut self, action: Action, reply: Option<oneshot::Sender<Result<CommitSummary>>>) {
        let now = match &action {
            Action::Tick { now } => *now,
            _ => now_millis(),
        };
        trace!(action = action.kind(), "processing");

        match self.rib.apply(action, now) {
            Ok(outcome) => {
                self.emit_events(&outcome);
                self.dispatch(&outcome);
                if let Some(reply) = reply {
                    let _ = reply.send(Ok(CommitSummary::of(&outcome)));
                }
            }
            Err(error) => {
                debug!(%error, "action rejected");
                if let Some(reply) = reply {
                    let _ = reply.send(Err(error));
                }
            }
        }
    }

    fn emit_events(&self, outcome: &CommitOutcome) {
        if outcome.routes_changed {
            let _ = self.events.send(NodeEvent::RoutesChanged {
                revision: outcome.revision,
            });
        }
        for peer in outcome.next.internal.peers.iter() {
            let was_connected = outcome
                .prev
                .peer(&peer.name)
                .is_some_and(PeerRecord::is_connected);
            if peer.is_connected() && !was_connected {
                let _ = self.events.send(NodeEvent::PeerUp {
                    peer: peer.name.clone(),
                });
            }
        }
        for peer in outcome.prev.internal.peers.iter() {
            if outcome.next.peer(&peer.name).is_none() {
                let _ = self.events.send(NodeEvent::PeerDown {
                    peer: peer.name.clone(),
                });
            }
        }
    }

    /// Hand the commit's propagations to the sink on a detached task.
    /// The next commit does not wait for delivery.
    fn dispatch(&self, outcome: &CommitOutcome) {
        if outcome.propagations.is_empty() {
            return;
        }
        let sink = self.sink.clone();
        let local = self.local.clone();
        let events = self.events.clone();
        let tx = self.tx.clone();
        let propagations = outcome.propagations.clone();

        compio::runtime::spawn(async move {
            let settled = sink.fan_out(&local, &propagations).await;
            for (propagation, outcome) in propagations.iter().zip(settled) {
                match outcome {
                    Settled::Fulfilled { peer, kind } => {
                        trace!(peer = %peer, kind, "propagation delivered");
                        // a delivered open means the outbound session is up
                        if matches!(propagation, Propagation::Open { .. }) {
                            let _ = tx.send(QueueMsg::Submit {
                                action: Action::InternalProtocolConnected {
                                    peer: propagation.peer().info(),
                                },
                                reply: None,
                            });
                        }
                    }
                    Settled::Rejected { peer, kind, error } => {
                        warn!(peer = %peer, kind, %error, "propagation failed");
                        let _ = events.send(NodeEvent::PropagationFailed {
                            peer,
                            kind,
                            reason: error.to_string(),
                        });
                    }
                }
            }
        })
        .detach();
    }
}
