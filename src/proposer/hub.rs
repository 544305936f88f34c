//! Ref-tagged RPC dispatch and liveness monitoring of peer agents.
//!
//! The hub owns, per live peer, a worker task that performs the peer's
//! requests strictly in dispatch order, and a watcher task parked on the
//! agent's `down()` future. Every result or down notification is delivered
//! to the proposer's event loop tagged with the monitor reference that was
//! current when the request was dispatched; a tag that no longer matches is
//! stale and is dropped without touching proposer state.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::agent::{
    Agent, AgentDirectory, AgentError, AppendAck, Metadata, Position,
};
use crate::catchup::CatchupSession;
use crate::log::{HistoryId, LogEntry, Peer, Seqno, Term};
use crate::utils::TillerError;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Monitor reference: one per (peer, monitoring episode).
pub(crate) type MonRef = u64;

/// Identifier of an outstanding sync-quorum request.
pub(crate) type SyncRef = u64;

/// What an `ensure_term` dispatch was for; routed back with the response.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub(crate) enum EnsureCtx {
    /// `check_peers` probe to learn the peer's position.
    Probe,

    /// Vote collection for the given sync-quorum request.
    Sync(SyncRef),
}

/// A response delivered back to the proposer.
#[derive(Debug)]
pub(crate) enum PeerReply {
    Establish(Result<Metadata, AgentError>),
    Ensure(EnsureCtx, Result<Metadata, AgentError>),
    Append(Result<AppendAck, AgentError>),
    Catchup(Result<AppendAck, AgentError>),
}

/// Multiplexed hub events consumed by the proposer's event loop.
#[derive(Debug)]
pub(crate) enum HubEvent {
    Reply {
        peer: Peer,
        mon_ref: MonRef,
        reply: PeerReply,
    },

    Down {
        peer: Peer,
        mon_ref: MonRef,
    },
}

/// One outbound request for a peer worker.
enum WorkItem {
    Establish {
        history_id: HistoryId,
        term: Term,
        position: Position,
    },
    Ensure {
        ctx: EnsureCtx,
        history_id: HistoryId,
        term: Term,
    },
    Append {
        history_id: HistoryId,
        term: Term,
        committed_seqno: Seqno,
        prev_seqno: Seqno,
        entries: Vec<LogEntry>,
    },
    Catchup {
        session: Arc<dyn CatchupSession>,
        from_seqno: Seqno,
    },
}

/// Book-keeping for one live (monitored) peer.
struct LivePeer {
    mon_ref: MonRef,
    tx_work: mpsc::UnboundedSender<WorkItem>,
    worker: JoinHandle<()>,
    watcher: JoinHandle<()>,
}

/// The agent hub module.
pub(crate) struct AgentHub {
    /// Resolves peers to their agent clients; owned by the server shell.
    directory: Arc<dyn AgentDirectory>,

    /// Currently monitored peers.
    live: HashMap<Peer, LivePeer>,

    /// Next monitor reference to hand out.
    next_ref: MonRef,

    /// Sender side of the event channel, cloned into spawned tasks.
    tx_event: mpsc::UnboundedSender<HubEvent>,

    /// Receiver side of the event channel.
    rx_event: mpsc::UnboundedReceiver<HubEvent>,
}

impl AgentHub {
    pub(crate) fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        let (tx_event, rx_event) = mpsc::unbounded_channel();
        AgentHub {
            directory,
            live: HashMap::new(),
            next_ref: 0,
            tx_event,
            rx_event,
        }
    }

    /// Starts monitoring the peer, spawning its worker and down-watcher.
    /// No-op returning the current reference if already monitored. Fails if
    /// the directory cannot resolve the peer right now.
    pub(crate) fn monitor(
        &mut self,
        peer: Peer,
    ) -> Result<MonRef, TillerError> {
        if let Some(live) = self.live.get(&peer) {
            return Ok(live.mon_ref);
        }
        let Some(client) = self.directory.agent(&peer) else {
            return Err(TillerError(format!(
                "peer {} not resolvable",
                peer
            )));
        };

        self.next_ref += 1;
        let mon_ref = self.next_ref;
        let (tx_work, rx_work) = mpsc::unbounded_channel();

        let worker = tokio::spawn(Self::peer_worker(
            peer.clone(),
            mon_ref,
            client.clone(),
            rx_work,
            self.tx_event.clone(),
        ));

        let tx_event = self.tx_event.clone();
        let watcher_peer = peer.clone();
        let watcher = tokio::spawn(async move {
            client.down().await;
            let _ = tx_event.send(HubEvent::Down {
                peer: watcher_peer,
                mon_ref,
            });
        });

        self.live.insert(
            peer,
            LivePeer {
                mon_ref,
                tx_work,
                worker,
                watcher,
            },
        );
        Ok(mon_ref)
    }

    /// Stops monitoring the peer; any responses still in flight become
    /// stale and will be discarded on receipt.
    pub(crate) fn demonitor(&mut self, peer: &Peer) {
        if let Some(live) = self.live.remove(peer) {
            live.worker.abort();
            live.watcher.abort();
        }
    }

    pub(crate) fn demonitor_all(&mut self) {
        let peers: Vec<Peer> = self.live.keys().cloned().collect();
        for peer in &peers {
            self.demonitor(peer);
        }
    }

    /// Marks the peer dead after a validated down notification.
    pub(crate) fn mark_down(&mut self, peer: &Peer) {
        self.demonitor(peer);
    }

    pub(crate) fn is_live(&self, peer: &Peer) -> bool {
        self.live.contains_key(peer)
    }

    pub(crate) fn live_peers(&self) -> Vec<Peer> {
        self.live.keys().cloned().collect()
    }

    /// Subset of `among` that is not currently live.
    pub(crate) fn dead_among(
        &self,
        among: &BTreeSet<Peer>,
    ) -> BTreeSet<Peer> {
        among
            .iter()
            .filter(|p| !self.is_live(p))
            .cloned()
            .collect()
    }

    /// True iff the tag matches the peer's current monitoring episode.
    pub(crate) fn accepts(&self, peer: &Peer, mon_ref: MonRef) -> bool {
        self.live
            .get(peer)
            .is_some_and(|live| live.mon_ref == mon_ref)
    }

    pub(crate) fn send_establish_term(
        &self,
        peer: &Peer,
        history_id: HistoryId,
        term: Term,
        position: Position,
    ) {
        self.dispatch(
            peer,
            WorkItem::Establish {
                history_id,
                term,
                position,
            },
        );
    }

    pub(crate) fn send_ensure_term(
        &self,
        peer: &Peer,
        ctx: EnsureCtx,
        history_id: HistoryId,
        term: Term,
    ) {
        self.dispatch(
            peer,
            WorkItem::Ensure {
                ctx,
                history_id,
                term,
            },
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn send_append(
        &self,
        peer: &Peer,
        history_id: HistoryId,
        term: Term,
        committed_seqno: Seqno,
        prev_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) {
        self.dispatch(
            peer,
            WorkItem::Append {
                history_id,
                term,
                committed_seqno,
                prev_seqno,
                entries,
            },
        );
    }

    pub(crate) fn send_catchup(
        &self,
        peer: &Peer,
        session: Arc<dyn CatchupSession>,
        from_seqno: Seqno,
    ) {
        self.dispatch(
            peer,
            WorkItem::Catchup {
                session,
                from_seqno,
            },
        );
    }

    /// Waits for the next hub event. Never resolves to `None` while the hub
    /// is alive since the hub keeps one sender side itself.
    pub(crate) async fn recv(&mut self) -> Option<HubEvent> {
        self.rx_event.recv().await
    }

    /// Queues a request on the peer's worker. Requests to peers that are
    /// not live are dropped; the caller learns about the peer through the
    /// down notification that made it dead.
    fn dispatch(&self, peer: &Peer, item: WorkItem) {
        if let Some(live) = self.live.get(peer) {
            let _ = live.tx_work.send(item);
        }
    }

    /// Worker loop of one monitoring episode: performs the peer's requests
    /// strictly in dispatch order so that appends are delivered and acked
    /// in seqno order.
    async fn peer_worker(
        peer: Peer,
        mon_ref: MonRef,
        client: Arc<dyn Agent>,
        mut rx_work: mpsc::UnboundedReceiver<WorkItem>,
        tx_event: mpsc::UnboundedSender<HubEvent>,
    ) {
        while let Some(item) = rx_work.recv().await {
            let reply = match item {
                WorkItem::Establish {
                    history_id,
                    term,
                    position,
                } => PeerReply::Establish(
                    client.establish_term(history_id, term, position).await,
                ),
                WorkItem::Ensure {
                    ctx,
                    history_id,
                    term,
                } => PeerReply::Ensure(
                    ctx,
                    client.ensure_term(history_id, term).await,
                ),
                WorkItem::Append {
                    history_id,
                    term,
                    committed_seqno,
                    prev_seqno,
                    entries,
                } => PeerReply::Append(
                    client
                        .append(
                            history_id,
                            term,
                            committed_seqno,
                            prev_seqno,
                            entries,
                        )
                        .await,
                ),
                WorkItem::Catchup {
                    session,
                    from_seqno,
                } => PeerReply::Catchup(
                    session.catchup_peer(peer.clone(), from_seqno).await,
                ),
            };

            if tx_event
                .send(HubEvent::Reply {
                    peer: peer.clone(),
                    mon_ref,
                    reply,
                })
                .is_err()
            {
                break; // proposer gone
            }
        }
    }
}

impl Drop for AgentHub {
    fn drop(&mut self) {
        self.demonitor_all();
    }
}
