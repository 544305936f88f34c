//! The proposer: the leader-side state machine of the replicated log.
//!
//! A proposer owns exactly one term for its lifetime. It establishes the
//! term across the cluster's voting agents, replicates an ordered log of
//! commands, derives the committed prefix under the (possibly joint)
//! quorum in force, serves sync-quorum read barriers, drives
//! joint-consensus config transitions, and resolves operator branches. It
//! runs as a single cooperative actor: one event at a time from its
//! mailbox, all outbound RPCs dispatch-and-forget through the hub.

mod commit;
mod configure;
mod establish;
mod hub;
mod replicate;
mod status;
mod syncread;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Arc;

use crate::agent::{
    AgentDirectory, AgentError, AppendAck, Branch, LocalAgent, Metadata,
};
use crate::catchup::{CatchupEngine, CatchupSession};
use crate::log::{
    ClusterConfig, Config, HistoryId, LogEntry, Peer, Revision, Seqno, Term,
};
use crate::quorum::{self, Quorum};
use crate::utils::TillerError;

use hub::{AgentHub, EnsureCtx, HubEvent, MonRef, PeerReply, SyncRef};
use status::StatusTable;
use syncread::SyncRequest;

use serde::Deserialize;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Duration, Instant, Interval, MissedTickBehavior};

/// Configuration parameters struct. A misspelled tunable in the TOML
/// fragment is an error, not silently ignored.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProposerConfig {
    /// Hard deadline on establishing the term across a quorum, in millisecs.
    pub establish_term_timeout_ms: u64,

    /// Interval of re-probing quorum peers that have no status entry, in
    /// millisecs.
    pub check_peers_interval_ms: u64,

    /// How long `ProposerHandle::stop()` waits for the drain, in millisecs.
    pub stop_timeout_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ProposerConfig {
    fn default() -> Self {
        ProposerConfig {
            establish_term_timeout_ms: 10000,
            check_peers_interval_ms: 5000,
            stop_timeout_ms: 10000,
        }
    }
}

impl ProposerConfig {
    /// Overlays a TOML fragment, if any, on top of the defaults.
    pub fn parse(config_str: Option<&str>) -> Result<Self, TillerError> {
        match config_str {
            None => Ok(Default::default()),
            Some(fragment) => Ok(toml::from_str(fragment)?),
        }
    }
}

/// Opaque command addressed to a named replicated state machine.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct RsmCommand {
    pub rsm: String,
    pub payload: Vec<u8>,
}

/// Outcome of one admitted (or rejected) command.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CommandReply {
    /// Command staged at the given seqno.
    Accepted(Seqno),

    /// This node is not (or no longer) the leader.
    NotLeader,

    /// The command targets a state machine no config knows about.
    UnknownRsm(String),
}

/// Outcome of a sync-quorum read barrier.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum SyncReply {
    /// A quorum confirmed the term at this instant.
    Ok,

    /// Too many quorum peers failed for the barrier to ever succeed.
    NoQuorum,

    /// This node is not (or no longer) the leader.
    NotLeader,
}

/// Outcome of a config read or compare-and-swap.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ConfigReply {
    Ok {
        config: ClusterConfig,
        revision: Revision,
    },

    /// The expected revision did not match; carries the current one.
    CasFailed(Revision),

    NotLeader,

    /// The proposer terminated while the request was in flight.
    LeaderLost,
}

/// Why a proposer terminated. A proposer's death is not the cluster's: the
/// server shell respawns one in a new term, possibly elsewhere.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum StopReason {
    /// This node is not a voter of the effective config.
    NotVoter,

    /// The election quorum became infeasible.
    NoQuorum,

    /// Some agent has seen a higher term.
    ConflictingTerm(Term),

    /// Some agent is on a history lineage we have not ingested.
    HistoryMismatch,

    /// The establish-term deadline expired.
    EstablishTimeout,

    /// A committed config removed this node from the voter set.
    LeaderRemoved,

    /// The local agent died; nothing can be made durable any more.
    LocalAgentDown,

    /// Stopped on request (or the last handle was dropped).
    Stopped,

    /// Anything the proposer has no policy for.
    UnexpectedError(String),
}

impl From<TillerError> for StopReason {
    fn from(e: TillerError) -> Self {
        StopReason::UnexpectedError(e.0)
    }
}

/// Client-facing casts routed through `ProposerHandle`.
enum ApiRequest {
    AppendCommands {
        batch: Vec<(oneshot::Sender<CommandReply>, RsmCommand)>,
    },

    SyncQuorum {
        reply_to: oneshot::Sender<SyncReply>,
    },

    GetConfig {
        reply_to: oneshot::Sender<ConfigReply>,
    },

    CasConfig {
        reply_to: oneshot::Sender<ConfigReply>,
        new_config: Config,
        expected: Revision,
    },

    Stop {
        ack: oneshot::Sender<()>,
    },
}

/// A config request held back while the current config is uncommitted;
/// replayed in FIFO order once it commits. Never dropped silently.
enum ConfigRequest {
    Get {
        reply_to: oneshot::Sender<ConfigReply>,
    },

    Cas {
        reply_to: oneshot::Sender<ConfigReply>,
        new_config: Config,
        expected: Revision,
    },
}

/// Proposer lifecycle phase. Termination is modeled by leaving the event
/// loop with a `StopReason`, not by a third phase value.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
enum Phase {
    EstablishTerm,
    Proposing,
}

/// The proposer module.
pub struct Proposer {
    /// Configuration parameters struct.
    config: ProposerConfig,

    /// Concrete name of this node.
    me: Peer,

    /// History lineage entries are proposed under. Changes only when a
    /// branch is resolved.
    history_id: HistoryId,

    /// The one term this proposer owns.
    term: Term,

    /// Local agent; establishes the term durably and serves log reads.
    local_agent: Arc<dyn LocalAgent>,

    /// Ref-tagged RPC dispatch and liveness monitoring.
    hub: AgentHub,

    /// Catchup engine; a per-term session is started on entry to proposing.
    catchup_engine: Arc<dyn CatchupEngine>,

    /// This term's catchup session, once started.
    catchup: Option<Arc<dyn CatchupSession>>,

    /// Lifecycle phase.
    phase: Phase,

    /// Effective cluster config: the latest one appended to the log,
    /// committed or not.
    cluster: ClusterConfig,

    /// Revision of the effective config entry.
    config_revision: Revision,

    /// Whether the effective config entry is committed.
    config_committed: bool,

    /// True once the last committed config excludes this node from the
    /// settled voter set; new commands are refused from that point. An
    /// uncommitted removal still in its joint window does not count.
    being_removed: bool,

    /// Whether this node can vote in its own election at all.
    is_voter: bool,

    /// All peers of the effective quorum expression (includes `Local`).
    peers: BTreeSet<Peer>,

    /// Effective quorum: `Joint(All({Local}), …)` over translated voters.
    quorum: Quorum,

    /// Successful establish-term votes.
    votes: BTreeSet<Peer>,

    /// Peers whose vote failed or that died before voting.
    failed_votes: BTreeSet<Peer>,

    /// Local agent metadata captured at term establishment.
    local_meta: Metadata,

    /// Highest staged seqno.
    high_seqno: Seqno,

    /// Highest committed seqno; monotonic for the proposer's lifetime.
    committed_seqno: Seqno,

    /// Entries staged but not yet observed committed by the local agent.
    pending: VecDeque<LogEntry>,

    /// Per-peer replication statuses.
    statuses: StatusTable,

    /// Outstanding sync-quorum read barriers.
    sync_requests: HashMap<SyncRef, SyncRequest>,

    /// Next sync-quorum request id to hand out.
    next_sync_ref: SyncRef,

    /// Operator branch awaiting resolution on entry to proposing.
    pending_branch: Option<Branch>,

    /// The caller awaiting a config transition it initiated; replied only
    /// once the subsequent stable config commits.
    cas_waiter: Option<oneshot::Sender<ConfigReply>>,

    /// Config requests held back while the config is uncommitted.
    postponed_configs: VecDeque<ConfigRequest>,

    /// Receiver side of the API mailbox.
    rx_api: mpsc::UnboundedReceiver<ApiRequest>,

    /// Establish-term deadline, armed on entry to the establish phase and
    /// disarmed by the phase guard once proposing.
    establish_deadline: Pin<Box<time::Sleep>>,

    /// Periodic peer re-probing interval.
    check_peers_interval: Interval,

    /// Readiness flag observed by the server shell.
    ready_tx: watch::Sender<bool>,

    /// Ack handle of a pending synchronous stop request.
    stop_ack: Option<oneshot::Sender<()>>,
}

impl Proposer {
    /// Creates a new proposer for the given term, durably recording the
    /// term on the local agent. Fails if local term durability cannot be
    /// had; a proposer cannot run without it.
    pub async fn new_and_setup(
        me: Peer,
        term: Term,
        local_agent: Arc<dyn LocalAgent>,
        directory: Arc<dyn AgentDirectory>,
        catchup_engine: Arc<dyn CatchupEngine>,
        config_str: Option<&str>,
    ) -> Result<(Self, ProposerHandle), TillerError> {
        if me == Peer::Local {
            return logged_err!("proposer needs a concrete peer name");
        }
        let config = ProposerConfig::parse(config_str)?;

        let local_meta = local_agent
            .establish_local_term(term.clone())
            .await
            .map_err(|e| {
                TillerError(format!("local term establishment failed: {}", e))
            })?;

        let cluster = local_meta.config.clone();
        // a pending branch is only valid with every survivor on board, so
        // the term is established over the branch peers unanimously; the
        // normal quorum of the recorded config may be unrecoverable
        let (inner, is_voter) = match &local_meta.pending_branch {
            Some(branch) => (
                Quorum::All(branch.peers.clone()),
                branch.peers.contains(&me),
            ),
            None => (
                Self::voters_quorum(&cluster),
                Self::election_member(&cluster, &me),
            ),
        };
        let effective = Quorum::require_local(quorum::translate(inner, &me));
        let peers = quorum::quorum_peers(&effective);
        let config_committed = local_meta.config_revision.seqno
            <= local_meta.committed_seqno;
        // only a committed config can put us on the way out
        let being_removed =
            config_committed && !cluster.settled_voters().contains(&me);

        let mut check_peers_interval = time::interval(
            Duration::from_millis(config.check_peers_interval_ms),
        );
        check_peers_interval
            .set_missed_tick_behavior(MissedTickBehavior::Skip);

        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let stop_timeout = Duration::from_millis(config.stop_timeout_ms);

        let proposer = Proposer {
            config,
            me,
            history_id: local_meta.history_id.clone(),
            term,
            local_agent,
            hub: AgentHub::new(directory),
            catchup_engine,
            catchup: None,
            phase: Phase::EstablishTerm,
            config_committed,
            config_revision: local_meta.config_revision.clone(),
            being_removed,
            is_voter,
            peers,
            quorum: effective,
            votes: BTreeSet::new(),
            failed_votes: BTreeSet::new(),
            high_seqno: local_meta.high_seqno,
            committed_seqno: local_meta.committed_seqno,
            pending: VecDeque::new(),
            statuses: StatusTable::new(),
            sync_requests: HashMap::new(),
            next_sync_ref: 0,
            pending_branch: local_meta.pending_branch.clone(),
            cas_waiter: None,
            postponed_configs: VecDeque::new(),
            rx_api,
            establish_deadline: Box::pin(time::sleep(Duration::ZERO)),
            check_peers_interval,
            ready_tx,
            stop_ack: None,
            local_meta,
            cluster,
        };

        let handle = ProposerHandle {
            tx_api,
            ready_rx,
            stop_timeout,
        };
        Ok((proposer, handle))
    }

    /// Main event loop logic of running this proposer. Resolves with the
    /// reason the proposer terminated, after the shutdown sequence ran.
    pub async fn run(&mut self) -> StopReason {
        let reason = match self.event_loop().await {
            Ok(()) => StopReason::Stopped,
            Err(reason) => reason,
        };
        self.shutdown(&reason).await;
        reason
    }

    /// Processes one event at a time until a stop reason emerges.
    async fn event_loop(&mut self) -> Result<(), StopReason> {
        self.enter_establish_term().await?;

        loop {
            tokio::select! {
                // client-facing cast
                req = self.rx_api.recv() => match req {
                    Some(req) => self.handle_api_request(req).await?,
                    // every handle dropped: nobody can reach us any more
                    None => return Err(StopReason::Stopped),
                },

                // agent/catchup response or down notification
                event = self.hub.recv() => match event {
                    Some(event) => self.handle_hub_event(event).await?,
                    None => {
                        return Err(StopReason::UnexpectedError(
                            "hub event channel closed".into(),
                        ));
                    }
                },

                // establish-term deadline
                () = &mut self.establish_deadline,
                        if self.phase == Phase::EstablishTerm => {
                    return Err(StopReason::EstablishTimeout);
                },

                // periodic peer re-probing
                _ = self.check_peers_interval.tick(),
                        if self.phase == Phase::Proposing => {
                    self.check_peers()?;
                },
            }
        }
    }

    /// Synthesized handler of client-facing casts.
    async fn handle_api_request(
        &mut self,
        req: ApiRequest,
    ) -> Result<(), StopReason> {
        match req {
            ApiRequest::AppendCommands { batch } => {
                self.handle_append_commands(batch).await
            }
            ApiRequest::SyncQuorum { reply_to } => {
                self.handle_sync_quorum(reply_to)
            }
            ApiRequest::GetConfig { reply_to } => {
                self.handle_get_config(reply_to)
            }
            ApiRequest::CasConfig {
                reply_to,
                new_config,
                expected,
            } => {
                self.handle_cas_config(reply_to, new_config, expected)
                    .await
            }
            ApiRequest::Stop { ack } => {
                self.stop_ack = Some(ack);
                Err(StopReason::Stopped)
            }
        }
    }

    /// Synthesized handler of hub events. Replies whose monitor reference
    /// is stale, or whose peer fell out of the quorum, are dropped here
    /// before they can touch any state.
    async fn handle_hub_event(
        &mut self,
        event: HubEvent,
    ) -> Result<(), StopReason> {
        match event {
            HubEvent::Reply {
                peer,
                mon_ref,
                reply,
            } => {
                if !self.hub.accepts(&peer, mon_ref)
                    || !self.peers.contains(&peer)
                {
                    pf_trace!("dropped stale reply from {}", peer);
                    return Ok(());
                }
                match reply {
                    PeerReply::Establish(result) => {
                        self.handle_establish_reply(peer, result).await
                    }
                    PeerReply::Ensure(EnsureCtx::Probe, result) => {
                        self.handle_probe_reply(peer, result).await
                    }
                    PeerReply::Ensure(EnsureCtx::Sync(sref), result) => {
                        self.handle_sync_reply(peer, sref, result)
                    }
                    PeerReply::Append(result) => {
                        self.handle_append_reply(peer, result).await
                    }
                    PeerReply::Catchup(result) => {
                        self.handle_catchup_reply(peer, result).await
                    }
                }
            }

            HubEvent::Down { peer, mon_ref } => {
                self.handle_peer_down(peer, mon_ref).await
            }
        }
    }

    /// Handler of a validated peer-down notification.
    async fn handle_peer_down(
        &mut self,
        peer: Peer,
        mon_ref: MonRef,
    ) -> Result<(), StopReason> {
        if !self.hub.accepts(&peer, mon_ref) {
            return Ok(());
        }
        self.hub.mark_down(&peer);

        if peer == Peer::Local {
            return Err(StopReason::LocalAgentDown);
        }
        pf_warn!("peer {} down", peer);

        if self
            .statuses
            .get(&peer)
            .is_some_and(|s| s.catchup_in_progress)
        {
            if let Some(session) = self.catchup.clone() {
                let target = peer.clone();
                tokio::spawn(async move {
                    session.cancel(target).await;
                });
            }
        }
        self.statuses.remove(&peer);

        match self.phase {
            Phase::EstablishTerm => {
                // a recorded vote stays valid; only a peer that never voted
                // shrinks the feasible electorate
                if !self.votes.contains(&peer) {
                    self.failed_votes.insert(peer);
                    self.check_election_progress().await?;
                }
                Ok(())
            }
            Phase::Proposing => {
                self.sync_note_down(&peer);
                Ok(())
            }
        }
    }

    /// Classifies an agent error shared across vote, probe, append, sync,
    /// and catchup paths. `Some(reason)` means the proposer must die;
    /// `None` means the failure stays local to the peer.
    fn common_error_fate(&self, err: &AgentError) -> Option<StopReason> {
        match err {
            AgentError::ConflictingTerm(other) if other > &self.term => {
                Some(StopReason::ConflictingTerm(other.clone()))
            }
            // a concurrent candidate at our own term number; tolerated as
            // long as enough other peers still answer us
            AgentError::ConflictingTerm(_) => None,
            AgentError::HistoryMismatch => Some(StopReason::HistoryMismatch),
            AgentError::Behind
            | AgentError::NotEstablished
            | AgentError::Unreachable => None,
            AgentError::Compacted => Some(StopReason::UnexpectedError(
                "unexpected compacted error from peer".into(),
            )),
            AgentError::Other(msg) => {
                Some(StopReason::UnexpectedError(msg.clone()))
            }
        }
    }

    /// Raises `committed_seqno` to `candidate` if that is an advance;
    /// `committed_seqno` never regresses. Crossing the effective config
    /// entry's revision triggers the config-commit handler.
    async fn advance_committed(
        &mut self,
        candidate: Seqno,
    ) -> Result<(), StopReason> {
        if candidate <= self.committed_seqno {
            return Ok(());
        }
        self.committed_seqno = candidate;
        pf_trace!("committed seqno advanced to {}", candidate);

        if !self.config_committed
            && self.config_revision.seqno <= self.committed_seqno
        {
            self.config_committed = true;
            if self.phase == Phase::Proposing {
                self.handle_config_commit().await?;
            }
            // during establish the commit was merely learned from votes;
            // entry to proposing picks the transition up itself
        }
        Ok(())
    }

    /// Drain sequence after the event loop decided to die.
    async fn shutdown(&mut self, reason: &StopReason) {
        pf_info!(
            "proposer of term {} stopping: {:?}",
            self.term,
            reason
        );
        self.hub.demonitor_all();

        // nothing new gets in; answer whatever is still queued
        self.rx_api.close();
        while let Ok(req) = self.rx_api.try_recv() {
            match req {
                ApiRequest::AppendCommands { batch } => {
                    for (reply_to, _) in batch {
                        let _ = reply_to.send(CommandReply::NotLeader);
                    }
                }
                ApiRequest::SyncQuorum { reply_to } => {
                    let _ = reply_to.send(SyncReply::NotLeader);
                }
                ApiRequest::GetConfig { reply_to }
                | ApiRequest::CasConfig { reply_to, .. } => {
                    let _ = reply_to.send(ConfigReply::NotLeader);
                }
                ApiRequest::Stop { ack } => {
                    let _ = ack.send(());
                }
            }
        }

        for (_, request) in self.sync_requests.drain() {
            let _ = request.reply_to.send(SyncReply::NotLeader);
        }
        if let Some(waiter) = self.cas_waiter.take() {
            let _ = waiter.send(ConfigReply::LeaderLost);
        }
        for request in self.postponed_configs.drain(..) {
            match request {
                ConfigRequest::Get { reply_to }
                | ConfigRequest::Cas { reply_to, .. } => {
                    let _ = reply_to.send(ConfigReply::LeaderLost);
                }
            }
        }

        // best-effort: let the local agent apply what we know is committed
        if self.phase == Phase::Proposing {
            let _ = self
                .local_agent
                .mark_committed(
                    self.history_id.clone(),
                    self.term.clone(),
                    self.committed_seqno,
                )
                .await;
        }

        if let Some(session) = self.catchup.take() {
            session.stop().await;
        }

        let _ = self.ready_tx.send(false);
        if let Some(ack) = self.stop_ack.take() {
            let _ = ack.send(());
        }
    }
}

/// Cloneable sender handle to a proposer, given out by the server shell.
/// All operations are casts; replies arrive on the provided oneshot
/// senders with the user-visible outcomes.
#[derive(Clone)]
pub struct ProposerHandle {
    tx_api: mpsc::UnboundedSender<ApiRequest>,
    ready_rx: watch::Receiver<bool>,
    stop_timeout: Duration,
}

impl ProposerHandle {
    /// Stages a batch of commands. Each reply handle receives
    /// `Accepted(seqno)`, `NotLeader`, or `UnknownRsm`.
    pub fn append_commands(
        &self,
        batch: Vec<(oneshot::Sender<CommandReply>, RsmCommand)>,
    ) -> Result<(), TillerError> {
        self.tx_api.send(ApiRequest::AppendCommands { batch })?;
        Ok(())
    }

    /// Read barrier: proves the proposer is still authoritative at this
    /// instant by collecting a quorum of term confirmations.
    pub fn sync_quorum(
        &self,
        reply_to: oneshot::Sender<SyncReply>,
    ) -> Result<(), TillerError> {
        self.tx_api.send(ApiRequest::SyncQuorum { reply_to })?;
        Ok(())
    }

    /// Reads the current committed config and its revision.
    pub fn get_config(
        &self,
        reply_to: oneshot::Sender<ConfigReply>,
    ) -> Result<(), TillerError> {
        self.tx_api.send(ApiRequest::GetConfig { reply_to })?;
        Ok(())
    }

    /// Compare-and-swap of the cluster config: proposes a joint-consensus
    /// transition to `new_config` if `expected` still names the current
    /// revision. The reply arrives only once the destination stable config
    /// commits.
    pub fn cas_config(
        &self,
        reply_to: oneshot::Sender<ConfigReply>,
        new_config: Config,
        expected: Revision,
    ) -> Result<(), TillerError> {
        self.tx_api.send(ApiRequest::CasConfig {
            reply_to,
            new_config,
            expected,
        })?;
        Ok(())
    }

    /// Watch flipping to `true` once the proposer reaches proposing, and
    /// back to `false` when it dies.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready_rx.clone()
    }

    /// Synchronous stop: resolves once the proposer drained, or errors
    /// after the configured stop timeout.
    pub async fn stop(&self) -> Result<(), TillerError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx_api.send(ApiRequest::Stop { ack: ack_tx }).is_err() {
            return Ok(()); // already gone
        }
        match time::timeout(self.stop_timeout, ack_rx).await {
            Ok(_) => Ok(()),
            Err(_) => Err(TillerError::msg("proposer stop timed out")),
        }
    }
}
