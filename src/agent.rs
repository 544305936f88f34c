//! The per-peer agent interface: log storage and term persistence live
//! behind this seam. The proposer only ever talks to agents through these
//! traits; a deployment wires in its RPC stubs, tests wire in in-memory
//! agents.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::log::{ClusterConfig, HistoryId, LogEntry, Peer, Revision, Seqno, Term};

use async_trait::async_trait;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// A peer's position in its own log, as judged for term establishment.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct Position {
    /// Highest term the peer has voted in.
    pub term_voted: Term,

    /// Highest seqno present in the peer's log.
    pub high_seqno: Seqno,
}

/// Branch record persisted by agents when an operator declares quorum
/// failover; consumed by the proposer on entry to proposing.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct Branch {
    /// History id the branch opens.
    pub history_id: HistoryId,

    /// Peer that coordinated the failover.
    pub coordinator: Peer,

    /// Surviving voter set the branch reduces the cluster to.
    pub peers: BTreeSet<Peer>,
}

/// Metadata record returned by term-establishment RPCs.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct Metadata {
    pub peer: Peer,
    pub history_id: HistoryId,
    pub term: Term,
    pub term_voted: Term,
    pub high_seqno: Seqno,
    pub committed_seqno: Seqno,
    pub config: ClusterConfig,
    pub config_revision: Revision,
    pub pending_branch: Option<Branch>,
}

/// Acknowledgement of a successful append: where the peer's log stands
/// after applying it.
#[derive(
    Debug, PartialEq, Eq, Copy, Clone, Serialize, Deserialize, GetSize,
)]
pub struct AppendAck {
    pub high_seqno: Seqno,
    pub committed_seqno: Seqno,
}

/// Errors an agent may reply with.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum AgentError {
    /// The agent has seen a term at least as high as the given one.
    ConflictingTerm(Term),

    /// The agent is on a different history lineage (a branch we have not
    /// ingested yet).
    HistoryMismatch,

    /// The caller's log position is behind the agent's; it cannot grant a
    /// vote to a candidate that would lose committed entries.
    Behind,

    /// The requested log prefix has been compacted away.
    Compacted,

    /// The agent has not established the given term.
    NotEstablished,

    /// The agent could not be reached.
    Unreachable,

    /// Anything else; treated as fatal by the proposer.
    Other(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Per-peer RPC surface of an agent. All methods are request/response; the
/// proposer never calls them inline from its event loop but through
/// dispatch-and-forget tasks owned by its hub.
#[async_trait]
pub trait Agent: Send + Sync + 'static {
    /// Asks the agent to vote for the given term, recording it durably.
    /// Replies with the agent's metadata on success.
    async fn establish_term(
        &self,
        history_id: HistoryId,
        term: Term,
        position: Position,
    ) -> Result<Metadata, AgentError>;

    /// Confirms the agent still recognizes the given term as current.
    async fn ensure_term(
        &self,
        history_id: HistoryId,
        term: Term,
    ) -> Result<Metadata, AgentError>;

    /// Appends entries after `prev_seqno`, truncating any divergent
    /// uncommitted tail, and advances the agent's committed seqno.
    async fn append(
        &self,
        history_id: HistoryId,
        term: Term,
        committed_seqno: Seqno,
        prev_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) -> Result<AppendAck, AgentError>;

    /// Reads entries `[low, high]` out of the agent's log.
    async fn get_log(
        &self,
        history_id: HistoryId,
        term: Term,
        low: Seqno,
        high: Seqno,
    ) -> Result<Vec<LogEntry>, AgentError>;

    /// Tells the agent a seqno is committed so downstream state machines
    /// can apply. Best-effort; used on proposer shutdown.
    async fn mark_committed(
        &self,
        history_id: HistoryId,
        term: Term,
        seqno: Seqno,
    ) -> Result<(), AgentError>;

    /// Resolves when the agent goes down. This is the monitor primitive:
    /// the hub keeps one watcher task per live peer parked on this future.
    async fn down(&self);
}

/// The additional surface only the local node's agent serves.
#[async_trait]
pub trait LocalAgent: Agent {
    /// Durably records the new term locally before any peer is contacted.
    /// A proposer cannot run without local term durability.
    async fn establish_local_term(
        &self,
        term: Term,
    ) -> Result<Metadata, AgentError>;
}

/// Resolves peers to their agent clients. Owned by the server shell, which
/// knows how cluster members are addressed; consulted by the proposer's hub
/// whenever a config change brings a new peer into scope.
pub trait AgentDirectory: Send + Sync + 'static {
    /// Returns a client for the given peer, or `None` if the peer cannot
    /// currently be resolved.
    fn agent(&self, peer: &Peer) -> Option<Arc<dyn Agent>>;
}
