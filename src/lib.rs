//! Public interface to the Tiller core library: the proposer state machine
//! of a leader-driven replicated log, together with the agent, catchup,
//! and quorum seams it is built around.

#![allow(clippy::uninlined_format_args)]

#[macro_use]
mod utils;

mod agent;
mod catchup;
mod log;
mod proposer;
mod quorum;

pub use agent::{
    Agent, AgentDirectory, AgentError, AppendAck, Branch, LocalAgent,
    Metadata, Position,
};
pub use catchup::{CatchupEngine, CatchupSession};
pub use self::log::{
    ClusterConfig, Config, HistoryId, LogEntry, LogValue, Peer, Revision,
    RsmSpec, Seqno, Term, NO_SEQNO,
};
pub use proposer::{
    CommandReply, ConfigReply, Proposer, ProposerConfig, ProposerHandle,
    RsmCommand, StopReason, SyncReply,
};
pub use quorum::{
    have_quorum, is_feasible, quorum_peers, translate, Quorum,
};
pub use utils::TillerError;
