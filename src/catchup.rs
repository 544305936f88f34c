//! The catchup seam: bulk transfer of a log prefix (or snapshot plus
//! prefix) to peers too far behind to replicate incrementally. The engine
//! itself is an external collaborator; the proposer only starts a per-term
//! session, hands peers to it, and consumes tagged results.

use std::sync::Arc;

use crate::agent::{AgentError, AppendAck};
use crate::log::{HistoryId, Peer, Seqno, Term};
use crate::utils::TillerError;

use async_trait::async_trait;

/// Factory for per-term catchup sessions.
#[async_trait]
pub trait CatchupEngine: Send + Sync + 'static {
    /// Starts a session scoped to `(history, term)`. Failure here is fatal
    /// to the calling proposer.
    async fn start(
        &self,
        history_id: HistoryId,
        term: Term,
    ) -> Result<Arc<dyn CatchupSession>, TillerError>;
}

/// One term's exclusive catchup session.
#[async_trait]
pub trait CatchupSession: Send + Sync + 'static {
    /// Brings the peer up to date starting from `from_seqno`. Resolves with
    /// the position the peer reached, like an append acknowledgement.
    async fn catchup_peer(
        &self,
        peer: Peer,
        from_seqno: Seqno,
    ) -> Result<AppendAck, AgentError>;

    /// Abandons an in-flight transfer to the peer, if any.
    async fn cancel(&self, peer: Peer);

    /// Tears the session down.
    async fn stop(&self);
}
