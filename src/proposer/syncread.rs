//! Proposer -- sync-quorum read barriers: proving the proposer is still
//! authoritative at this instant by collecting a quorum of term
//! confirmations. Used to linearize reads.

use super::*;

/// One outstanding read barrier. Lives until its quorum is achieved or
/// becomes infeasible.
pub(super) struct SyncRequest {
    pub(super) reply_to: oneshot::Sender<SyncReply>,
    pub(super) votes: BTreeSet<Peer>,
    pub(super) failed_votes: BTreeSet<Peer>,
}

impl Proposer {
    /// Handler of a sync-quorum request: fan `ensure_term` out to every
    /// live quorum peer and track the confirmations.
    pub(super) fn handle_sync_quorum(
        &mut self,
        reply_to: oneshot::Sender<SyncReply>,
    ) -> Result<(), StopReason> {
        if self.phase != Phase::Proposing {
            let _ = reply_to.send(SyncReply::NotLeader);
            return Ok(());
        }

        self.next_sync_ref += 1;
        let sref = self.next_sync_ref;
        let request = SyncRequest {
            reply_to,
            // our own term is durable by construction, so the local vote
            // is implicit
            votes: BTreeSet::from([Peer::Local]),
            failed_votes: self.hub.dead_among(&self.peers),
        };
        pf_trace!("sync-quorum request {} opened", sref);

        for peer in &self.peers {
            if *peer == Peer::Local || !self.hub.is_live(peer) {
                continue;
            }
            self.hub.send_ensure_term(
                peer,
                EnsureCtx::Sync(sref),
                self.history_id.clone(),
                self.term.clone(),
            );
        }

        // a single-node quorum (or an already-hopeless one) settles now
        if let Some(request) = self.settle_sync(sref, request) {
            self.sync_requests.insert(sref, request);
        }
        Ok(())
    }

    /// Handler of one `ensure_term` confirmation for a read barrier.
    pub(super) fn handle_sync_reply(
        &mut self,
        peer: Peer,
        sref: SyncRef,
        result: Result<Metadata, AgentError>,
    ) -> Result<(), StopReason> {
        let Some(mut request) = self.sync_requests.remove(&sref) else {
            return Ok(()); // already settled
        };

        match result {
            Ok(_) => {
                request.votes.insert(peer);
            }
            Err(err) => {
                if let Some(fatal) = self.common_error_fate(&err) {
                    // keep the request around so shutdown answers it
                    self.sync_requests.insert(sref, request);
                    return Err(fatal);
                }
                pf_warn!(
                    "sync-quorum confirmation from {} failed: {}",
                    peer,
                    err
                );
                request.failed_votes.insert(peer);
            }
        }

        if let Some(request) = self.settle_sync(sref, request) {
            self.sync_requests.insert(sref, request);
        }
        Ok(())
    }

    /// A peer died: every outstanding barrier loses its potential vote.
    pub(super) fn sync_note_down(&mut self, peer: &Peer) {
        let outstanding: Vec<(SyncRef, SyncRequest)> =
            self.sync_requests.drain().collect();
        for (sref, mut request) in outstanding {
            request.failed_votes.insert(peer.clone());
            if let Some(request) = self.settle_sync(sref, request) {
                self.sync_requests.insert(sref, request);
            }
        }
    }

    /// A config change brought a new peer in: outstanding barriers fan out
    /// to it so they can still achieve the (now wider) quorum.
    pub(super) fn sync_fanout(&self, peer: &Peer) {
        for sref in self.sync_requests.keys() {
            self.hub.send_ensure_term(
                peer,
                EnsureCtx::Sync(*sref),
                self.history_id.clone(),
                self.term.clone(),
            );
        }
    }

    /// Replies and consumes the request if its outcome is decided; hands
    /// it back otherwise.
    fn settle_sync(
        &self,
        sref: SyncRef,
        request: SyncRequest,
    ) -> Option<SyncRequest> {
        if quorum::have_quorum(&request.votes, &self.quorum) {
            pf_trace!("sync-quorum request {} confirmed", sref);
            let _ = request.reply_to.send(SyncReply::Ok);
            None
        } else if !quorum::is_feasible(
            &self.peers,
            &request.failed_votes,
            &self.quorum,
        ) {
            pf_debug!("sync-quorum request {} infeasible", sref);
            let _ = request.reply_to.send(SyncReply::NoQuorum);
            None
        } else {
            Some(request)
        }
    }
}
