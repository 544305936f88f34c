//! Proposer -- term establishment (vote collection) and the transition
//! into steady-state proposing.

use super::*;
use crate::agent::Position;

impl Proposer {
    /// Entry to the establish-term phase: monitor the quorum peers, vote
    /// for ourselves off the already-durable local term, and ask everyone
    /// else to vote, under a hard deadline.
    pub(super) async fn enter_establish_term(
        &mut self,
    ) -> Result<(), StopReason> {
        pf_info!(
            "establishing term {} over history {}",
            self.term,
            self.history_id
        );
        if !self.is_voter {
            return Err(StopReason::NotVoter);
        }
        self.establish_deadline.as_mut().reset(
            Instant::now()
                + Duration::from_millis(
                    self.config.establish_term_timeout_ms,
                ),
        );

        // peers that cannot even be resolved start out as failed votes
        for peer in self.peers.clone() {
            if self.hub.monitor(peer.clone()).is_err() {
                pf_warn!("peer {} unreachable at establish", peer);
                self.failed_votes.insert(peer);
            }
        }

        let position = Position {
            term_voted: self.local_meta.term_voted.clone(),
            high_seqno: self.local_meta.high_seqno,
        };
        for peer in self.peers.clone() {
            if peer == Peer::Local || !self.hub.is_live(&peer) {
                continue;
            }
            self.hub.send_establish_term(
                &peer,
                self.history_id.clone(),
                self.term.clone(),
                position.clone(),
            );
        }

        // the local vote is synthetic: local durability was secured before
        // this proposer was allowed to exist
        let local_meta = self.local_meta.clone();
        self.handle_establish_reply(Peer::Local, Ok(local_meta)).await
    }

    /// Handler of one establish-term vote (or the synthetic local one).
    /// Late votes arriving after the phase transition still initialize the
    /// peer's replication status.
    pub(super) async fn handle_establish_reply(
        &mut self,
        peer: Peer,
        result: Result<Metadata, AgentError>,
    ) -> Result<(), StopReason> {
        match result {
            Ok(meta) => {
                if self.votes.contains(&peer) {
                    return Ok(()); // duplicate
                }
                pf_debug!(
                    "vote from {} at committed {} high {}",
                    peer,
                    meta.committed_seqno,
                    meta.high_seqno
                );
                self.votes.insert(peer.clone());
                self.failed_votes.remove(&peer);

                // a majority-acked commit is never reverted; the peer may
                // be telling us about one we missed
                self.advance_committed(meta.committed_seqno).await?;

                if !self.statuses.is_tracked(&peer) {
                    self.statuses.init(peer, &self.term, &meta)?;
                }

                if self.phase == Phase::EstablishTerm {
                    self.check_election_progress().await
                } else {
                    self.replicate().await
                }
            }

            Err(err) => {
                if let Some(fatal) = self.common_error_fate(&err) {
                    return Err(fatal);
                }
                pf_warn!("vote from {} failed: {}", peer, err);
                self.statuses.remove(&peer);
                if self.phase == Phase::EstablishTerm
                    && !self.votes.contains(&peer)
                {
                    self.failed_votes.insert(peer);
                    self.check_election_progress().await?;
                }
                Ok(())
            }
        }
    }

    /// Transition rule applied after every vote or vote failure.
    pub(super) async fn check_election_progress(
        &mut self,
    ) -> Result<(), StopReason> {
        if quorum::have_quorum(&self.votes, &self.quorum) {
            self.enter_proposing().await
        } else if quorum::is_feasible(
            &self.peers,
            &self.failed_votes,
            &self.quorum,
        ) {
            Ok(()) // keep waiting for the stragglers
        } else {
            Err(StopReason::NoQuorum)
        }
    }

    /// Entry to steady-state proposing once the term is established. The
    /// phase change also disarms the establish deadline.
    pub(super) async fn enter_proposing(&mut self) -> Result<(), StopReason> {
        self.phase = Phase::Proposing;
        pf_info!(
            "term {} established with {} votes",
            self.term,
            self.votes.len()
        );

        // without a catchup session, lagging peers could never rejoin
        match self
            .catchup_engine
            .start(self.history_id.clone(), self.term.clone())
            .await
        {
            Ok(session) => self.catchup = Some(session),
            Err(e) => {
                return Err(StopReason::UnexpectedError(format!(
                    "catchup session failed to start: {}",
                    e
                )));
            }
        }

        // the locally uncommitted suffix must still be driven to commit
        // under our term
        let (local_committed, local_high) = (
            self.local_meta.committed_seqno,
            self.local_meta.high_seqno,
        );
        if local_high > local_committed {
            let entries = self
                .local_agent
                .get_log(
                    self.history_id.clone(),
                    self.term.clone(),
                    local_committed + 1,
                    local_high,
                )
                .await
                .map_err(|e| {
                    StopReason::UnexpectedError(format!(
                        "pending preload failed: {}",
                        e
                    ))
                })?;
            self.pending = entries.into();
        }

        if let Some(branch) = self.pending_branch.take() {
            self.resolve_branch(branch)?;
        }

        // a transition that committed under a previous leader still needs
        // its stable half proposed
        if self.config_committed {
            if let ClusterConfig::Transition { future, .. } = &self.cluster {
                let future = future.clone();
                self.propose_config(ClusterConfig::Stable(future))?;
            }
        }

        let _ = self.ready_tx.send(true);
        self.check_peers_interval.reset();
        self.check_peers()?;
        self.replicate().await
    }
}
