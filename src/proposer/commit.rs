//! Proposer -- append acknowledgements, committed-prefix derivation, and
//! the handling of a config entry crossing the committed boundary.

use super::*;
use crate::log::NO_SEQNO;

impl Proposer {
    /// Handler of one append acknowledgement (or failure) from a peer.
    pub(super) async fn handle_append_reply(
        &mut self,
        peer: Peer,
        result: Result<AppendAck, AgentError>,
    ) -> Result<(), StopReason> {
        match result {
            Ok(ack) => {
                if !self.statuses.is_tracked(&peer) {
                    return Ok(()); // status dropped while the ack flew
                }
                self.statuses.set_acked(
                    &peer,
                    ack.high_seqno,
                    ack.committed_seqno,
                )?;

                // the local agent's commit acknowledgement is what releases
                // entries from the pending queue
                if peer == Peer::Local {
                    while self
                        .pending
                        .front()
                        .is_some_and(|e| e.seqno <= ack.committed_seqno)
                    {
                        self.pending.pop_front();
                    }
                }

                self.derive_committed().await?;
                self.replicate().await
            }

            Err(err) => {
                if let Some(fatal) = self.common_error_fate(&err) {
                    return Err(fatal);
                }
                pf_warn!("append to {} failed: {}", peer, err);
                self.statuses.remove(&peer);
                Ok(())
            }
        }
    }

    /// Recomputes the committed seqno from acknowledged positions: walk
    /// peers in descending acked order and stop at the first seqno whose
    /// ack set satisfies the quorum in force. The result can sit below the
    /// current committed seqno (a peer's status may have been dropped);
    /// the committed seqno itself never regresses.
    pub(super) async fn derive_committed(&mut self) -> Result<(), StopReason> {
        let mut acked: Vec<(Seqno, Peer)> = self
            .statuses
            .iter()
            .map(|(peer, status)| (status.acked_seqno, peer.clone()))
            .collect();
        acked.sort_unstable_by(|a, b| b.cmp(a));

        let mut voted: BTreeSet<Peer> = BTreeSet::new();
        let mut candidate = NO_SEQNO;
        for (seqno, peer) in acked {
            if seqno == NO_SEQNO {
                break;
            }
            voted.insert(peer);
            if quorum::have_quorum(&voted, &self.quorum) {
                candidate = seqno;
                break;
            }
        }

        self.advance_committed(candidate).await
    }

    /// The effective config entry just crossed the committed boundary.
    pub(super) async fn handle_config_commit(
        &mut self,
    ) -> Result<(), StopReason> {
        pf_info!(
            "config committed at seqno {}",
            self.config_revision.seqno
        );

        // our removal starts to bind only now that the config carrying it
        // is committed; the joint window stays writable
        self.being_removed =
            !self.cluster.settled_voters().contains(&self.me);

        // peers that fell out of the quorum are gone for good now
        for peer in self.hub.live_peers() {
            if !self.peers.contains(&peer) {
                pf_debug!("dropping removed peer {}", peer);
                self.hub.demonitor(&peer);
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
            }
        }

        match &self.cluster {
            // a committed transition immediately advances to its stable
            // destination config
            ClusterConfig::Transition { future, .. } => {
                let future = future.clone();
                pf_debug!("transition committed; proposing stable config");
                self.propose_config(ClusterConfig::Stable(future))?;
                self.replicate().await?;
            }

            ClusterConfig::Stable(config) => {
                if let Some(waiter) = self.cas_waiter.take() {
                    let _ = waiter.send(ConfigReply::Ok {
                        config: self.cluster.clone(),
                        revision: self.config_revision.clone(),
                    });
                }
                // our own removal is final once the stable config without
                // us commits
                if !config.voters.contains(&self.me) {
                    return Err(StopReason::LeaderRemoved);
                }
            }
        }

        self.replay_postponed_configs().await
    }
}
