//! Proposer -- command admission and log replication fan-out.

use std::cmp;

use super::*;
use crate::log::LogValue;

impl Proposer {
    /// Handler of a client command batch. Each command is either rejected
    /// outright or staged at the next seqno; the batch then replicates.
    pub(super) async fn handle_append_commands(
        &mut self,
        batch: Vec<(oneshot::Sender<CommandReply>, RsmCommand)>,
    ) -> Result<(), StopReason> {
        if self.phase != Phase::Proposing {
            for (reply_to, _) in batch {
                let _ = reply_to.send(CommandReply::NotLeader);
            }
            return Ok(());
        }

        let known: BTreeSet<String> = self
            .cluster
            .known_rsms()
            .into_iter()
            .map(str::to_owned)
            .collect();

        for (reply_to, command) in batch {
            if self.being_removed {
                let _ = reply_to.send(CommandReply::NotLeader);
                continue;
            }
            if !known.contains(&command.rsm) {
                let _ =
                    reply_to.send(CommandReply::UnknownRsm(command.rsm));
                continue;
            }

            let seqno = self.high_seqno + 1;
            pf_trace!(
                "staged command for rsm {} at seqno {}",
                command.rsm,
                seqno
            );
            self.pending.push_back(LogEntry {
                history_id: self.history_id.clone(),
                term: self.term.clone(),
                seqno,
                value: LogValue::Command {
                    rsm: command.rsm,
                    payload: command.payload,
                },
            });
            self.high_seqno = seqno;
            let _ = reply_to.send(CommandReply::Accepted(seqno));
        }

        self.replicate().await
    }

    /// Dispatches outstanding entries and commit advances to every live
    /// peer that is behind and not parked in catchup. The local peer is
    /// just another target.
    pub(super) async fn replicate(&mut self) -> Result<(), StopReason> {
        let targets: Vec<Peer> = self
            .statuses
            .iter()
            .filter(|(peer, status)| {
                !status.catchup_in_progress
                    && self.hub.is_live(peer)
                    && (status.needs_sync
                        || self.high_seqno > status.sent_seqno
                        || self.committed_seqno > status.sent_commit_seqno)
            })
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in targets {
            let Some(status) = self.statuses.get(&peer) else {
                continue;
            };
            let prev_seqno = status.sent_seqno;

            match self.collect_entries(prev_seqno + 1, self.high_seqno).await
            {
                Ok(entries) => {
                    if !entries.is_empty() {
                        pf_trace!(
                            "sending seqnos {} - {} -> {}",
                            prev_seqno + 1,
                            self.high_seqno,
                            peer
                        );
                    }
                    self.statuses.set_sent(
                        &peer,
                        self.high_seqno,
                        self.committed_seqno,
                    )?;
                    self.hub.send_append(
                        &peer,
                        self.history_id.clone(),
                        self.term.clone(),
                        self.committed_seqno,
                        prev_seqno,
                        entries,
                    );
                }
                // the prefix the peer needs is gone from the live log
                Err(AgentError::Compacted) => {
                    self.start_catchup(peer, prev_seqno + 1);
                }
                Err(err) => {
                    return Err(StopReason::UnexpectedError(format!(
                        "local log read failed: {}",
                        err
                    )));
                }
            }
        }
        Ok(())
    }

    /// Assembles entries `[low, high]`: the suffix still in the pending
    /// queue comes from memory, anything older from the local log.
    async fn collect_entries(
        &self,
        low: Seqno,
        high: Seqno,
    ) -> Result<Vec<LogEntry>, AgentError> {
        if low > high {
            return Ok(Vec::new());
        }
        let pending_low = self
            .pending
            .front()
            .map(|entry| entry.seqno)
            .unwrap_or(high + 1);

        let mut entries = Vec::new();
        if low < pending_low {
            let stored_high = cmp::min(high, pending_low - 1);
            entries = self
                .local_agent
                .get_log(
                    self.history_id.clone(),
                    self.term.clone(),
                    low,
                    stored_high,
                )
                .await?;
        }
        entries.extend(
            self.pending
                .iter()
                .filter(|entry| entry.seqno >= low && entry.seqno <= high)
                .cloned(),
        );
        Ok(entries)
    }

    /// Hands a peer whose gap exceeds the live log's retention over to the
    /// catchup engine; normal replication is suppressed meanwhile.
    pub(super) fn start_catchup(&mut self, peer: Peer, from_seqno: Seqno) {
        let Some(session) = self.catchup.clone() else {
            return;
        };
        pf_info!(
            "handing peer {} to catchup from seqno {}",
            peer,
            from_seqno
        );
        self.statuses.set_catchup(&peer, true);
        self.hub.send_catchup(&peer, session, from_seqno);
    }

    /// Handler of a catchup hand-off result.
    pub(super) async fn handle_catchup_reply(
        &mut self,
        peer: Peer,
        result: Result<AppendAck, AgentError>,
    ) -> Result<(), StopReason> {
        match result {
            Ok(ack) => {
                if !self.statuses.is_tracked(&peer) {
                    return Ok(()); // dropped while catchup ran
                }
                pf_info!(
                    "peer {} caught up to seqno {}",
                    peer,
                    ack.high_seqno
                );
                self.statuses.set_catchup(&peer, false);
                self.statuses.set_sent(
                    &peer,
                    ack.high_seqno,
                    ack.committed_seqno,
                )?;
                self.statuses.set_acked(
                    &peer,
                    ack.high_seqno,
                    ack.committed_seqno,
                )?;
                self.derive_committed().await?;
                self.replicate().await
            }

            Err(err) => {
                if let Some(fatal) = self.common_error_fate(&err) {
                    return Err(fatal);
                }
                // forget the peer; the next check_peers tick re-probes it,
                // which bounds the retry rate
                pf_warn!("catchup of peer {} failed: {}", peer, err);
                self.statuses.remove(&peer);
                Ok(())
            }
        }
    }

    /// Periodic probe: re-monitor dead quorum peers and ask any live peer
    /// without a status entry for its position.
    pub(super) fn check_peers(&mut self) -> Result<(), StopReason> {
        for peer in self.peers.clone() {
            if !self.hub.is_live(&peer)
                && self.hub.monitor(peer.clone()).is_err()
            {
                continue; // still unresolvable
            }
            if !self.statuses.contacted(&peer) {
                pf_debug!("probing peer {}", peer);
                self.statuses.mark_requested(peer.clone());
                self.hub.send_ensure_term(
                    &peer,
                    EnsureCtx::Probe,
                    self.history_id.clone(),
                    self.term.clone(),
                );
            }
        }
        Ok(())
    }

    /// Handler of a probe response: first contact with a peer initializes
    /// its replication status.
    pub(super) async fn handle_probe_reply(
        &mut self,
        peer: Peer,
        result: Result<Metadata, AgentError>,
    ) -> Result<(), StopReason> {
        match result {
            Ok(meta) => {
                if self.statuses.is_tracked(&peer) {
                    return Ok(()); // duplicate probe answer
                }
                pf_debug!(
                    "peer {} at committed {} high {}",
                    peer,
                    meta.committed_seqno,
                    meta.high_seqno
                );
                self.statuses.init(peer, &self.term, &meta)?;
                self.replicate().await
            }

            Err(err) => {
                if let Some(fatal) = self.common_error_fate(&err) {
                    return Err(fatal);
                }
                pf_warn!("probe of peer {} failed: {}", peer, err);
                self.statuses.remove(&peer);
                Ok(())
            }
        }
    }
}
