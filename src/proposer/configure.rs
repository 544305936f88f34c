//! Proposer -- config reads, compare-and-swap transitions, postponement
//! while the config is uncommitted, and operator branch resolution.

use super::*;
use crate::log::LogValue;

impl Proposer {
    /// The quorum expression a cluster config demands, before translation
    /// and the mandatory local wrapper.
    pub(super) fn voters_quorum(cluster: &ClusterConfig) -> Quorum {
        match cluster {
            ClusterConfig::Stable(config) => {
                Quorum::Majority(config.voters.clone())
            }
            ClusterConfig::Transition { current, future } => {
                Quorum::joint_majorities(
                    current.voters.clone(),
                    future.voters.clone(),
                )
            }
        }
    }

    /// Whether `me` may vote at all under the given config.
    pub(super) fn election_member(
        cluster: &ClusterConfig,
        me: &Peer,
    ) -> bool {
        match cluster {
            ClusterConfig::Stable(config) => config.voters.contains(me),
            ClusterConfig::Transition { current, future } => {
                current.voters.contains(me) || future.voters.contains(me)
            }
        }
    }

    /// Handler of a config read. Postponed while the config in force is
    /// still uncommitted.
    pub(super) fn handle_get_config(
        &mut self,
        reply_to: oneshot::Sender<ConfigReply>,
    ) -> Result<(), StopReason> {
        if self.phase != Phase::Proposing {
            let _ = reply_to.send(ConfigReply::NotLeader);
            return Ok(());
        }
        if !self.config_committed {
            self.postponed_configs
                .push_back(ConfigRequest::Get { reply_to });
            return Ok(());
        }
        let _ = reply_to.send(ConfigReply::Ok {
            config: self.cluster.clone(),
            revision: self.config_revision.clone(),
        });
        Ok(())
    }

    /// Handler of a config compare-and-swap. Proposes a joint-consensus
    /// transition when the expected revision matches; the caller hears
    /// back only once the destination stable config commits.
    pub(super) async fn handle_cas_config(
        &mut self,
        reply_to: oneshot::Sender<ConfigReply>,
        new_config: Config,
        expected: Revision,
    ) -> Result<(), StopReason> {
        if self.phase != Phase::Proposing {
            let _ = reply_to.send(ConfigReply::NotLeader);
            return Ok(());
        }
        if !self.config_committed {
            self.postponed_configs.push_back(ConfigRequest::Cas {
                reply_to,
                new_config,
                expected,
            });
            return Ok(());
        }

        match &self.cluster {
            ClusterConfig::Stable(current)
                if expected == self.config_revision =>
            {
                pf_info!(
                    "config transition from revision seqno {}",
                    self.config_revision.seqno
                );
                let transition = ClusterConfig::Transition {
                    current: current.clone(),
                    future: new_config,
                };
                self.cas_waiter = Some(reply_to);
                self.propose_config(transition)?;
                self.replicate().await
            }
            _ => {
                let _ = reply_to.send(ConfigReply::CasFailed(
                    self.config_revision.clone(),
                ));
                Ok(())
            }
        }
    }

    /// Replays config requests held back behind an uncommitted config, in
    /// arrival order.
    pub(super) async fn replay_postponed_configs(
        &mut self,
    ) -> Result<(), StopReason> {
        let queued: Vec<ConfigRequest> =
            self.postponed_configs.drain(..).collect();
        for request in queued {
            match request {
                ConfigRequest::Get { reply_to } => {
                    self.handle_get_config(reply_to)?;
                }
                ConfigRequest::Cas {
                    reply_to,
                    new_config,
                    expected,
                } => {
                    self.handle_cas_config(reply_to, new_config, expected)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Stages a config entry at the next seqno and installs it as the
    /// effective config immediately: joint consensus takes effect at
    /// append time, not commit time.
    pub(super) fn propose_config(
        &mut self,
        cluster: ClusterConfig,
    ) -> Result<(), StopReason> {
        let seqno = self.high_seqno + 1;
        let entry = LogEntry {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            seqno,
            value: LogValue::Config(cluster.clone()),
        };
        let revision = entry.revision();
        pf_info!("proposing config entry at seqno {}", seqno);
        self.pending.push_back(entry);
        self.high_seqno = seqno;
        self.install_config(cluster, revision)
    }

    /// Makes the given config the effective one: refreshes the quorum and
    /// peer set, brings newly added peers into monitoring and probing, and
    /// lets outstanding read barriers reach them. Removal consequences
    /// (`being_removed`, peer cleanup) wait until the entry commits.
    fn install_config(
        &mut self,
        cluster: ClusterConfig,
        revision: Revision,
    ) -> Result<(), StopReason> {
        self.cluster = cluster;
        self.config_revision = revision;
        self.config_committed = false;

        let inner =
            quorum::translate(Self::voters_quorum(&self.cluster), &self.me);
        self.quorum = Quorum::require_local(inner);
        let old_peers = std::mem::replace(
            &mut self.peers,
            quorum::quorum_peers(&self.quorum),
        );

        let added: Vec<Peer> =
            self.peers.difference(&old_peers).cloned().collect();
        for peer in added {
            if self.hub.monitor(peer.clone()).is_err() {
                pf_warn!("new peer {} unreachable", peer);
                continue;
            }
            if !self.statuses.contacted(&peer) {
                self.statuses.mark_requested(peer.clone());
                self.hub.send_ensure_term(
                    &peer,
                    EnsureCtx::Probe,
                    self.history_id.clone(),
                    self.term.clone(),
                );
            }
            self.sync_fanout(&peer);
        }
        Ok(())
    }

    /// Resolves a pending operator branch on entry to proposing: only the
    /// committed prefix is safe to keep (the uncommitted tail may carry
    /// entries from the partitioned-away majority), and the voter set
    /// shrinks to the branch's survivors under the branch's history.
    pub(super) fn resolve_branch(
        &mut self,
        branch: Branch,
    ) -> Result<(), StopReason> {
        pf_warn!(
            "resolving branch {} by {} with {} survivors",
            branch.history_id,
            branch.coordinator,
            branch.peers.len()
        );

        self.pending
            .retain(|entry| entry.seqno <= self.committed_seqno);
        self.high_seqno = self.committed_seqno;
        self.history_id = branch.history_id;

        let state_machines = match &self.cluster {
            ClusterConfig::Stable(config) => config.state_machines.clone(),
            ClusterConfig::Transition { current, .. } => {
                current.state_machines.clone()
            }
        };
        self.propose_config(ClusterConfig::Stable(Config {
            voters: branch.peers,
            state_machines,
        }))
    }
}
