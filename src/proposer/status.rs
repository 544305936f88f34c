//! Per-peer replication bookkeeping owned by the proposer.

use std::collections::{HashMap, HashSet};

use crate::agent::Metadata;
use crate::log::{Peer, Seqno, Term};
use crate::utils::TillerError;

/// Replication status of one peer. Created on first successful contact,
/// destroyed on monitor-down or configuration removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PeerStatus {
    /// An unreplicated advance is required even if no new entries exist;
    /// set when the peer carries an uncommitted tail from an earlier term
    /// that a future append must truncate.
    pub needs_sync: bool,

    /// Highest seqno dispatched to the peer.
    pub sent_seqno: Seqno,

    /// Highest committed seqno dispatched to the peer.
    pub sent_commit_seqno: Seqno,

    /// Highest seqno the peer acknowledged.
    pub acked_seqno: Seqno,

    /// Highest committed seqno the peer acknowledged.
    pub acked_commit_seqno: Seqno,

    /// True while the peer is handed off to the catchup engine; normal
    /// replication is suppressed until the hand-off resolves.
    pub catchup_in_progress: bool,
}

/// Table of per-peer statuses, plus placeholders for peers that have been
/// probed but not yet answered (suppresses duplicate probes).
#[derive(Debug, Default)]
pub(crate) struct StatusTable {
    requested: HashSet<Peer>,
    tracked: HashMap<Peer, PeerStatus>,
}

impl StatusTable {
    pub(crate) fn new() -> Self {
        StatusTable {
            requested: HashSet::new(),
            tracked: HashMap::new(),
        }
    }

    /// True if the peer has been probed or is already tracked; used to
    /// suppress duplicate probes from `check_peers` ticks.
    pub(crate) fn contacted(&self, peer: &Peer) -> bool {
        self.requested.contains(peer) || self.tracked.contains_key(peer)
    }

    pub(crate) fn is_tracked(&self, peer: &Peer) -> bool {
        self.tracked.contains_key(peer)
    }

    /// Inserts a probe placeholder for the peer.
    pub(crate) fn mark_requested(&mut self, peer: Peer) {
        self.requested.insert(peer);
    }

    /// Initializes the peer's status from its metadata; called exactly once
    /// after the first successful response.
    ///
    /// If the peer's latest log append happened in our term, it shares our
    /// history and its positions are used directly. Otherwise the
    /// replication anchor is forced back to the peer's committed seqno: any
    /// uncommitted tail past it may diverge and must be truncated by a
    /// future append.
    pub(crate) fn init(
        &mut self,
        peer: Peer,
        our_term: &Term,
        meta: &Metadata,
    ) -> Result<(), TillerError> {
        if self.tracked.contains_key(&peer) {
            return logged_err!(
                "status for peer {} initialized twice",
                peer
            );
        }
        self.requested.remove(&peer);

        let status = if &meta.term_voted == our_term {
            PeerStatus {
                needs_sync: false,
                sent_seqno: meta.high_seqno,
                sent_commit_seqno: meta.committed_seqno,
                acked_seqno: meta.high_seqno,
                acked_commit_seqno: meta.committed_seqno,
                catchup_in_progress: false,
            }
        } else {
            PeerStatus {
                needs_sync: meta.high_seqno > meta.committed_seqno,
                sent_seqno: meta.committed_seqno,
                sent_commit_seqno: meta.committed_seqno,
                acked_seqno: meta.committed_seqno,
                acked_commit_seqno: meta.committed_seqno,
                catchup_in_progress: false,
            }
        };
        self.tracked.insert(peer, status);
        Ok(())
    }

    /// Records an optimistic dispatch up to `(high, commit)`. Clears
    /// `needs_sync`: the dispatched append carries the anchor that lets the
    /// peer truncate its divergent tail.
    pub(crate) fn set_sent(
        &mut self,
        peer: &Peer,
        high: Seqno,
        commit: Seqno,
    ) -> Result<(), TillerError> {
        let Some(status) = self.tracked.get_mut(peer) else {
            return logged_err!("set_sent for untracked peer {}", peer);
        };
        if high < status.acked_seqno || commit < status.acked_commit_seqno {
            return logged_err!(
                "set_sent({}, {}, {}) regresses behind acks ({}, {})",
                peer,
                high,
                commit,
                status.acked_seqno,
                status.acked_commit_seqno
            );
        }
        status.needs_sync = false;
        status.sent_seqno = high;
        status.sent_commit_seqno = commit;
        Ok(())
    }

    /// Records the peer's acknowledgement of `(high, commit)`. Acks are
    /// monotone and never overtake what was dispatched.
    pub(crate) fn set_acked(
        &mut self,
        peer: &Peer,
        high: Seqno,
        commit: Seqno,
    ) -> Result<(), TillerError> {
        let Some(status) = self.tracked.get_mut(peer) else {
            return logged_err!("set_acked for untracked peer {}", peer);
        };
        if high < status.acked_seqno || commit < status.acked_commit_seqno {
            return logged_err!(
                "set_acked({}, {}, {}) regresses behind acks ({}, {})",
                peer,
                high,
                commit,
                status.acked_seqno,
                status.acked_commit_seqno
            );
        }
        debug_assert!(high <= status.sent_seqno);
        debug_assert!(commit <= status.sent_commit_seqno);
        status.acked_seqno = high;
        status.acked_commit_seqno = commit;
        Ok(())
    }

    pub(crate) fn set_catchup(&mut self, peer: &Peer, in_progress: bool) {
        if let Some(status) = self.tracked.get_mut(peer) {
            status.catchup_in_progress = in_progress;
        }
    }

    /// Drops both the tracked status and any probe placeholder.
    pub(crate) fn remove(&mut self, peer: &Peer) {
        self.requested.remove(peer);
        self.tracked.remove(peer);
    }

    pub(crate) fn get(&self, peer: &Peer) -> Option<&PeerStatus> {
        self.tracked.get(peer)
    }

    /// Iterates over tracked peers and their statuses.
    pub(crate) fn iter(
        &self,
    ) -> impl Iterator<Item = (&Peer, &PeerStatus)> {
        self.tracked.iter()
    }
}
