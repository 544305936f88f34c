//! Joint quorum expressions and the pure predicates evaluated over them.
//!
//! A quorum is a recursive boolean expression over peer sets. The proposer
//! always evaluates against `Joint(All({Local}), …)` so that local
//! durability is mandatory, even while the local node is being removed.

use std::collections::BTreeSet;

use crate::log::Peer;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Recursive quorum expression. Nesting depth is bounded by transition
/// nesting (two joints in practice: the SELF wrapper plus one config
/// transition).
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum Quorum {
    /// Every peer in the set must ack.
    All(BTreeSet<Peer>),

    /// A strict majority of the set must ack.
    Majority(BTreeSet<Peer>),

    /// Both sub-quorums must hold.
    Joint(Box<Quorum>, Box<Quorum>),
}

impl Quorum {
    /// Wraps a quorum so that the local peer's ack is always required.
    pub fn require_local(inner: Quorum) -> Quorum {
        Quorum::Joint(
            Box::new(Quorum::All(BTreeSet::from([Peer::Local]))),
            Box::new(inner),
        )
    }

    /// Joint quorum over two voter sets, each by strict majority. This is
    /// the effective election/commit quorum while a config transition is in
    /// flight.
    pub fn joint_majorities(
        current: BTreeSet<Peer>,
        future: BTreeSet<Peer>,
    ) -> Quorum {
        Quorum::Joint(
            Box::new(Quorum::Majority(current)),
            Box::new(Quorum::Majority(future)),
        )
    }
}

/// True iff the given votes satisfy the quorum expression.
pub fn have_quorum(votes: &BTreeSet<Peer>, quorum: &Quorum) -> bool {
    match quorum {
        Quorum::All(peers) => peers.iter().all(|p| votes.contains(p)),
        Quorum::Majority(peers) => {
            let acked = peers.iter().filter(|p| votes.contains(*p)).count();
            2 * acked > peers.len()
        }
        Quorum::Joint(q1, q2) => {
            have_quorum(votes, q1) && have_quorum(votes, q2)
        }
    }
}

/// True iff, after removing `failed` from `peers`, some subset of the
/// remaining peers can still satisfy the quorum. Since all quorum variants
/// are monotone in the vote set, the best any subset can do is what the
/// full survivor set does.
pub fn is_feasible(
    peers: &BTreeSet<Peer>,
    failed: &BTreeSet<Peer>,
    quorum: &Quorum,
) -> bool {
    let remaining: BTreeSet<Peer> = peers.difference(failed).cloned().collect();
    have_quorum(&remaining, quorum)
}

/// Union of all peer sets appearing in the expression.
pub fn quorum_peers(quorum: &Quorum) -> BTreeSet<Peer> {
    match quorum {
        Quorum::All(peers) | Quorum::Majority(peers) => peers.clone(),
        Quorum::Joint(q1, q2) => {
            let mut peers = quorum_peers(q1);
            peers.append(&mut quorum_peers(q2));
            peers
        }
    }
}

/// Rewrites the concrete local peer id to `Peer::Local` everywhere in the
/// expression.
pub fn translate(quorum: Quorum, me: &Peer) -> Quorum {
    let translate_set = |peers: BTreeSet<Peer>| -> BTreeSet<Peer> {
        peers
            .into_iter()
            .map(|p| if &p == me { Peer::Local } else { p })
            .collect()
    };

    match quorum {
        Quorum::All(peers) => Quorum::All(translate_set(peers)),
        Quorum::Majority(peers) => Quorum::Majority(translate_set(peers)),
        Quorum::Joint(q1, q2) => Quorum::Joint(
            Box::new(translate(*q1, me)),
            Box::new(translate(*q2, me)),
        ),
    }
}
