//! Core identifier and log entry types shared by the proposer, the agent
//! interface, and the catchup subsystem.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use get_size::GetSize;

use serde::{Deserialize, Serialize};

/// Peer identity. `Local` is the distinguished alias for "this node",
/// substituted for the concrete local id wherever quorums are evaluated so
/// that local durability stays mandatory across renames and removals.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Serialize,
    Deserialize,
    GetSize,
)]
pub enum Peer {
    /// This node, regardless of its concrete name.
    Local,

    /// Any node addressed by its opaque concrete name.
    Named(String),
}

impl Peer {
    /// Shorthand constructor from anything string-like.
    pub fn named(name: impl Into<String>) -> Self {
        Peer::Named(name.into())
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Peer::Local => write!(f, "<self>"),
            Peer::Named(name) => write!(f, "{}", name),
        }
    }
}

/// Opaque token identifying a lineage of committed state. Changes only when
/// an operator branch is resolved.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct HistoryId(pub String);

impl fmt::Display for HistoryId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Leadership term: `(number, tiebreaker)`, totally ordered by number then
/// tiebreaker. A proposer owns exactly one term for its lifetime.
#[derive(
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Clone,
    Serialize,
    Deserialize,
    GetSize,
)]
pub struct Term {
    pub number: u64,
    pub tiebreaker: Peer,
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({},{})", self.number, self.tiebreaker)
    }
}

/// Monotonic log position within a history, starting at 1.
pub type Seqno = u64;

/// Sentinel meaning "no entry".
pub const NO_SEQNO: Seqno = 0;

/// `(history, term, seqno)` triple uniquely identifying a log entry.
#[derive(
    Debug, PartialEq, Eq, Hash, Clone, Serialize, Deserialize, GetSize,
)]
pub struct Revision {
    pub history_id: HistoryId,
    pub term: Term,
    pub seqno: Seqno,
}

/// Opaque descriptor of a named replicated state machine, carried inside
/// configs and handed to whatever applies committed commands downstream.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize, Default,
)]
pub struct RsmSpec {
    /// Implementation module name.
    pub module: String,

    /// Opaque construction arguments.
    pub args: Vec<u8>,
}

/// A stable cluster configuration: the voter set plus the registry of named
/// state machines commands may be routed to.
#[derive(
    Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize, Default,
)]
pub struct Config {
    pub voters: BTreeSet<Peer>,
    pub state_machines: BTreeMap<String, RsmSpec>,
}

impl Config {
    /// Config with the given voters and no registered state machines.
    pub fn with_voters(voters: impl IntoIterator<Item = Peer>) -> Self {
        Config {
            voters: voters.into_iter().collect(),
            state_machines: BTreeMap::new(),
        }
    }
}

/// A cluster configuration as it appears in the log and in agent metadata:
/// either stable, or a joint-consensus transition between two stable ones.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum ClusterConfig {
    Stable(Config),

    Transition { current: Config, future: Config },
}

impl ClusterConfig {
    /// The voter set that decides whether this node is being removed: the
    /// destination config's voters while a transition is in flight.
    pub fn settled_voters(&self) -> &BTreeSet<Peer> {
        match self {
            ClusterConfig::Stable(config) => &config.voters,
            ClusterConfig::Transition { future, .. } => &future.voters,
        }
    }

    /// Names of state machines commands may target under this config. A
    /// command valid under either side of a transition is admissible.
    pub fn known_rsms(&self) -> BTreeSet<&str> {
        match self {
            ClusterConfig::Stable(config) => {
                config.state_machines.keys().map(String::as_str).collect()
            }
            ClusterConfig::Transition { current, future } => current
                .state_machines
                .keys()
                .chain(future.state_machines.keys())
                .map(String::as_str)
                .collect(),
        }
    }
}

/// Payload of one log entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub enum LogValue {
    /// Opaque command routed to a named state machine.
    Command { rsm: String, payload: Vec<u8> },

    /// Cluster configuration (stable or in transition).
    Config(ClusterConfig),
}

/// One immutable log entry. Seqnos are contiguous starting at the log's low
/// seqno; within a term, entries are never overwritten; an uncommitted
/// suffix may be truncated only when a higher term establishes.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize, GetSize)]
pub struct LogEntry {
    pub history_id: HistoryId,
    pub term: Term,
    pub seqno: Seqno,
    pub value: LogValue,
}

impl LogEntry {
    /// The `(history, term, seqno)` identity of this entry.
    pub fn revision(&self) -> Revision {
        Revision {
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            seqno: self.seqno,
        }
    }
}

#[cfg(test)]
mod log_tests {
    use super::*;

    #[test]
    fn term_ordering() {
        let t1 = Term {
            number: 1,
            tiebreaker: Peer::named("b"),
        };
        let t2 = Term {
            number: 2,
            tiebreaker: Peer::named("a"),
        };
        // number dominates tiebreaker
        assert!(t1 < t2);

        let t3 = Term {
            number: 2,
            tiebreaker: Peer::named("b"),
        };
        assert!(t2 < t3);
        assert_eq!(t3, t3.clone());
    }

    #[test]
    fn settled_voters_of_transition() {
        let current = Config::with_voters([Peer::named("a"), Peer::named("b")]);
        let future = Config::with_voters([Peer::named("b"), Peer::named("c")]);
        let config = ClusterConfig::Transition {
            current,
            future: future.clone(),
        };
        assert_eq!(config.settled_voters(), &future.voters);
    }

    #[test]
    fn known_rsms_unions_transition_sides() {
        let mut current = Config::with_voters([Peer::named("a")]);
        current
            .state_machines
            .insert("kv".into(), RsmSpec::default());
        let mut future = Config::with_voters([Peer::named("a")]);
        future
            .state_machines
            .insert("locks".into(), RsmSpec::default());

        let config = ClusterConfig::Transition { current, future };
        let known = config.known_rsms();
        assert!(known.contains("kv"));
        assert!(known.contains("locks"));
    }

    #[test]
    fn entry_wire_roundtrip() -> Result<(), crate::utils::TillerError> {
        let entry = LogEntry {
            history_id: HistoryId("h0".into()),
            term: Term {
                number: 3,
                tiebreaker: Peer::named("a"),
            },
            seqno: 42,
            value: LogValue::Command {
                rsm: "kv".into(),
                payload: b"put k v".to_vec(),
            },
        };
        let bytes = rmp_serde::encode::to_vec(&entry)?;
        let back: LogEntry = rmp_serde::decode::from_slice(&bytes)?;
        assert_eq!(back, entry);
        Ok(())
    }
}
