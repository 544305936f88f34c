//! Shared test helpers: an in-memory agent cluster the proposer runs
//! against, a directory resolving peers to those agents, and a catchup
//! engine that "transfers" by copying the leader agent's state wholesale.
//! Each test builds its own isolated cluster; partitions and crashes are
//! simulated per agent.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tiller::{
    Agent, AgentDirectory, AgentError, AppendAck, Branch, CatchupEngine,
    CatchupSession, ClusterConfig, CommandReply, Config, ConfigReply,
    HistoryId, LocalAgent, LogEntry, LogValue, Metadata, Peer, Position,
    Proposer, ProposerHandle, Revision, RsmCommand, RsmSpec, Seqno,
    StopReason, SyncReply, Term, TillerError,
};

use async_trait::async_trait;

use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};

/// Proposer tunables used by every scenario: fast re-probing so partition
/// healing resolves within test timeouts.
pub const TEST_CONFIG: &str = "check_peers_interval_ms = 100";

pub fn term(number: u64, tiebreaker: &str) -> Term {
    Term {
        number,
        tiebreaker: Peer::named(tiebreaker),
    }
}

/// The pre-history term agents start out with.
pub fn genesis_term() -> Term {
    term(0, "genesis")
}

pub fn history(id: &str) -> HistoryId {
    HistoryId(id.into())
}

/// A config whose voters are the given peers, with a "kv" state machine
/// registered so commands have somewhere to go.
pub fn kv_config(voters: &[&str]) -> Config {
    let mut config = Config::with_voters(
        voters.iter().map(|name| Peer::named(*name)),
    );
    config.state_machines.insert(
        "kv".into(),
        RsmSpec {
            module: "kv_hashmap".into(),
            args: Vec::new(),
        },
    );
    config
}

pub fn command_entry(
    history_id: &HistoryId,
    entry_term: &Term,
    seqno: Seqno,
    payload: &[u8],
) -> LogEntry {
    LogEntry {
        history_id: history_id.clone(),
        term: entry_term.clone(),
        seqno,
        value: LogValue::Command {
            rsm: "kv".into(),
            payload: payload.to_vec(),
        },
    }
}

/// Mutable core of one in-memory agent.
struct AgentState {
    history_id: HistoryId,
    term: Term,
    term_voted: Term,
    log: Vec<LogEntry>,
    low_seqno: Seqno,
    committed_seqno: Seqno,
    config: ClusterConfig,
    config_revision: Revision,
    pending_branch: Option<Branch>,
}

impl AgentState {
    fn high_seqno(&self) -> Seqno {
        self.low_seqno + self.log.len() as Seqno - 1
    }

    fn metadata(&self, name: &Peer) -> Metadata {
        Metadata {
            peer: name.clone(),
            history_id: self.history_id.clone(),
            term: self.term.clone(),
            term_voted: self.term_voted.clone(),
            high_seqno: self.high_seqno(),
            committed_seqno: self.committed_seqno,
            config: self.config.clone(),
            config_revision: self.config_revision.clone(),
            pending_branch: self.pending_branch.clone(),
        }
    }

    /// Adopts the request's history if a matching pending branch allows it;
    /// errors if the histories genuinely diverge.
    fn check_history(
        &mut self,
        requested: &HistoryId,
    ) -> Result<(), AgentError> {
        if *requested == self.history_id {
            return Ok(());
        }
        match &self.pending_branch {
            Some(branch) if branch.history_id == *requested => {
                self.history_id = requested.clone();
                self.pending_branch = None;
                Ok(())
            }
            _ => Err(AgentError::HistoryMismatch),
        }
    }
}

/// One in-memory agent: log storage and term persistence for a single
/// cluster node, reachable over "the network" unless partitioned or dead.
pub struct MockAgent {
    pub name: Peer,
    state: Mutex<AgentState>,
    reachable: AtomicBool,
    down_tx: watch::Sender<bool>,
}

impl MockAgent {
    pub fn new(name: &str, config: Config) -> Arc<MockAgent> {
        let (down_tx, _) = watch::channel(false);
        Arc::new(MockAgent {
            name: Peer::named(name),
            state: Mutex::new(AgentState {
                history_id: history("h0"),
                term: genesis_term(),
                term_voted: genesis_term(),
                log: Vec::new(),
                low_seqno: 1,
                committed_seqno: 0,
                config: ClusterConfig::Stable(config),
                config_revision: Revision {
                    history_id: history("h0"),
                    term: genesis_term(),
                    seqno: 0,
                },
                pending_branch: None,
            }),
            reachable: AtomicBool::new(true),
            down_tx,
        })
    }

    /// Replaces the log with the given contiguous entries starting at 1.
    pub fn seed_log(
        &self,
        entries: Vec<LogEntry>,
        committed: Seqno,
        term_voted: Term,
    ) {
        let mut state = self.state.lock().unwrap();
        state.log = entries;
        state.low_seqno = 1;
        state.committed_seqno = committed;
        state.term_voted = term_voted.clone();
        state.term = term_voted;
    }

    pub fn set_pending_branch(&self, branch: Branch) {
        self.state.lock().unwrap().pending_branch = Some(branch);
    }

    /// Simulates a competing candidate having established this term here.
    pub fn set_term(&self, new_term: Term) {
        self.state.lock().unwrap().term = new_term;
    }

    /// Drops retained entries below `low`, as if snapshotted + truncated.
    pub fn compact_to(&self, low: Seqno) {
        let mut state = self.state.lock().unwrap();
        assert!(low <= state.committed_seqno + 1);
        let drop = (low - state.low_seqno) as usize;
        state.log.drain(..drop);
        state.low_seqno = low;
    }

    /// Cuts (or heals) the agent's network without killing its process.
    pub fn partition(&self, cut: bool) {
        self.reachable.store(!cut, Ordering::SeqCst);
    }

    /// Crashes the agent: unreachable, and monitors fire.
    pub fn kill(&self) {
        self.reachable.store(false, Ordering::SeqCst);
        let _ = self.down_tx.send(true);
    }

    pub fn revive(&self) {
        self.reachable.store(true, Ordering::SeqCst);
        let _ = self.down_tx.send(false);
    }

    pub fn committed_seqno(&self) -> Seqno {
        self.state.lock().unwrap().committed_seqno
    }

    pub fn high_seqno(&self) -> Seqno {
        self.state.lock().unwrap().high_seqno()
    }

    pub fn history_id(&self) -> HistoryId {
        self.state.lock().unwrap().history_id.clone()
    }

    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().unwrap().log.clone()
    }

    pub fn entry_at(&self, seqno: Seqno) -> Option<LogEntry> {
        let state = self.state.lock().unwrap();
        if seqno < state.low_seqno || seqno > state.high_seqno() {
            return None;
        }
        Some(state.log[(seqno - state.low_seqno) as usize].clone())
    }

    pub fn stored_config(&self) -> (ClusterConfig, Revision) {
        let state = self.state.lock().unwrap();
        (state.config.clone(), state.config_revision.clone())
    }

    fn reach(&self) -> Result<(), AgentError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AgentError::Unreachable)
        }
    }

    /// Full-state overwrite used by the mock catchup engine, standing in
    /// for snapshot + prefix transfer.
    fn install_from(
        &self,
        source: &MockAgent,
        under_term: &Term,
    ) -> Result<AppendAck, AgentError> {
        self.reach()?;
        let copied = {
            let src = source.state.lock().unwrap();
            (
                src.history_id.clone(),
                src.log.clone(),
                src.low_seqno,
                src.committed_seqno,
                src.config.clone(),
                src.config_revision.clone(),
            )
        };
        let mut state = self.state.lock().unwrap();
        state.history_id = copied.0;
        state.log = copied.1;
        state.low_seqno = copied.2;
        state.committed_seqno = copied.3;
        state.config = copied.4;
        state.config_revision = copied.5;
        state.term = under_term.clone();
        state.term_voted = under_term.clone();
        state.pending_branch = None;
        Ok(AppendAck {
            high_seqno: state.high_seqno(),
            committed_seqno: state.committed_seqno,
        })
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn establish_term(
        &self,
        history_id: HistoryId,
        new_term: Term,
        position: Position,
    ) -> Result<Metadata, AgentError> {
        self.reach()?;
        let mut state = self.state.lock().unwrap();
        state.check_history(&history_id)?;
        if new_term <= state.term {
            return Err(AgentError::ConflictingTerm(state.term.clone()));
        }
        if position.high_seqno < state.committed_seqno {
            return Err(AgentError::Behind);
        }
        state.term = new_term;
        Ok(state.metadata(&self.name))
    }

    async fn ensure_term(
        &self,
        history_id: HistoryId,
        req_term: Term,
    ) -> Result<Metadata, AgentError> {
        self.reach()?;
        let mut state = self.state.lock().unwrap();
        state.check_history(&history_id)?;
        if req_term < state.term {
            return Err(AgentError::ConflictingTerm(state.term.clone()));
        }
        state.term = req_term;
        Ok(state.metadata(&self.name))
    }

    async fn append(
        &self,
        history_id: HistoryId,
        req_term: Term,
        committed_seqno: Seqno,
        prev_seqno: Seqno,
        entries: Vec<LogEntry>,
    ) -> Result<AppendAck, AgentError> {
        self.reach()?;
        let mut state = self.state.lock().unwrap();
        if req_term < state.term {
            return Err(AgentError::ConflictingTerm(state.term.clone()));
        }
        state.term = req_term.clone();
        state.check_history(&history_id)?;

        if prev_seqno < state.committed_seqno {
            return Err(AgentError::Other(
                "append anchored below committed prefix".into(),
            ));
        }
        if prev_seqno > state.high_seqno() {
            return Err(AgentError::Other("gap in append".into()));
        }

        // anchor semantics: everything past the anchor is the leader's to
        // dictate
        let keep = (prev_seqno + 1 - state.low_seqno) as usize;
        state.log.truncate(keep);
        for entry in entries {
            assert_eq!(entry.seqno, state.high_seqno() + 1);
            if let LogValue::Config(config) = &entry.value {
                state.config = config.clone();
                state.config_revision = entry.revision();
            }
            state.log.push(entry);
        }
        state.term_voted = req_term;

        let high = state.high_seqno();
        state.committed_seqno =
            state.committed_seqno.max(committed_seqno.min(high));
        Ok(AppendAck {
            high_seqno: high,
            committed_seqno: state.committed_seqno,
        })
    }

    async fn get_log(
        &self,
        _history_id: HistoryId,
        _req_term: Term,
        low: Seqno,
        high: Seqno,
    ) -> Result<Vec<LogEntry>, AgentError> {
        let state = self.state.lock().unwrap();
        if low < state.low_seqno {
            return Err(AgentError::Compacted);
        }
        let high = high.min(state.high_seqno());
        if low > high {
            return Ok(Vec::new());
        }
        let from = (low - state.low_seqno) as usize;
        let to = (high - state.low_seqno) as usize;
        Ok(state.log[from..=to].to_vec())
    }

    async fn mark_committed(
        &self,
        _history_id: HistoryId,
        _req_term: Term,
        seqno: Seqno,
    ) -> Result<(), AgentError> {
        let mut state = self.state.lock().unwrap();
        let high = state.high_seqno();
        state.committed_seqno = state.committed_seqno.max(seqno.min(high));
        Ok(())
    }

    async fn down(&self) {
        let mut rx = self.down_tx.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[async_trait]
impl LocalAgent for MockAgent {
    async fn establish_local_term(
        &self,
        new_term: Term,
    ) -> Result<Metadata, AgentError> {
        let mut state = self.state.lock().unwrap();
        if new_term <= state.term {
            return Err(AgentError::ConflictingTerm(state.term.clone()));
        }
        state.term = new_term;
        Ok(state.metadata(&self.name))
    }
}

/// Resolves peers to the cluster's in-memory agents; `Local` resolves to
/// the owning node's own agent.
pub struct MockDirectory {
    me: Peer,
    agents: HashMap<Peer, Arc<MockAgent>>,
}

impl AgentDirectory for MockDirectory {
    fn agent(&self, peer: &Peer) -> Option<Arc<dyn Agent>> {
        let key = if *peer == Peer::Local { &self.me } else { peer };
        self.agents.get(key).map(|a| a.clone() as Arc<dyn Agent>)
    }
}

/// Catchup engine whose sessions copy the source agent's entire state into
/// the target, standing in for snapshot + prefix transfer.
pub struct MockCatchup {
    source: Arc<MockAgent>,
    agents: HashMap<Peer, Arc<MockAgent>>,
    pub sessions_started: Arc<AtomicU64>,
}

#[async_trait]
impl CatchupEngine for MockCatchup {
    async fn start(
        &self,
        _history_id: HistoryId,
        session_term: Term,
    ) -> Result<Arc<dyn CatchupSession>, TillerError> {
        self.sessions_started.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockCatchupSession {
            source: self.source.clone(),
            agents: self.agents.clone(),
            session_term,
        }))
    }
}

pub struct MockCatchupSession {
    source: Arc<MockAgent>,
    agents: HashMap<Peer, Arc<MockAgent>>,
    session_term: Term,
}

#[async_trait]
impl CatchupSession for MockCatchupSession {
    async fn catchup_peer(
        &self,
        peer: Peer,
        _from_seqno: Seqno,
    ) -> Result<AppendAck, AgentError> {
        let Some(target) = self.agents.get(&peer) else {
            return Err(AgentError::Unreachable);
        };
        target.install_from(&self.source, &self.session_term)
    }

    async fn cancel(&self, _peer: Peer) {}

    async fn stop(&self) {}
}

/// One whole in-memory cluster.
pub struct TestCluster {
    pub agents: HashMap<Peer, Arc<MockAgent>>,
}

impl TestCluster {
    /// Builds agents for `names`, every one seeded with the same config.
    pub fn new(names: &[&str], config: Config) -> Self {
        let agents = names
            .iter()
            .map(|name| {
                (Peer::named(*name), MockAgent::new(name, config.clone()))
            })
            .collect();
        TestCluster { agents }
    }

    pub fn agent(&self, name: &str) -> &Arc<MockAgent> {
        self.agents.get(&Peer::named(name)).expect("unknown agent")
    }

    /// Spawns a proposer for `name` at `new_term` and runs it to completion
    /// on a background task.
    pub async fn spawn_proposer(
        &self,
        name: &str,
        new_term: Term,
    ) -> (ProposerHandle, JoinHandle<StopReason>) {
        let local = self.agent(name).clone();
        let directory = Arc::new(MockDirectory {
            me: Peer::named(name),
            agents: self.agents.clone(),
        });
        let catchup = Arc::new(MockCatchup {
            source: local.clone(),
            agents: self.agents.clone(),
            sessions_started: Arc::new(AtomicU64::new(0)),
        });

        let (mut proposer, handle) = Proposer::new_and_setup(
            Peer::named(name),
            new_term,
            local,
            directory,
            catchup,
            Some(TEST_CONFIG),
        )
        .await
        .expect("proposer setup");

        let runner = tokio::spawn(async move { proposer.run().await });
        (handle, runner)
    }
}

/// Polls `cond` until it holds or the deadline passes.
pub async fn eventually(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {}", what);
}

/// Waits until the proposer reports ready.
pub async fn wait_ready(handle: &ProposerHandle) {
    let mut ready = handle.ready();
    time::timeout(Duration::from_secs(3), ready.wait_for(|r| *r))
        .await
        .expect("proposer not ready in time")
        .expect("proposer died before ready");
}

pub async fn submit_command(
    handle: &ProposerHandle,
    payload: &[u8],
) -> CommandReply {
    submit_command_to(handle, "kv", payload).await
}

pub async fn submit_command_to(
    handle: &ProposerHandle,
    rsm: &str,
    payload: &[u8],
) -> CommandReply {
    let (tx, rx) = oneshot::channel();
    handle
        .append_commands(vec![(
            tx,
            RsmCommand {
                rsm: rsm.into(),
                payload: payload.to_vec(),
            },
        )])
        .expect("proposer gone");
    rx.await.expect("command reply dropped")
}

pub async fn sync_quorum(handle: &ProposerHandle) -> SyncReply {
    let (tx, rx) = oneshot::channel();
    handle.sync_quorum(tx).expect("proposer gone");
    rx.await.expect("sync reply dropped")
}

pub async fn get_config(handle: &ProposerHandle) -> ConfigReply {
    let (tx, rx) = oneshot::channel();
    handle.get_config(tx).expect("proposer gone");
    rx.await.expect("config reply dropped")
}

/// A background watcher asserting an agent's committed seqno never goes
/// backwards (commit monotonicity).
pub struct CommitMonitor {
    violated: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CommitMonitor {
    pub fn watch(agent: Arc<MockAgent>) -> Self {
        let violated = Arc::new(AtomicBool::new(false));
        let violated_ref = violated.clone();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut last = agent.committed_seqno();
            while !*stop_rx.borrow() {
                let now = agent.committed_seqno();
                if now < last {
                    violated_ref.store(true, Ordering::SeqCst);
                    return;
                }
                last = now;
                tokio::select! {
                    _ = stop_rx.changed() => {}
                    _ = time::sleep(Duration::from_millis(5)) => {}
                }
            }
        });
        CommitMonitor {
            violated,
            stop_tx,
            task,
        }
    }

    pub async fn finish(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
        assert!(
            !self.violated.load(Ordering::SeqCst),
            "committed seqno regressed"
        );
    }
}
