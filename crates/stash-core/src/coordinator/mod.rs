//! Cross-instance coordinator
//!
//! Several app instances (tabs, windows, processes) may share one
//! local database. Only one of them per workspace may drain the queue
//! and poll the remote service, or operations would double-submit.
//! Instances announce themselves on a broadcast bus; the one with the
//! lowest (claim timestamp, tab id) pair among live peers is leader.
//! A follower can take control by claiming an earlier slot, which the
//! incumbent observes on the next message and steps down.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{now_ms, WorkspaceId};

/// Identity of one app instance on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TabId(String);

impl TabId {
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TabId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message kinds exchanged between instances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabMessageKind {
    /// Periodic liveness announcement, carrying the sender's claim
    Heartbeat,
    /// The sender wants (or re-asserts) leadership
    Claim,
    /// The sender gave up its claim
    Release,
}

/// One broadcast-bus message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabMessage {
    pub kind: TabMessageKind,
    pub workspace: WorkspaceId,
    pub tab: TabId,
    /// The sender's claim slot (Unix ms); lower wins
    pub claimed_at: i64,
    /// When the message was sent (Unix ms)
    pub sent_at: i64,
}

/// Transport between app instances.
///
/// In the browser original this is a `BroadcastChannel`; here any
/// at-least-once broadcast works (in-process channel, local socket,
/// OS IPC).
pub trait BroadcastBus: Send + Sync {
    fn publish(&self, message: &TabMessage) -> Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<TabMessage>;
}

/// Bus for instances inside one process, e.g. multiple windows of a
/// desktop app or the test suite
pub struct InProcessBus {
    tx: broadcast::Sender<TabMessage>,
}

impl InProcessBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BroadcastBus for InProcessBus {
    fn publish(&self, message: &TabMessage) -> Result<()> {
        // No subscribers is fine; a lone instance is its own leader
        let _ = self.tx.send(message.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TabMessage> {
        self.tx.subscribe()
    }
}

/// Leadership transition for one workspace, as seen by this instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeadershipChange {
    pub workspace: WorkspaceId,
    pub is_leader: bool,
}

#[derive(Debug, Clone)]
struct Peer {
    claimed_at: i64,
    last_seen: i64,
}

#[derive(Debug, Default)]
struct WorkspaceElection {
    /// Our claim slot, present while we participate
    own_claim: Option<i64>,
    /// Was this instance leader at the last evaluation
    was_leader: bool,
    peers: HashMap<TabId, Peer>,
}

impl WorkspaceElection {
    /// Lowest (claimed_at, tab) among us and live peers wins
    fn leader_is(&self, own_tab: &TabId) -> bool {
        let Some(own_claim) = self.own_claim else {
            return false;
        };
        self.peers
            .iter()
            .all(|(tab, peer)| (own_claim, own_tab) <= (peer.claimed_at, tab))
    }

    fn prune(&mut self, cutoff: i64) {
        self.peers.retain(|_, peer| peer.last_seen >= cutoff);
    }

    fn lowest_known_claim(&self) -> Option<i64> {
        self.peers
            .values()
            .map(|peer| peer.claimed_at)
            .chain(self.own_claim)
            .min()
    }
}

/// Elects one sync leader per workspace among instances on a bus
pub struct TabCoordinator {
    tab: TabId,
    bus: Arc<dyn BroadcastBus>,
    heartbeat_interval: Duration,
    /// A peer silent for longer than this is considered gone
    heartbeat_timeout: Duration,
    elections: Mutex<HashMap<WorkspaceId, WorkspaceElection>>,
    changes: broadcast::Sender<LeadershipChange>,
}

impl TabCoordinator {
    pub fn new(tab: TabId, bus: Arc<dyn BroadcastBus>) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            tab,
            bus,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            elections: Mutex::new(HashMap::new()),
            changes,
        }
    }

    #[must_use]
    pub fn with_heartbeat(mut self, interval: Duration, timeout: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn tab(&self) -> &TabId {
        &self.tab
    }

    /// Subscribe to this instance's leadership transitions
    pub fn subscribe(&self) -> broadcast::Receiver<LeadershipChange> {
        self.changes.subscribe()
    }

    /// Whether this instance currently leads the workspace
    pub fn is_leader(&self, workspace: &WorkspaceId) -> bool {
        self.elections
            .lock()
            .unwrap()
            .get(workspace)
            .is_some_and(|election| election.own_claim.is_some() && election.was_leader)
    }

    /// Enter the election for a workspace. Returns whether leadership
    /// was granted immediately (no live peer holds an earlier claim;
    /// a claim from a peer we have not heard of yet can still displace
    /// us when its message arrives).
    pub fn claim(&self, workspace: &WorkspaceId) -> Result<bool> {
        let now = now_ms();
        let claimed_at = {
            let mut elections = self.elections.lock().unwrap();
            let election = elections.entry(workspace.clone()).or_default();
            *election.own_claim.get_or_insert(now)
        };
        self.bus.publish(&TabMessage {
            kind: TabMessageKind::Claim,
            workspace: workspace.clone(),
            tab: self.tab.clone(),
            claimed_at,
            sent_at: now,
        })?;
        Ok(self.evaluate(workspace, now))
    }

    /// Leave the election and notify peers
    pub fn release(&self, workspace: &WorkspaceId) -> Result<()> {
        let now = now_ms();
        {
            let mut elections = self.elections.lock().unwrap();
            if let Some(election) = elections.get_mut(workspace) {
                election.own_claim = None;
            }
        }
        self.bus.publish(&TabMessage {
            kind: TabMessageKind::Release,
            workspace: workspace.clone(),
            tab: self.tab.clone(),
            claimed_at: 0,
            sent_at: now,
        })?;
        self.evaluate(workspace, now);
        Ok(())
    }

    /// Forcibly request leadership by claiming a slot earlier than any
    /// known claim. The incumbent sees the new claim and steps down at
    /// its next evaluation.
    pub fn take_control(&self, workspace: &WorkspaceId) -> Result<bool> {
        let now = now_ms();
        let claimed_at = {
            let mut elections = self.elections.lock().unwrap();
            let election = elections.entry(workspace.clone()).or_default();
            let slot = election.lowest_known_claim().map_or(now, |low| low - 1);
            election.own_claim = Some(slot);
            slot
        };
        self.bus.publish(&TabMessage {
            kind: TabMessageKind::Claim,
            workspace: workspace.clone(),
            tab: self.tab.clone(),
            claimed_at,
            sent_at: now,
        })?;
        Ok(self.evaluate(workspace, now))
    }

    /// Apply one bus message to the election state
    pub fn handle_message(&self, message: &TabMessage, now: i64) {
        if message.tab == self.tab {
            return;
        }
        {
            let mut elections = self.elections.lock().unwrap();
            let election = elections.entry(message.workspace.clone()).or_default();
            match message.kind {
                TabMessageKind::Heartbeat | TabMessageKind::Claim => {
                    election.peers.insert(
                        message.tab.clone(),
                        Peer {
                            claimed_at: message.claimed_at,
                            last_seen: now,
                        },
                    );
                }
                TabMessageKind::Release => {
                    election.peers.remove(&message.tab);
                }
            }
        }
        self.evaluate(&message.workspace, now);
    }

    /// Periodic work: heartbeat our claims, expire silent peers
    pub fn tick(&self, now: i64) -> Result<()> {
        let cutoff = now.saturating_sub(i64::try_from(self.heartbeat_timeout.as_millis()).unwrap_or(i64::MAX));
        let claims: Vec<(WorkspaceId, i64)> = {
            let mut elections = self.elections.lock().unwrap();
            for election in elections.values_mut() {
                election.prune(cutoff);
            }
            elections
                .iter()
                .filter_map(|(workspace, election)| {
                    election.own_claim.map(|claim| (workspace.clone(), claim))
                })
                .collect()
        };

        for (workspace, claimed_at) in claims {
            self.bus.publish(&TabMessage {
                kind: TabMessageKind::Heartbeat,
                workspace: workspace.clone(),
                tab: self.tab.clone(),
                claimed_at,
                sent_at: now,
            })?;
            self.evaluate(&workspace, now);
        }

        // Workspaces we follow without claiming still need peer expiry
        // to be observed
        let followed: Vec<WorkspaceId> = {
            let elections = self.elections.lock().unwrap();
            elections
                .iter()
                .filter(|(_, election)| election.own_claim.is_none())
                .map(|(workspace, _)| workspace.clone())
                .collect()
        };
        for workspace in followed {
            self.evaluate(&workspace, now);
        }
        Ok(())
    }

    /// Recompute leadership; emit a change notification on a flip
    fn evaluate(&self, workspace: &WorkspaceId, _now: i64) -> bool {
        let (is_leader, flipped) = {
            let mut elections = self.elections.lock().unwrap();
            let election = elections.entry(workspace.clone()).or_default();
            let is_leader = election.leader_is(&self.tab);
            let flipped = is_leader != election.was_leader;
            election.was_leader = is_leader;
            (is_leader, flipped)
        };
        if flipped {
            tracing::info!(workspace = %workspace, tab = %self.tab, is_leader, "leadership changed");
            let _ = self.changes.send(LeadershipChange {
                workspace: workspace.clone(),
                is_leader,
            });
        }
        is_leader
    }

    /// Drive the coordinator: apply bus messages as they arrive and
    /// heartbeat on the configured interval. Runs until the task is
    /// dropped or aborted.
    pub async fn run(self: Arc<Self>) {
        let mut messages = self.bus.subscribe();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                message = messages.recv() => match message {
                    Ok(message) => self.handle_message(&message, now_ms()),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Heartbeats are periodic; state catches up
                        tracing::warn!(skipped, "coordinator lagged behind the bus");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = heartbeat.tick() => {
                    if let Err(error) = self.tick(now_ms()) {
                        tracing::warn!(%error, "coordinator heartbeat failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn workspace() -> WorkspaceId {
        WorkspaceId::from("ws-1")
    }

    /// Two coordinators sharing one in-process bus, with manual
    /// message delivery for deterministic ordering
    struct Pair {
        a: TabCoordinator,
        b: TabCoordinator,
        a_rx: broadcast::Receiver<TabMessage>,
        b_rx: broadcast::Receiver<TabMessage>,
    }

    fn pair() -> Pair {
        let bus: Arc<dyn BroadcastBus> = Arc::new(InProcessBus::new());
        let a_rx = bus.subscribe();
        let b_rx = bus.subscribe();
        Pair {
            a: TabCoordinator::new(TabId::new("tab-a"), Arc::clone(&bus)),
            b: TabCoordinator::new(TabId::new("tab-b"), Arc::clone(&bus)),
            a_rx,
            b_rx,
        }
    }

    impl Pair {
        /// Deliver everything published so far to both coordinators
        fn exchange(&mut self, now: i64) {
            while let Ok(message) = self.a_rx.try_recv() {
                self.a.handle_message(&message, now);
            }
            while let Ok(message) = self.b_rx.try_recv() {
                self.b.handle_message(&message, now);
            }
        }

        fn assert_single_leader(&self) {
            assert!(
                !(self.a.is_leader(&workspace()) && self.b.is_leader(&workspace())),
                "two instances both claim leadership"
            );
        }
    }

    #[test]
    fn test_lone_claim_is_granted() {
        let p = pair();
        assert!(p.a.claim(&workspace()).unwrap());
        assert!(p.a.is_leader(&workspace()));
    }

    #[test]
    fn test_second_claim_defers_to_earlier_one() {
        let mut p = pair();
        assert!(p.a.claim(&workspace()).unwrap());
        p.exchange(now_ms());

        // b claims after a; a's earlier slot wins
        let granted = p.b.claim(&workspace()).unwrap();
        p.exchange(now_ms());

        assert!(!granted);
        assert!(p.a.is_leader(&workspace()));
        assert!(!p.b.is_leader(&workspace()));
        p.assert_single_leader();
    }

    #[test]
    fn test_release_hands_leadership_over() {
        let mut p = pair();
        p.a.claim(&workspace()).unwrap();
        p.exchange(now_ms());
        p.b.claim(&workspace()).unwrap();
        p.exchange(now_ms());

        p.a.release(&workspace()).unwrap();
        p.exchange(now_ms());

        assert!(!p.a.is_leader(&workspace()));
        assert!(p.b.is_leader(&workspace()));
    }

    #[test]
    fn test_take_control_displaces_incumbent() {
        let mut p = pair();
        p.a.claim(&workspace()).unwrap();
        p.exchange(now_ms());
        p.b.claim(&workspace()).unwrap();
        p.exchange(now_ms());
        assert!(p.a.is_leader(&workspace()));

        // b claims a slot earlier than a's; a steps down on receipt
        assert!(p.b.take_control(&workspace()).unwrap());
        p.exchange(now_ms());

        assert!(!p.a.is_leader(&workspace()));
        assert!(p.b.is_leader(&workspace()));
        p.assert_single_leader();
    }

    #[test]
    fn test_silent_peer_is_expired() {
        let mut p = pair();
        let now = now_ms();
        p.a.claim(&workspace()).unwrap();
        p.exchange(now);
        p.b.claim(&workspace()).unwrap();
        p.exchange(now);
        assert!(!p.b.is_leader(&workspace()));

        // a goes silent past the heartbeat timeout; b takes over
        let later = now + 20_000;
        p.b.tick(later).unwrap();
        assert!(p.b.is_leader(&workspace()));
    }

    #[test]
    fn test_leadership_change_notifications() {
        let mut p = pair();
        let mut changes = p.b.subscribe();

        p.a.claim(&workspace()).unwrap();
        p.exchange(now_ms());
        p.b.claim(&workspace()).unwrap();
        p.exchange(now_ms());
        p.a.release(&workspace()).unwrap();
        p.exchange(now_ms());

        let change = changes.try_recv().unwrap();
        assert_eq!(
            change,
            LeadershipChange {
                workspace: workspace(),
                is_leader: true
            }
        );
    }

    #[test]
    fn test_workspaces_elect_independently() {
        let mut p = pair();
        let other = WorkspaceId::from("ws-2");

        p.a.claim(&workspace()).unwrap();
        p.exchange(now_ms());
        p.b.claim(&other).unwrap();
        p.exchange(now_ms());

        assert!(p.a.is_leader(&workspace()));
        assert!(p.b.is_leader(&other));
        assert!(!p.a.is_leader(&other));
        assert!(!p.b.is_leader(&workspace()));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_loop_converges_on_one_leader() {
        let bus: Arc<dyn BroadcastBus> = Arc::new(InProcessBus::new());
        let a = Arc::new(
            TabCoordinator::new(TabId::new("tab-a"), Arc::clone(&bus))
                .with_heartbeat(Duration::from_millis(10), Duration::from_millis(100)),
        );
        let b = Arc::new(
            TabCoordinator::new(TabId::new("tab-b"), Arc::clone(&bus))
                .with_heartbeat(Duration::from_millis(10), Duration::from_millis(100)),
        );
        let run_a = tokio::spawn(Arc::clone(&a).run());
        let run_b = tokio::spawn(Arc::clone(&b).run());

        a.claim(&workspace()).unwrap();
        b.claim(&workspace()).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let leaders = [a.is_leader(&workspace()), b.is_leader(&workspace())];
        assert_eq!(leaders.iter().filter(|leader| **leader).count(), 1);
        run_a.abort();
        run_b.abort();
    }
}
