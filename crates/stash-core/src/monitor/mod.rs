//! Network and lifecycle monitor
//!
//! Feeds the sync engine at the right moments: connectivity changes,
//! visibility changes, auth becoming ready, an explicit user request,
//! and a periodic timer. All triggers pass through one gate so the
//! rules live in a single place: only the leader syncs, only when the
//! user has sync enabled, only when auth is ready, and no more often
//! than the debounce interval (a forced sync skips the debounce, not
//! the other rules).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::coordinator::TabCoordinator;
use crate::models::{now_ms, WorkspaceId};
use crate::sync::SyncEngine;

/// External signals fed to the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorEvent {
    /// Connectivity restored
    Online,
    /// Connectivity lost
    Offline,
    /// The app surface became visible/foreground
    Visible,
    /// The app surface went to background
    Hidden,
    /// Credentials are valid again after an auth pause
    AuthReady,
    /// The user asked for a sync right now
    ForceSync,
}

/// Why a sync is being considered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Reconnect,
    Foreground,
    AuthReady,
    Forced,
    Periodic,
    LeadershipGained,
}

/// Inputs to the sync gate at one decision point
#[derive(Debug, Clone, Copy)]
struct Gate {
    is_leader: bool,
    sync_enabled: bool,
    auth_ready: bool,
    online: bool,
    auto_sync_on_reconnect: bool,
    /// Millis since the last sync attempt from this monitor
    since_last_attempt: i64,
    min_drain_interval: i64,
}

/// The gate itself; pure so every rule is testable in isolation
fn should_sync(gate: Gate, trigger: Trigger) -> bool {
    if !gate.is_leader || !gate.sync_enabled || !gate.online {
        return false;
    }
    // An auth-ready signal is itself the proof; for everything else
    // a pending auth pause blocks the attempt
    if !gate.auth_ready && trigger != Trigger::AuthReady {
        return false;
    }
    if trigger == Trigger::Reconnect && !gate.auto_sync_on_reconnect {
        return false;
    }
    // Forced syncs and auth resumption skip the debounce
    if matches!(trigger, Trigger::Forced | Trigger::AuthReady) {
        return true;
    }
    gate.since_last_attempt >= gate.min_drain_interval
}

/// Watches connectivity and lifecycle signals and drives the engine
pub struct SyncMonitor {
    engine: Arc<SyncEngine>,
    coordinator: Arc<TabCoordinator>,
    workspace: Mutex<WorkspaceId>,
    sync_enabled: AtomicBool,
    auto_sync_on_reconnect: AtomicBool,
    online: AtomicBool,
    min_drain_interval: Duration,
    poll_interval: Duration,
    last_attempt_at: Mutex<i64>,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<MonitorEvent>>>,
}

impl SyncMonitor {
    pub fn new(
        engine: Arc<SyncEngine>,
        coordinator: Arc<TabCoordinator>,
        workspace: WorkspaceId,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            coordinator,
            workspace: Mutex::new(workspace),
            sync_enabled: AtomicBool::new(true),
            auto_sync_on_reconnect: AtomicBool::new(true),
            online: AtomicBool::new(true),
            min_drain_interval: Duration::from_secs(10),
            poll_interval: Duration::from_secs(60),
            last_attempt_at: Mutex::new(0),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    #[must_use]
    pub fn with_intervals(mut self, min_drain: Duration, poll: Duration) -> Self {
        self.min_drain_interval = min_drain;
        self.poll_interval = poll;
        self
    }

    /// Sender half for pushing lifecycle events in
    #[must_use]
    pub fn events(&self) -> mpsc::UnboundedSender<MonitorEvent> {
        self.events_tx.clone()
    }

    pub fn set_sync_enabled(&self, enabled: bool) {
        self.sync_enabled.store(enabled, Ordering::SeqCst);
        tracing::info!(enabled, "sync preference changed");
    }

    #[must_use]
    pub fn sync_enabled(&self) -> bool {
        self.sync_enabled.load(Ordering::SeqCst)
    }

    pub fn set_auto_sync_on_reconnect(&self, enabled: bool) {
        self.auto_sync_on_reconnect.store(enabled, Ordering::SeqCst);
    }

    /// Point the monitor at a different workspace. An in-flight drain
    /// for the old workspace is asked to stop.
    pub fn set_workspace(&self, workspace: WorkspaceId) {
        let previous = {
            let mut current = self.workspace.lock().unwrap();
            std::mem::replace(&mut *current, workspace)
        };
        self.engine.request_cancel(&previous);
    }

    #[must_use]
    pub fn workspace(&self) -> WorkspaceId {
        self.workspace.lock().unwrap().clone()
    }

    fn gate(&self, workspace: &WorkspaceId, now: i64) -> Gate {
        Gate {
            is_leader: self.coordinator.is_leader(workspace),
            sync_enabled: self.sync_enabled.load(Ordering::SeqCst),
            auth_ready: !self.engine.is_auth_required(),
            online: self.online.load(Ordering::SeqCst),
            auto_sync_on_reconnect: self.auto_sync_on_reconnect.load(Ordering::SeqCst),
            since_last_attempt: now.saturating_sub(*self.last_attempt_at.lock().unwrap()),
            min_drain_interval: i64::try_from(self.min_drain_interval.as_millis())
                .unwrap_or(i64::MAX),
        }
    }

    async fn maybe_sync(&self, trigger: Trigger) {
        let workspace = self.workspace();
        let now = now_ms();
        if !should_sync(self.gate(&workspace, now), trigger) {
            tracing::trace!(?trigger, "sync gate closed");
            return;
        }

        // The periodic timer checks cheaply before a full transfer:
        // nothing new remotely and nothing queued locally means the
        // pull can wait for the next interval
        if trigger == Trigger::Periodic {
            let queued = self.engine.pending_operations(&workspace).unwrap_or(0);
            let remote_changed = self
                .engine
                .remote_has_changes(&workspace)
                .await
                .unwrap_or(true);
            if queued == 0 && !remote_changed {
                tracing::trace!("periodic check: nothing to sync");
                return;
            }
        }

        *self.last_attempt_at.lock().unwrap() = now;
        tracing::debug!(workspace = %workspace, ?trigger, "sync triggered");
        if let Err(error) = self.engine.full_sync(&workspace).await {
            tracing::error!(workspace = %workspace, %error, "sync failed");
        }
    }

    async fn handle_event(&self, event: MonitorEvent) {
        match event {
            MonitorEvent::Online => {
                self.online.store(true, Ordering::SeqCst);
                self.engine.set_online();
                self.maybe_sync(Trigger::Reconnect).await;
            }
            MonitorEvent::Offline => {
                self.online.store(false, Ordering::SeqCst);
                self.engine.set_offline();
            }
            MonitorEvent::Visible => {
                self.maybe_sync(Trigger::Foreground).await;
            }
            MonitorEvent::Hidden => {}
            MonitorEvent::AuthReady => {
                self.engine.set_auth_ready();
                self.maybe_sync(Trigger::AuthReady).await;
            }
            MonitorEvent::ForceSync => {
                self.maybe_sync(Trigger::Forced).await;
            }
        }
    }

    /// Drive the monitor: lifecycle events, leadership changes, and
    /// the periodic timer. Runs until the event sender side closes.
    ///
    /// # Panics
    /// Panics if called twice; the event receiver is single-use.
    pub async fn run(self: Arc<Self>) {
        let mut events = self
            .events_rx
            .lock()
            .unwrap()
            .take()
            .expect("monitor already running");
        let mut leadership = self.coordinator.subscribe();
        let mut poll = tokio::time::interval(self.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first interval tick fires immediately; skip it so
        // startup syncs are driven by explicit events
        poll.tick().await;

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                change = leadership.recv() => {
                    if let Ok(change) = change {
                        if change.is_leader && change.workspace == self.workspace() {
                            self.maybe_sync(Trigger::LeadershipGained).await;
                        }
                    }
                },
                _ = poll.tick() => {
                    self.maybe_sync(Trigger::Periodic).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn open_gate() -> Gate {
        Gate {
            is_leader: true,
            sync_enabled: true,
            auth_ready: true,
            online: true,
            auto_sync_on_reconnect: true,
            since_last_attempt: 60_000,
            min_drain_interval: 10_000,
        }
    }

    #[test]
    fn test_gate_requires_leadership() {
        let gate = Gate {
            is_leader: false,
            ..open_gate()
        };
        assert!(!should_sync(gate, Trigger::Periodic));
        // Even a forced sync stays within the leader
        assert!(!should_sync(gate, Trigger::Forced));
    }

    #[test]
    fn test_gate_respects_user_preference() {
        let gate = Gate {
            sync_enabled: false,
            ..open_gate()
        };
        assert!(!should_sync(gate, Trigger::Forced));
        assert!(!should_sync(gate, Trigger::Periodic));
    }

    #[test]
    fn test_gate_debounces_periodic_triggers() {
        let gate = Gate {
            since_last_attempt: 2_000,
            ..open_gate()
        };
        assert!(!should_sync(gate, Trigger::Periodic));
        assert!(!should_sync(gate, Trigger::Foreground));
        // Debounce does not apply to explicit requests
        assert!(should_sync(gate, Trigger::Forced));
    }

    #[test]
    fn test_gate_blocks_while_auth_pending_except_auth_ready() {
        let gate = Gate {
            auth_ready: false,
            ..open_gate()
        };
        assert!(!should_sync(gate, Trigger::Periodic));
        assert!(!should_sync(gate, Trigger::Forced));
        // The auth-ready trigger is what lifts the pause
        assert!(should_sync(gate, Trigger::AuthReady));
    }

    #[test]
    fn test_gate_reconnect_honors_auto_sync_preference() {
        let gate = Gate {
            auto_sync_on_reconnect: false,
            ..open_gate()
        };
        assert!(!should_sync(gate, Trigger::Reconnect));
        assert!(should_sync(gate, Trigger::Periodic));

        assert!(should_sync(open_gate(), Trigger::Reconnect));
    }

    #[test]
    fn test_gate_never_syncs_offline() {
        let gate = Gate {
            online: false,
            ..open_gate()
        };
        for trigger in [Trigger::Forced, Trigger::Periodic, Trigger::AuthReady] {
            assert!(!should_sync(gate, trigger));
        }
    }

    #[test]
    fn test_gate_opens_for_leadership_gain() {
        assert!(should_sync(open_gate(), Trigger::LeadershipGained));
        let recent = Gate {
            since_last_attempt: 0,
            ..open_gate()
        };
        // Leadership gained right after a sync still debounces
        assert!(!should_sync(recent, Trigger::LeadershipGained));
    }

    mod integration {
        use super::*;
        use crate::coordinator::{BroadcastBus, InProcessBus, TabCoordinator, TabId};
        use pretty_assertions::assert_eq;
        use crate::db::Database;
        use crate::models::EntityKind;
        use crate::sync::remote::{ChangeBatch, RemoteApi, RemoteEntity, RemoteError};
        use crate::sync::BackoffPolicy;
        use async_trait::async_trait;
        use std::sync::atomic::AtomicUsize;

        /// Remote that records calls and always succeeds with nothing
        #[derive(Default)]
        struct QuietRemote {
            pulls: AtomicUsize,
        }

        #[async_trait]
        impl RemoteApi for QuietRemote {
            async fn changes_since(
                &self,
                _workspace: &WorkspaceId,
                _since: i64,
            ) -> Result<ChangeBatch, RemoteError> {
                self.pulls.fetch_add(1, Ordering::SeqCst);
                Ok(ChangeBatch {
                    server_time: now_ms(),
                    entities: Vec::new(),
                })
            }

            async fn probe(
                &self,
                _workspace: &WorkspaceId,
                _since: i64,
            ) -> Result<bool, RemoteError> {
                Ok(false)
            }

            async fn create(
                &self,
                _workspace: &WorkspaceId,
                entity: &RemoteEntity,
                _idempotency_key: &str,
            ) -> Result<RemoteEntity, RemoteError> {
                Ok(entity.clone())
            }

            async fn update(
                &self,
                _workspace: &WorkspaceId,
                entity: &RemoteEntity,
            ) -> Result<RemoteEntity, RemoteError> {
                Ok(entity.clone())
            }

            async fn delete(
                &self,
                _workspace: &WorkspaceId,
                _kind: EntityKind,
                _id: &str,
            ) -> Result<(), RemoteError> {
                Ok(())
            }
        }

        fn setup() -> (Arc<SyncMonitor>, Arc<QuietRemote>, Arc<TabCoordinator>) {
            let db = Arc::new(std::sync::Mutex::new(Database::open_in_memory().unwrap()));
            let remote = Arc::new(QuietRemote::default());
            let engine = Arc::new(SyncEngine::new(
                db,
                Arc::<QuietRemote>::clone(&remote) as Arc<dyn RemoteApi>,
                BackoffPolicy::default(),
            ));
            let bus: Arc<dyn BroadcastBus> = Arc::new(InProcessBus::new());
            let coordinator = Arc::new(TabCoordinator::new(TabId::new("tab-test"), bus));
            let monitor = Arc::new(
                SyncMonitor::new(
                    engine,
                    Arc::clone(&coordinator),
                    WorkspaceId::from("ws-1"),
                )
                .with_intervals(Duration::ZERO, Duration::from_secs(3600)),
            );
            (monitor, remote, coordinator)
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_force_sync_runs_full_sync_when_leader() {
            let (monitor, remote, coordinator) = setup();
            coordinator.claim(&WorkspaceId::from("ws-1")).unwrap();

            monitor.handle_event(MonitorEvent::ForceSync).await;
            assert_eq!(remote.pulls.load(Ordering::SeqCst), 1);
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_follower_never_syncs() {
            let (monitor, remote, _coordinator) = setup();
            // No claim made: this instance is a follower

            monitor.handle_event(MonitorEvent::ForceSync).await;
            monitor.handle_event(MonitorEvent::Online).await;
            assert_eq!(remote.pulls.load(Ordering::SeqCst), 0);
        }

        #[tokio::test(flavor = "multi_thread")]
        async fn test_offline_event_flips_engine_state() {
            let (monitor, remote, coordinator) = setup();
            coordinator.claim(&WorkspaceId::from("ws-1")).unwrap();

            monitor.handle_event(MonitorEvent::Offline).await;
            monitor.handle_event(MonitorEvent::ForceSync).await;
            assert_eq!(remote.pulls.load(Ordering::SeqCst), 0);

            monitor.handle_event(MonitorEvent::Online).await;
            // Reconnect with auto-sync on triggers a full sync
            assert_eq!(remote.pulls.load(Ordering::SeqCst), 1);
        }
    }
}
