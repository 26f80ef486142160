//! Running monitors, keyed by session id.
//!
//! At most one monitor runs per session. Starting another one for the same
//! session cancels the running one and carries its seen-set over, so prior
//! activity is never announced twice. Finished runs park their seen-set here
//! for the next continuation.

use crate::monitor::{MonitorOutcome, NotificationSink, SeenSet, SessionMonitor};
use crate::scaling::ScalingPolicy;
use ab_agent::SessionId;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct RunningMonitor {
    generation: u64,
    cancel: CancellationToken,
    handle: JoinHandle<MonitorOutcome>,
}

pub struct MonitorRegistry {
    monitor: Arc<SessionMonitor>,
    scaling: ScalingPolicy,
    running: DashMap<SessionId, RunningMonitor>,
    parked: DashMap<SessionId, SeenSet>,
    active: AtomicUsize,
    next_generation: AtomicU64,
}

impl MonitorRegistry {
    pub fn new(monitor: Arc<SessionMonitor>, scaling: ScalingPolicy) -> Arc<Self> {
        Arc::new(Self {
            monitor,
            scaling,
            running: DashMap::new(),
            parked: DashMap::new(),
            active: AtomicUsize::new(0),
            next_generation: AtomicU64::new(1),
        })
    }

    /// Monitors a newly created session from the start of its feed.
    pub async fn start_fresh(
        self: &Arc<Self>,
        session_id: SessionId,
        plan_gated: bool,
        sink: Arc<dyn NotificationSink>,
    ) {
        self.launch(session_id, plan_gated, sink, SeedPolicy::Empty).await;
    }

    /// Continues monitoring after a new user turn. Reuses the seen-set of the
    /// running or last finished monitor; backfills when there is none.
    pub async fn resume(
        self: &Arc<Self>,
        session_id: SessionId,
        plan_gated: bool,
        sink: Arc<dyn NotificationSink>,
    ) {
        self.launch(session_id, plan_gated, sink, SeedPolicy::Previous).await;
    }

    /// Cancels the session's monitor and drops its seen-set.
    pub fn forget(&self, session_id: &SessionId) {
        if let Some((_, running)) = self.running.remove(session_id) {
            running.cancel.cancel();
            tracing::info!(session_id = %session_id, "monitor cancelled");
        }
        self.parked.remove(session_id);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.running.contains_key(session_id)
    }

    #[tracing::instrument(level = "info", skip_all, fields(session_id = %session_id, seed = ?policy))]
    async fn launch(
        self: &Arc<Self>,
        session_id: SessionId,
        plan_gated: bool,
        sink: Arc<dyn NotificationSink>,
        policy: SeedPolicy,
    ) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        // Counted before the superseded run is released so a handover never
        // looks idle.
        self.acquire();

        let previous = self.take_previous(&session_id).await;
        let seed = match policy {
            SeedPolicy::Empty => Some(SeenSet::new()),
            SeedPolicy::Previous => previous,
        };

        let cancel = CancellationToken::new();
        let registry = Arc::clone(self);
        let task_session = session_id.clone();
        let task_cancel = cancel.clone();
        // The run must not finish before it is registered, or it could not
        // park its seen-set.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let _ = registered_rx.await;
            let outcome = registry
                .monitor
                .run(task_session.clone(), plan_gated, sink, seed, task_cancel)
                .await;
            registry.finish(&task_session, generation, &outcome);
            outcome
        });

        self.running.insert(
            session_id,
            RunningMonitor {
                generation,
                cancel,
                handle,
            },
        );
        let _ = registered_tx.send(());
    }

    /// Stops the running monitor, if any, and returns the seen-set to carry on with.
    async fn take_previous(&self, session_id: &SessionId) -> Option<SeenSet> {
        let Some((_, running)) = self.running.remove(session_id) else {
            return self.parked.remove(session_id).map(|(_, seen)| seen);
        };
        running.cancel.cancel();
        match running.handle.await {
            Ok(outcome) => {
                tracing::debug!(
                    session_id = %session_id,
                    superseded = running.generation,
                    "superseded running monitor"
                );
                Some(outcome.seen)
            }
            Err(error) => {
                tracing::warn!(%error, session_id = %session_id, "superseded monitor task failed");
                self.parked.remove(session_id).map(|(_, seen)| seen)
            }
        }
    }

    fn finish(&self, session_id: &SessionId, generation: u64, outcome: &MonitorOutcome) {
        let current = self
            .running
            .remove_if(session_id, |_, running| running.generation == generation)
            .is_some();
        tracing::debug!(
            session_id = %session_id,
            generation,
            reason = ?outcome.reason,
            current,
            "monitor task finished"
        );
        if current {
            self.parked.insert(session_id.clone(), outcome.seen.clone());
        }
        self.release();
    }

    fn acquire(&self) {
        if self.active.fetch_add(1, Ordering::SeqCst) == 0 {
            tracing::info!("first monitor started; scaling up");
            self.scaling.on_busy();
        }
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            tracing::info!("last monitor finished; scaling down");
            self.scaling.on_idle();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum SeedPolicy {
    Empty,
    Previous,
}
