//! The reconciliation loop.
//!
//! One cycle merges the three independently-mutating pieces of state - the
//! remote roster, the durable inclusion list, and the in-memory session set
//! - into a consistent set of running capture processes, then publishes a
//! read-only snapshot for the control API. Cycles never overlap: the next
//! one is scheduled only after the previous one's work completes, and any
//! per-cycle error is logged at the boundary rather than allowed to kill
//! the loop.

use crate::capture::CaptureSupervisor;
use crate::resolver;
use crate::roster::{OnlineState, RosterFetch, Source};
use crate::scheduler;
use crate::store::{InclusionStore, Mode, PendingRequest};
use crate::watchdog;
use anyhow::Result;
use chrono::Utc;
use corralconf::CorralConfig;
use serde::Serialize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Transient queue of control requests awaiting the next cycle.
///
/// The control API pushes; the cycle drains. Requests arriving while a
/// cycle is in flight are simply picked up by the next one.
#[derive(Clone, Default)]
pub struct RequestQueue {
    inner: Arc<Mutex<Vec<PendingRequest>>>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(requests: Vec<PendingRequest>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(requests)),
        }
    }

    pub fn push(&self, request: PendingRequest) {
        self.inner.lock().unwrap().push(request);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn snapshot(&self) -> Vec<PendingRequest> {
        self.inner.lock().unwrap().clone()
    }

    /// Take everything currently queued.
    fn drain(&self) -> Vec<PendingRequest> {
        std::mem::take(&mut *self.inner.lock().unwrap())
    }

    /// Put unresolved requests back, ahead of anything that arrived while
    /// the cycle was running, preserving enqueue order.
    fn requeue(&self, mut unresolved: Vec<PendingRequest>) {
        let mut queue = self.inner.lock().unwrap();
        unresolved.append(&mut queue);
        *queue = unresolved;
    }
}

/// One source as the control API sees it.
#[derive(Debug, Clone, Serialize)]
pub struct SourceView {
    pub uid: u64,
    #[serde(rename = "nm")]
    pub name: String,
    #[serde(rename = "vs")]
    pub state: OnlineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub capturing: bool,
}

/// Read-only cache of the last cycle's roster, for `GET /models`.
#[derive(Clone, Default)]
pub struct Snapshot {
    inner: Arc<RwLock<Vec<SourceView>>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Vec<SourceView> {
        self.inner.read().unwrap().clone()
    }

    fn publish(&self, views: Vec<SourceView>) {
        *self.inner.write().unwrap() = views;
    }
}

/// Owns a cycle's worth of state and runs the loop.
pub struct Supervisor {
    config: CorralConfig,
    fetcher: Arc<dyn RosterFetch>,
    captures: CaptureSupervisor,
    store: InclusionStore,
    queue: RequestQueue,
    snapshot: Snapshot,
}

impl Supervisor {
    pub fn new(
        config: CorralConfig,
        fetcher: Arc<dyn RosterFetch>,
        captures: CaptureSupervisor,
        store: InclusionStore,
        queue: RequestQueue,
        snapshot: Snapshot,
    ) -> Self {
        Self {
            config,
            fetcher,
            captures,
            store,
            queue,
            snapshot,
        }
    }

    pub fn store(&self) -> &InclusionStore {
        &self.store
    }

    /// Obtain the very first roster snapshot, retrying within a bounded
    /// window. Failure here is the one unrecoverable condition: without an
    /// initial roster the process has nothing to supervise and exits.
    pub async fn wait_for_first_roster(&self) -> Result<Vec<Source>> {
        let deadline = tokio::time::Instant::now()
            + Duration::from_secs(self.config.roster.startup_window_secs);

        loop {
            match self.fetcher.fetch().await {
                Ok(sources) => return Ok(sources),
                Err(e) if tokio::time::Instant::now() >= deadline => {
                    anyhow::bail!("No roster snapshot within startup window: {e:#}");
                }
                Err(e) => {
                    tracing::warn!("Initial roster fetch failed, retrying: {e:#}");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    /// Run cycles until cancelled. The first roster fetch is startup-fatal;
    /// everything after that is logged and survived.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let first = self.wait_for_first_roster().await?;
        self.run_cycle_with(first).await;

        let mut interval =
            tokio::time::interval(Duration::from_secs(self.config.capture.scan_interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.reset();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_cycle().await;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Supervisor loop shutting down");
                    // Last chance to persist anything a final request left dirty.
                    let queue = self.queue.snapshot();
                    if let Err(e) = self.store.flush(&queue) {
                        tracing::error!("Final state flush failed: {e:#}");
                    }
                    return Ok(());
                }
            }
        }
    }

    /// One full cycle, fetching a fresh roster first.
    ///
    /// A fetch failure means this cycle has no roster: nothing is selected,
    /// nothing resolves by name, and the watchdog still runs.
    pub async fn run_cycle(&mut self) {
        let sources = match self.fetcher.fetch().await {
            Ok(sources) => {
                tracing::info!(count = sources.len(), "Sources online");
                sources
            }
            Err(e) => {
                tracing::warn!("Roster fetch failed, proceeding with empty roster: {e:#}");
                Vec::new()
            }
        };

        self.run_cycle_with(sources).await;
    }

    /// The cycle body, with the roster already in hand.
    pub async fn run_cycle_with(&mut self, sources: Vec<Source>) {
        let now = Utc::now().timestamp();

        // Resolve queued requests and expire timed inclusions.
        let queued = self.queue.drain();
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "Requests in the queue");
        }
        let unresolved = resolver::resolve(queued, &sources, &mut self.store);
        self.queue.requeue(unresolved);
        resolver::apply_expiry(&mut self.store, &sources, now);

        // Diff desired against actual.
        let active = self.captures.sessions().active_uids();
        let plan = scheduler::select(&sources, &self.store, &active, now);

        for uid in &plan.to_stop {
            self.captures.stop(*uid);
        }

        // Fan out all spawn attempts; the cycle proceeds once each has
        // returned pass/fail, not when any stream finishes.
        let mut started = 0usize;
        for source in &plan.to_start {
            match self.captures.start(source) {
                Ok(()) => started += 1,
                Err(e) => {
                    tracing::error!(
                        source.uid = source.uid,
                        source.name = %source.name,
                        "Failed to start capture: {e:#}"
                    );
                }
            }
        }
        if started > 0 {
            tracing::info!(count = started, "Capture sessions started");
        }

        watchdog::check_sessions(
            self.captures.sessions(),
            &self.store,
            &self.config.paths.capture_dir,
            self.config.capture.check_interval_secs as i64,
            now,
        )
        .await;

        // Persist if anything changed; a failed write stays dirty and
        // retries next cycle.
        if self.store.is_dirty() {
            let queue = self.queue.snapshot();
            if let Err(e) = self.store.flush(&queue) {
                tracing::error!("State flush failed, will retry next cycle: {e:#}");
            }
        }

        self.publish(&sources);
    }

    /// Publish the read-only snapshot for the control API. Sources marked
    /// deleted are hidden from the listing; their rows still exist in the
    /// store.
    fn publish(&self, sources: &[Source]) {
        let active = self.captures.sessions().active_uids();
        let views = sources
            .iter()
            .filter_map(|source| {
                let mode = self.store.mode_for(source.uid);
                if mode == Some(Mode::Deleted) {
                    return None;
                }
                Some(SourceView {
                    uid: source.uid,
                    name: source.name.clone(),
                    state: source.state,
                    mode,
                    capturing: active.contains(&source.uid),
                })
            })
            .collect();
        self.snapshot.publish(views);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(uid: u64, mode: Mode) -> PendingRequest {
        PendingRequest {
            key: crate::store::SourceKey::ById(uid),
            mode,
        }
    }

    #[test]
    fn test_requeue_preserves_enqueue_order() {
        let queue = RequestQueue::new();
        queue.push(request(1, Mode::Included));
        queue.push(request(2, Mode::Included));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);

        // A request arrives while the cycle is running...
        queue.push(request(3, Mode::Excluded));
        // ...and the first request could not be resolved.
        queue.requeue(vec![drained[0].clone()]);

        let order: Vec<u64> = queue
            .snapshot()
            .iter()
            .map(|r| match &r.key {
                crate::store::SourceKey::ById(uid) => *uid,
                crate::store::SourceKey::ByName(_) => unreachable!(),
            })
            .collect();
        assert_eq!(order, vec![1, 3]);
    }

    #[test]
    fn test_snapshot_swaps_wholesale() {
        let snapshot = Snapshot::new();
        assert!(snapshot.get().is_empty());

        snapshot.publish(vec![SourceView {
            uid: 1,
            name: "alice".to_string(),
            state: OnlineState::Public,
            mode: Some(Mode::Included),
            capturing: false,
        }]);
        assert_eq!(snapshot.get().len(), 1);

        snapshot.publish(Vec::new());
        assert!(snapshot.get().is_empty());
    }

    #[test]
    fn test_source_view_wire_format() {
        let view = SourceView {
            uid: 42,
            name: "alice".to_string(),
            state: OnlineState::Public,
            mode: Some(Mode::Included),
            capturing: true,
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["uid"], 42);
        assert_eq!(json["nm"], "alice");
        assert_eq!(json["vs"], 0);
        assert_eq!(json["mode"], 1);
        assert_eq!(json["capturing"], true);

        let quiet = SourceView {
            uid: 7,
            name: "bob".to_string(),
            state: OnlineState::Away,
            mode: None,
            capturing: false,
        };
        let json = serde_json::to_value(&quiet).unwrap();
        assert!(json.get("mode").is_none());
        assert!(json.get("capturing").is_none());
    }
}
