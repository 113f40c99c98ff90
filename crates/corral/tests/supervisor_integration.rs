//! Integration tests for the reconciliation loop.
//!
//! These drive whole cycles through the public API with a canned roster
//! and a shell-script capture backend, covering:
//! - include -> capture -> alive -> exclude -> stop -> finalize
//! - idempotent include of an already-capturing source
//! - name-only requests pending across cycles
//! - the startup-fatal roster window

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use corral::capture::{BackendRegistry, CaptureBackend, CaptureSupervisor, SessionSet};
use corral::roster::{OnlineState, RosterFetch, Source, SourceAttrs};
use corral::store::{InclusionStore, Mode, PendingRequest, SourceKey};
use corral::supervisor::{RequestQueue, Snapshot, Supervisor};
use corralconf::CorralConfig;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Fetcher that always fails, for the startup-window test.
struct DownRoster;

#[async_trait]
impl RosterFetch for DownRoster {
    async fn fetch(&self) -> Result<Vec<Source>> {
        anyhow::bail!("roster service unreachable")
    }
}

/// Backend running a shell snippet; `{out}` expands to the output path.
struct ShellBackend {
    script: String,
}

impl CaptureBackend for ShellBackend {
    fn filename(&self, source: &Source, _when: DateTime<Utc>) -> String {
        format!("{}.ts", source.name)
    }

    fn command(&self, _source: &Source, out: &Path) -> Result<(String, Vec<String>)> {
        let script = self.script.replace("{out}", &out.display().to_string());
        Ok(("sh".to_string(), vec!["-c".to_string(), script]))
    }
}

fn source(uid: u64, name: &str) -> Source {
    Source {
        uid,
        name: name.to_string(),
        state: OnlineState::Public,
        attrs: SourceAttrs::default(),
    }
}

fn include(uid: u64) -> PendingRequest {
    PendingRequest {
        key: SourceKey::ById(uid),
        mode: Mode::Included,
    }
}

/// Build a supervisor over a temp dir whose backend runs `script`.
/// `first_delay_secs` controls when the watchdog first judges a session;
/// tests whose sessions write real files keep it long so the watchdog's
/// growth verdicts stay deterministic (those are unit-tested on their own).
fn test_supervisor(
    dir: &TempDir,
    script: &str,
    first_delay_secs: u64,
) -> (Supervisor, SessionSet, RequestQueue, Snapshot) {
    let mut config = CorralConfig::default();
    config.paths.capture_dir = dir.path().join("capture");
    config.paths.complete_dir = dir.path().join("complete");
    config.paths.state_file = dir.path().join("state.json");
    config.capture.first_check_delay_secs = first_delay_secs;
    config.capture.check_interval_secs = 0;
    std::fs::create_dir_all(&config.paths.capture_dir).unwrap();
    std::fs::create_dir_all(&config.paths.complete_dir).unwrap();

    let sessions = SessionSet::new();
    let registry = BackendRegistry::new(
        Box::new(ShellBackend {
            script: script.to_string(),
        }),
        Box::new(ShellBackend {
            script: script.to_string(),
        }),
    );
    let captures = CaptureSupervisor::new(&config, sessions.clone(), registry);
    let (store, _) = InclusionStore::load(&config.paths.state_file).unwrap();
    let queue = RequestQueue::new();
    let snapshot = Snapshot::new();

    let supervisor = Supervisor::new(
        config,
        Arc::new(DownRoster),
        captures,
        store,
        queue.clone(),
        snapshot.clone(),
    );
    (supervisor, sessions, queue, snapshot)
}

async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_end_to_end_capture_lifecycle() {
    let dir = TempDir::new().unwrap();
    // Writes a non-trivial file, then lingers until killed. The long
    // first-check grace keeps the watchdog out of the way; its growth
    // verdicts have their own tests.
    let (mut supervisor, sessions, queue, snapshot) =
        test_supervisor(&dir, "printf '%01000d' 0 > {out} && sleep 30", 3600);

    // Cycle 1: include request for an online source -> session spawns.
    queue.push(include(42));
    supervisor.run_cycle_with(vec![source(42, "alice")]).await;
    assert!(sessions.contains(42));
    assert_eq!(supervisor.store().mode_for(42), Some(Mode::Included));

    // The snapshot shows the source as capturing.
    let views = snapshot.get();
    assert_eq!(views.len(), 1);
    assert!(views[0].capturing);

    // Wait for the capture file, then cycle 2: session is within its
    // grace period and must be left alone.
    let part = dir.path().join("capture/alice.ts.part");
    wait_for(|| part.exists(), "capture file").await;
    supervisor.run_cycle_with(vec![source(42, "alice")]).await;
    assert!(sessions.contains(42), "in-grace session must not be stopped");

    // Cycle 3: exclusion arrives -> session stopped, file finalized.
    queue.push(PendingRequest {
        key: SourceKey::ById(42),
        mode: Mode::Excluded,
    });
    supervisor.run_cycle_with(vec![source(42, "alice")]).await;

    wait_for(|| !sessions.contains(42), "session removal").await;
    let dest = dir.path().join("complete/alice.ts");
    wait_for(|| dest.exists(), "finalized capture").await;
    assert_eq!(std::fs::metadata(&dest).unwrap().len(), 1000);
    assert!(!part.exists());
}

#[tokio::test]
async fn test_duplicate_include_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (mut supervisor, sessions, queue, _snapshot) = test_supervisor(&dir, "sleep 30", 0);

    queue.push(include(42));
    supervisor.run_cycle_with(vec![source(42, "alice")]).await;
    queue.push(include(42));
    supervisor.run_cycle_with(vec![source(42, "alice")]).await;

    assert_eq!(sessions.len(), 1);
    assert_eq!(supervisor.store().len(), 1);

    sessions.stop(42);
    wait_for(|| sessions.is_empty(), "session cleanup").await;
}

#[tokio::test]
async fn test_name_request_pends_until_source_appears() {
    let dir = TempDir::new().unwrap();
    let (mut supervisor, sessions, queue, _snapshot) = test_supervisor(&dir, "sleep 30", 0);

    queue.push(PendingRequest {
        key: SourceKey::ByName("bob".to_string()),
        mode: Mode::Included,
    });

    // Two cycles without bob: request stays queued, nothing captures.
    supervisor.run_cycle_with(vec![source(1, "alice")]).await;
    supervisor.run_cycle_with(vec![source(1, "alice")]).await;
    assert_eq!(queue.len(), 1);
    assert!(supervisor.store().is_empty());
    assert!(sessions.is_empty());

    // Bob shows up: resolved and captured in the same cycle.
    supervisor.run_cycle_with(vec![source(7, "bob")]).await;
    assert!(queue.is_empty());
    assert_eq!(supervisor.store().mode_for(7), Some(Mode::Included));
    assert_eq!(supervisor.store().name_for(7), Some("bob"));
    assert!(sessions.contains(7));

    sessions.stop(7);
    wait_for(|| sessions.is_empty(), "session cleanup").await;
}

#[tokio::test]
async fn test_deleted_sources_hidden_from_snapshot() {
    let dir = TempDir::new().unwrap();
    let (mut supervisor, _sessions, queue, snapshot) = test_supervisor(&dir, "sleep 30", 0);

    queue.push(PendingRequest {
        key: SourceKey::ById(9),
        mode: Mode::Deleted,
    });
    supervisor
        .run_cycle_with(vec![source(9, "carol"), source(1, "alice")])
        .await;

    let names: Vec<String> = snapshot.get().into_iter().map(|v| v.name).collect();
    assert_eq!(names, vec!["alice"]);
    // The row itself is retained.
    assert_eq!(supervisor.store().mode_for(9), Some(Mode::Deleted));
}

#[tokio::test]
async fn test_state_survives_cycles_on_disk() {
    let dir = TempDir::new().unwrap();
    let state_file = dir.path().join("state.json");
    {
        let (mut supervisor, _sessions, queue, _snapshot) = test_supervisor(&dir, "exit 0", 0);
        queue.push(include(42));
        queue.push(PendingRequest {
            key: SourceKey::ByName("ghost".to_string()),
            mode: Mode::Included,
        });
        supervisor.run_cycle_with(vec![source(42, "alice")]).await;
    }

    let (store, persisted_queue) = InclusionStore::load(&state_file).unwrap();
    assert_eq!(store.mode_for(42), Some(Mode::Included));
    assert_eq!(store.name_for(42), Some("alice"));
    // The unresolved ghost request rides along in the state file.
    assert_eq!(persisted_queue.len(), 1);
    assert_eq!(
        persisted_queue[0].key,
        SourceKey::ByName("ghost".to_string())
    );
}

#[tokio::test]
async fn test_startup_window_is_fatal() {
    let dir = TempDir::new().unwrap();
    // Zero-length startup window: the first failed fetch is fatal.
    let mut config = CorralConfig::default();
    config.paths.capture_dir = dir.path().join("capture");
    config.paths.complete_dir = dir.path().join("complete");
    config.paths.state_file = dir.path().join("state.json");
    config.roster.startup_window_secs = 0;

    let sessions = SessionSet::new();
    let captures = CaptureSupervisor::new(&config, sessions, BackendRegistry::default());
    let (store, _) = InclusionStore::load(&config.paths.state_file).unwrap();
    let supervisor = Supervisor::new(
        config,
        Arc::new(DownRoster),
        captures,
        store,
        RequestQueue::new(),
        Snapshot::new(),
    );

    let err = supervisor.wait_for_first_roster().await.unwrap_err();
    assert!(err.to_string().contains("startup window"), "{err:#}");
}

#[tokio::test]
async fn test_fetch_failure_cycle_keeps_running() {
    let dir = TempDir::new().unwrap();
    let (mut supervisor, sessions, queue, snapshot) = test_supervisor(&dir, "sleep 30", 0);

    queue.push(include(42));
    supervisor.run_cycle_with(vec![source(42, "alice")]).await;
    assert!(sessions.contains(42));

    // run_cycle uses the failing fetcher: empty roster, but the session
    // and the queue survive and the snapshot empties.
    supervisor.run_cycle().await;
    assert!(sessions.contains(42));
    assert!(snapshot.get().is_empty());

    sessions.stop(42);
    wait_for(|| sessions.is_empty(), "session cleanup").await;
}
