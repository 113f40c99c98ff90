//! Capture session supervisor: backend command construction, process
//! spawning, and finalization of output files.
//!
//! Each active session owns one external capture process. The process is
//! held by a per-session waiter task; the rest of the system only sees the
//! bookkeeping record in [`SessionSet`]. Stopping a session is a
//! non-blocking cancellation signal - every bit of cleanup (removal from
//! the set, min-size discard, move to the completed directory) happens on
//! the exit path, whatever made the process exit.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use corralconf::CorralConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Builds the external command line for one source.
///
/// One strategy interface instead of per-backend supervisor logic; the
/// supervisor neither knows nor cares whether it is driving a stream-copy
/// or a protocol dump.
pub trait CaptureBackend: Send + Sync {
    /// Final output filename for a session started at `when`.
    fn filename(&self, source: &crate::roster::Source, when: DateTime<Utc>) -> String;

    /// Program and argument vector that writes the stream to `out`.
    fn command(&self, source: &crate::roster::Source, out: &Path)
        -> Result<(String, Vec<String>)>;
}

const EDGE_HOST_SUFFIX: &str = ".myfreecams.com";
const ROOM_ID_BASE: u64 = 100_000_000;

/// HLS stream copy via ffmpeg. The default backend.
pub struct StreamCopyBackend;

impl CaptureBackend for StreamCopyBackend {
    fn filename(&self, source: &crate::roster::Source, when: DateTime<Utc>) -> String {
        format!("{}-{}.ts", source.name, when.format("%Y-%m-%dT%H%M%S"))
    }

    fn command(
        &self,
        source: &crate::roster::Source,
        out: &Path,
    ) -> Result<(String, Vec<String>)> {
        let camserv = source
            .attrs
            .camserv
            .with_context(|| format!("{} has no edge server attribute", source.name))?;

        // Video edge servers are numbered camserv - 500.
        let playlist = format!(
            "http://video{}{}:1935/NxServer/ngrp:mfc_{}.f4v_mobile/playlist.m3u8?nc={}",
            camserv.saturating_sub(500),
            EDGE_HOST_SUFFIX,
            ROOM_ID_BASE + source.uid,
            Utc::now().timestamp_millis(),
        );

        let args = vec![
            "-hide_banner".to_string(),
            "-v".to_string(),
            "fatal".to_string(),
            "-i".to_string(),
            playlist,
            "-c".to_string(),
            "copy".to_string(),
            out.display().to_string(),
        ];

        Ok(("ffmpeg".to_string(), args))
    }
}

/// RTMP protocol dump via rtmpdump, for sources on the legacy phase.
pub struct ProtocolDumpBackend;

impl CaptureBackend for ProtocolDumpBackend {
    fn filename(&self, source: &crate::roster::Source, when: DateTime<Utc>) -> String {
        format!("{}-{}-flv.flv", source.name, when.format("%Y-%m-%dT%H%M%S"))
    }

    fn command(
        &self,
        source: &crate::roster::Source,
        out: &Path,
    ) -> Result<(String, Vec<String>)> {
        let camserv = source
            .attrs
            .camserv
            .with_context(|| format!("{} has no edge server attribute", source.name))?;

        // RTMP edge servers are numbered camserv - 1000.
        let args = vec![
            "-q".to_string(),
            "--live".to_string(),
            "--rtmp".to_string(),
            format!(
                "rtmp://video{}{}:1935/NxServer",
                camserv.saturating_sub(1000),
                EDGE_HOST_SUFFIX
            ),
            "--playpath".to_string(),
            format!("mfc_{}.f4v", ROOM_ID_BASE + source.uid),
            "--flv".to_string(),
            out.display().to_string(),
        ];

        Ok(("rtmpdump".to_string(), args))
    }
}

/// Picks the backend for a source by its attributes.
pub struct BackendRegistry {
    stream_copy: Box<dyn CaptureBackend>,
    protocol_dump: Box<dyn CaptureBackend>,
}

impl BackendRegistry {
    pub fn new(
        stream_copy: Box<dyn CaptureBackend>,
        protocol_dump: Box<dyn CaptureBackend>,
    ) -> Self {
        Self {
            stream_copy,
            protocol_dump,
        }
    }

    pub fn for_source(&self, source: &crate::roster::Source) -> &dyn CaptureBackend {
        if source.attrs.phase.as_deref() == Some("a") {
            self.protocol_dump.as_ref()
        } else {
            self.stream_copy.as_ref()
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new(Box::new(StreamCopyBackend), Box::new(ProtocolDumpBackend))
    }
}

/// Bookkeeping record for one active capture subprocess.
#[derive(Clone)]
pub struct CaptureSession {
    pub uid: u64,
    pub name: String,
    /// Final output filename. While capturing, the file sits in the
    /// capture directory with a `.part` suffix.
    pub filename: String,
    /// File size observed at the last liveness check.
    pub last_size: u64,
    /// Unix timestamp of the next due liveness check.
    pub check_after: i64,
    stop: CancellationToken,
}

/// In-progress path for a session's output file.
pub fn part_path(capture_dir: &Path, filename: &str) -> PathBuf {
    capture_dir.join(format!("{filename}.part"))
}

/// Shared set of active capture sessions.
///
/// Cloneable handle over a mutex-guarded map; shared between the cycle
/// loop, the watchdog, the control API, and the per-session waiter tasks.
#[derive(Clone, Default)]
pub struct SessionSet {
    inner: Arc<Mutex<HashMap<u64, CaptureSession>>>,
}

impl SessionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, uid: u64) -> bool {
        self.inner.lock().unwrap().contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn active_uids(&self) -> Vec<u64> {
        self.inner.lock().unwrap().keys().copied().collect()
    }

    pub fn snapshot(&self) -> Vec<CaptureSession> {
        self.inner.lock().unwrap().values().cloned().collect()
    }

    /// Request a session's process be killed. Non-blocking; the waiter
    /// task does the cleanup. A second stop for the same session is a
    /// no-op.
    pub fn stop(&self, uid: u64) {
        let sessions = self.inner.lock().unwrap();
        if let Some(session) = sessions.get(&uid) {
            session.stop.cancel();
        }
    }

    /// Record a passed liveness check: new size, next due time.
    ///
    /// Silently ignores sessions that exited between snapshot and update.
    pub fn record_alive(&self, uid: u64, size: u64, check_after: i64) {
        let mut sessions = self.inner.lock().unwrap();
        if let Some(session) = sessions.get_mut(&uid) {
            session.last_size = size;
            session.check_after = check_after;
        }
    }

    fn insert(&self, session: CaptureSession) {
        self.inner.lock().unwrap().insert(session.uid, session);
    }

    fn remove(&self, uid: u64) -> Option<CaptureSession> {
        self.inner.lock().unwrap().remove(&uid)
    }
}

#[cfg(test)]
impl SessionSet {
    /// Register a session with no backing process, for watchdog tests.
    pub(crate) fn insert_stub(
        &self,
        uid: u64,
        name: &str,
        filename: &str,
        last_size: u64,
        check_after: i64,
    ) -> CancellationToken {
        let stop = CancellationToken::new();
        self.insert(CaptureSession {
            uid,
            name: name.to_string(),
            filename: filename.to_string(),
            last_size,
            check_after,
            stop: stop.clone(),
        });
        stop
    }

    pub(crate) fn is_stopping(&self, uid: u64) -> bool {
        self.inner
            .lock()
            .unwrap()
            .get(&uid)
            .is_some_and(|s| s.stop.is_cancelled())
    }
}

/// Owns session lifecycle: spawn, waiter task, finalize.
pub struct CaptureSupervisor {
    sessions: SessionSet,
    backends: BackendRegistry,
    capture_dir: PathBuf,
    complete_dir: PathBuf,
    min_file_bytes: u64,
    per_source_dirs: bool,
    first_check_delay_secs: i64,
}

impl CaptureSupervisor {
    pub fn new(config: &CorralConfig, sessions: SessionSet, backends: BackendRegistry) -> Self {
        Self {
            sessions,
            backends,
            capture_dir: config.paths.capture_dir.clone(),
            complete_dir: config.paths.complete_dir.clone(),
            min_file_bytes: config.capture.min_file_bytes(),
            per_source_dirs: config.capture.per_source_dirs,
            first_check_delay_secs: config.capture.first_check_delay_secs as i64,
        }
    }

    pub fn sessions(&self) -> &SessionSet {
        &self.sessions
    }

    /// Spawn a capture process for `source` and register its session.
    ///
    /// A spawn failure registers nothing; the source stays absent from the
    /// active set and is eligible again next cycle. Idempotent for sources
    /// that already have a session.
    pub fn start(&self, source: &crate::roster::Source) -> Result<()> {
        if self.sessions.contains(source.uid) {
            tracing::debug!(source.uid = source.uid, source.name = %source.name, "Already capturing");
            return Ok(());
        }

        let backend = self.backends.for_source(source);
        let filename = backend.filename(source, Utc::now());
        let part = part_path(&self.capture_dir, &filename);
        let (program, args) = backend.command(source, &part)?;

        tracing::info!(
            source.uid = source.uid,
            source.name = %source.name,
            program = %program,
            "Source is now online, starting capture process"
        );

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {program} for {}", source.name))?;

        let stop = CancellationToken::new();
        let session = CaptureSession {
            uid: source.uid,
            name: source.name.clone(),
            filename: filename.clone(),
            last_size: 0,
            check_after: Utc::now().timestamp() + self.first_check_delay_secs,
            stop: stop.clone(),
        };
        self.sessions.insert(session);

        let dest_dir = if self.per_source_dirs {
            let dir_name = source.name.clone();
            self.complete_dir.join(dir_name)
        } else {
            self.complete_dir.clone()
        };

        let sessions = self.sessions.clone();
        let uid = source.uid;
        let name = source.name.clone();
        let min_bytes = self.min_file_bytes;
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = stop.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(source.uid = uid, source.name = %name, "Failed to signal capture process: {e}");
                    }
                    child.wait().await
                }
            };

            match status {
                Ok(status) => {
                    tracing::info!(source.uid = uid, source.name = %name, exit = ?status.code(), "Stopped streaming");
                }
                Err(e) => {
                    tracing::error!(source.uid = uid, source.name = %name, "Failed to reap capture process: {e}");
                }
            }

            // Unconditional removal: whatever the exit reason, the session
            // record must not outlive the process.
            sessions.remove(uid);

            finalize_output(&part, &dest_dir, &filename, min_bytes, &name).await;
        });

        Ok(())
    }

    /// Non-blocking stop; cleanup happens through the exit path.
    pub fn stop(&self, uid: u64) {
        self.sessions.stop(uid);
    }
}

/// Dispose of a finished capture file.
///
/// Missing file: nothing to do. Below the minimum size: deleted, partial
/// captures are not worth archiving. Otherwise moved into the completed
/// directory, dropping the `.part` marker; a failed move is logged and the
/// file left in place.
pub async fn finalize_output(
    part: &Path,
    dest_dir: &Path,
    filename: &str,
    min_bytes: u64,
    name: &str,
) {
    let size = match tokio::fs::metadata(part).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
        Err(e) => {
            tracing::error!(source.name = %name, path = %part.display(), "Failed to stat capture file: {e}");
            return;
        }
    };

    if size < min_bytes {
        tracing::info!(
            source.name = %name,
            path = %part.display(),
            size,
            "Discarding capture below minimum size"
        );
        if let Err(e) = tokio::fs::remove_file(part).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::error!(source.name = %name, "Failed to remove partial capture: {e}");
            }
        }
        return;
    }

    let dest = dest_dir.join(filename);
    if let Err(e) = move_file(part, &dest).await {
        tracing::error!(
            source.name = %name,
            from = %part.display(),
            to = %dest.display(),
            "Failed to move finished capture, leaving in place: {e}"
        );
    } else {
        tracing::info!(source.name = %name, to = %dest.display(), "Capture complete");
    }
}

/// Rename with a copy+remove fallback for cross-filesystem moves.
pub(crate) async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}
