//! Liveness watchdog: infers capture-process health from output file
//! growth.
//!
//! File growth is the only true liveness signal available - the capture
//! process is an opaque subprocess, and a hung encoder looks exactly like a
//! healthy one from the outside. A session whose file has not grown since
//! its last due check is declared dead and stopped. The watchdog cannot
//! tell a stalled encoder from a very slow stream; killing the occasional
//! slow session is the accepted tradeoff.

use crate::capture::{part_path, SessionSet};
use crate::store::InclusionStore;
use futures::future::join_all;
use std::path::Path;

/// Run one watchdog pass over every active session.
///
/// Revocation is checked first and overrides the timer: a session whose
/// entry mode is no longer active is stopped immediately. Otherwise
/// sessions are left alone until their next due check, then judged on file
/// growth alone. A missing file is tolerated - it may legitimately not
/// exist yet moments after spawn.
pub async fn check_sessions(
    sessions: &SessionSet,
    store: &InclusionStore,
    capture_dir: &Path,
    check_interval_secs: i64,
    now: i64,
) {
    let checks = sessions.snapshot().into_iter().map(|session| async move {
        let revoked = store
            .mode_for(session.uid)
            .is_some_and(|mode| !mode.is_active(now));
        if revoked {
            tracing::info!(
                source.uid = session.uid,
                source.name = %session.name,
                "Inclusion revoked, stopping capture"
            );
            sessions.stop(session.uid);
            return;
        }

        if session.check_after > now {
            return;
        }

        let part = part_path(capture_dir, &session.filename);
        let size = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                tracing::error!(
                    source.name = %session.name,
                    path = %part.display(),
                    "Failed to stat capture file: {e}"
                );
                return;
            }
        };

        if size > session.last_size {
            tracing::debug!(
                source.uid = session.uid,
                source.name = %session.name,
                size,
                "Session is alive"
            );
            sessions.record_alive(session.uid, size, now + check_interval_secs);
        } else {
            // Unchanged or shrunk. Shrinking should never happen; either
            // way the process is not making progress.
            tracing::error!(
                source.uid = session.uid,
                source.name = %session.name,
                size,
                last_size = session.last_size,
                "Capture process is dead, stopping"
            );
            sessions.stop(session.uid);
        }
    });

    join_all(checks).await;
}
