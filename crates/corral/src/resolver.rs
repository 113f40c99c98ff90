//! Mode resolver: drains the pending request queue against the current
//! roster and applies time-based expiry to the inclusion list.

use crate::roster::Source;
use crate::store::{InclusionStore, Mode, PendingRequest, SourceKey};

/// Apply every pending request that can be resolved against `sources`,
/// returning the requests that must wait for a future cycle.
///
/// Requests are applied in enqueue order, so two requests resolving to the
/// same identifier within one cycle end with the later one's mode
/// (last-write-wins). A name that matches nothing stays queued - a source
/// that never comes online is simply never resolved.
pub fn resolve(
    queue: Vec<PendingRequest>,
    sources: &[Source],
    store: &mut InclusionStore,
) -> Vec<PendingRequest> {
    let mut unresolved = Vec::new();

    for request in queue {
        let (uid, name) = match &request.key {
            SourceKey::ById(uid) => (*uid, None),
            SourceKey::ByName(name) => {
                match sources.iter().find(|s| s.name == *name) {
                    Some(source) => (source.uid, Some(name.as_str())),
                    None => {
                        unresolved.push(request);
                        continue;
                    }
                }
            }
        };

        store.upsert(uid, request.mode);
        if let Some(name) = name {
            store.set_name_once(uid, name);
        }

        tracing::debug!(
            source.uid = uid,
            mode = ?request.mode,
            "Request resolved"
        );
    }

    unresolved
}

/// Flip every included-until entry whose deadline has passed to excluded,
/// and cache first-seen display names from the roster.
pub fn apply_expiry(store: &mut InclusionStore, sources: &[Source], now: i64) {
    let expired: Vec<u64> = store
        .entries()
        .iter()
        .filter(|e| e.mode.is_expired(now))
        .map(|e| e.uid)
        .collect();

    for uid in expired {
        let label = store
            .name_for(uid)
            .map(str::to_string)
            .unwrap_or_else(|| uid.to_string());
        tracing::info!(source.uid = uid, source.name = %label, "Inclusion expired");
        store.force_mode(uid, Mode::Excluded);
    }

    // First-seen display names come from whichever cycle first shows the
    // source online.
    for source in sources {
        if store.mode_for(source.uid).is_some() {
            store.set_name_once(source.uid, &source.name);
        }
    }
}
