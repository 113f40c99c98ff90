//! Capture scheduler: diffs desired captures against active sessions.
//!
//! Pure selection only. The session supervisor issues the actual spawns and
//! kills; this module just says which.

use crate::roster::Source;
use crate::store::InclusionStore;
use std::collections::HashSet;

/// What one cycle wants changed.
#[derive(Debug, Default)]
pub struct Plan {
    /// Sources that should be capturing but are not.
    pub to_start: Vec<Source>,
    /// Active sessions whose inclusion has been revoked.
    pub to_stop: Vec<u64>,
}

/// Compute this cycle's plan.
///
/// A source starts only if it is online this cycle, its entry mode is
/// active, and its online state is actually capturable. Sources already
/// capturing are never double-started. Active sessions whose entry mode is
/// no longer active are flagged for stop.
pub fn select(
    sources: &[Source],
    store: &InclusionStore,
    active: &[u64],
    now: i64,
) -> Plan {
    let active: HashSet<u64> = active.iter().copied().collect();
    let mut plan = Plan::default();

    for entry in store.entries() {
        if !entry.mode.is_active(now) {
            continue;
        }

        // Offline this cycle - nothing to do.
        let Some(source) = sources.iter().find(|s| s.uid == entry.uid) else {
            continue;
        };

        if !source.state.capturable() {
            tracing::info!(
                source.uid = source.uid,
                source.name = %source.name,
                state = ?source.state,
                "Source is away or in a private show, skipping"
            );
            continue;
        }

        if active.contains(&source.uid) {
            tracing::debug!(
                source.uid = source.uid,
                source.name = %source.name,
                "Already capturing"
            );
            continue;
        }

        plan.to_start.push(source.clone());
    }

    for uid in &active {
        if let Some(mode) = store.mode_for(*uid) {
            if !mode.is_active(now) {
                plan.to_stop.push(*uid);
            }
        }
    }

    plan
}
