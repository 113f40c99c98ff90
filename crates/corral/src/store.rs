//! Durable inclusion list and pending request queue.
//!
//! The state file is a single JSON document `{ "models": [...], "queue":
//! [...] }`, rewritten wholesale on each flush via temp-file + rename. Mode
//! keeps the historical numeric wire format: `1` included, `0` excluded,
//! `-1` deleted, anything greater than one an absolute unix timestamp
//! meaning included-until-expiry.
//!
//! Entries are never removed: a delete request sets mode `-1` so the row
//! survives as history. Dedup (first occurrence wins) is enforced on every
//! flush.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Desired inclusion state for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i64", into = "i64")]
pub enum Mode {
    /// Record whenever online.
    Included,
    /// Do not record.
    Excluded,
    /// Forget this source (row is retained, snapshot hides it).
    Deleted,
    /// Record until the given unix timestamp passes.
    Until(i64),
}

impl Mode {
    /// Whether this mode asks for capture at `now`.
    ///
    /// An `Until` entry stays active through its expiry second; the
    /// resolver flips it to `Excluded` once the timestamp is in the past.
    pub fn is_active(self, now: i64) -> bool {
        match self {
            Mode::Included => true,
            Mode::Until(deadline) => deadline >= now,
            Mode::Excluded | Mode::Deleted => false,
        }
    }

    /// Whether this is an `Until` entry whose deadline has passed.
    pub fn is_expired(self, now: i64) -> bool {
        matches!(self, Mode::Until(deadline) if deadline < now)
    }
}

impl From<i64> for Mode {
    fn from(raw: i64) -> Self {
        match raw {
            1 => Mode::Included,
            -1 => Mode::Deleted,
            raw if raw > 1 => Mode::Until(raw),
            _ => Mode::Excluded,
        }
    }
}

impl From<Mode> for i64 {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Included => 1,
            Mode::Excluded => 0,
            Mode::Deleted => -1,
            Mode::Until(deadline) => deadline,
        }
    }
}

/// One row of the inclusion list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InclusionEntry {
    pub uid: u64,

    /// Display name, cached the first time it resolves. Never overwritten.
    #[serde(rename = "nm", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub mode: Mode,
}

/// How a control request names its source before the id is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKey {
    ById(u64),
    ByName(String),
}

/// A control request that has not yet been applied to the inclusion list.
///
/// Requests naming an unknown source stay queued across cycles (and across
/// restarts, via the state file) until the name shows up in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PendingRequestWire", into = "PendingRequestWire")]
pub struct PendingRequest {
    pub key: SourceKey,
    pub mode: Mode,
}

/// Wire shape of a queued request: `{uid, mode}` or `{nm, mode}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PendingRequestWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nm: Option<String>,
    mode: Mode,
}

impl TryFrom<PendingRequestWire> for PendingRequest {
    type Error = String;

    fn try_from(wire: PendingRequestWire) -> Result<Self, Self::Error> {
        let key = match (wire.uid, wire.nm) {
            (Some(uid), _) => SourceKey::ById(uid),
            (None, Some(nm)) => SourceKey::ByName(nm),
            (None, None) => return Err("pending request needs uid or nm".to_string()),
        };
        Ok(Self {
            key,
            mode: wire.mode,
        })
    }
}

impl From<PendingRequest> for PendingRequestWire {
    fn from(request: PendingRequest) -> Self {
        match request.key {
            SourceKey::ById(uid) => Self {
                uid: Some(uid),
                nm: None,
                mode: request.mode,
            },
            SourceKey::ByName(nm) => Self {
                uid: None,
                nm: Some(nm),
                mode: request.mode,
            },
        }
    }
}

/// On-disk layout of the state file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    models: Vec<InclusionEntry>,
    #[serde(default)]
    queue: Vec<PendingRequest>,
}

/// The inclusion list plus its dirty flag and file path.
///
/// Owned by the supervisor loop; the control API never touches it directly,
/// it only enqueues pending requests.
pub struct InclusionStore {
    path: PathBuf,
    entries: Vec<InclusionEntry>,
    dirty: bool,
}

impl InclusionStore {
    /// Load the store from `path`, returning any persisted pending
    /// requests alongside it. A missing file is an empty store.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, Vec<PendingRequest>)> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let json = std::fs::read_to_string(&path)?;
            serde_json::from_str::<StateFile>(&json)?
        } else {
            StateFile::default()
        };

        Ok((
            Self {
                path,
                entries: state.models,
                dirty: false,
            },
            state.queue,
        ))
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Self {
        Self {
            path: PathBuf::new(),
            entries: Vec::new(),
            dirty: false,
        }
    }

    pub fn entries(&self) -> &[InclusionEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn mode_for(&self, uid: u64) -> Option<Mode> {
        self.entries.iter().find(|e| e.uid == uid).map(|e| e.mode)
    }

    pub fn name_for(&self, uid: u64) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.uid == uid)
            .and_then(|e| e.name.as_deref())
    }

    /// Insert or update the entry for `uid` and mark the store dirty.
    pub fn upsert(&mut self, uid: u64, mode: Mode) {
        match self.entries.iter_mut().find(|e| e.uid == uid) {
            Some(entry) => entry.mode = mode,
            None => self.entries.push(InclusionEntry {
                uid,
                name: None,
                mode,
            }),
        }
        self.dirty = true;
    }

    /// Cache the display name for `uid`, only if none was recorded yet.
    pub fn set_name_once(&mut self, uid: u64, name: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.uid == uid) {
            if entry.name.is_none() {
                entry.name = Some(name.to_string());
                self.dirty = true;
            }
        }
    }

    /// Force an entry's mode without going through a request (expiry).
    pub fn force_mode(&mut self, uid: u64, mode: Mode) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.uid == uid) {
            if entry.mode != mode {
                entry.mode = mode;
                self.dirty = true;
            }
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Write the store (and the given request queue) to disk if dirty.
    ///
    /// Entries are deduplicated by identifier first, first occurrence wins.
    /// The dirty flag is cleared only after a successful write, so a failed
    /// flush retries on the next cycle.
    pub fn flush(&mut self, queue: &[PendingRequest]) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }

        self.dedup();

        let state = StateFile {
            models: self.entries.clone(),
            queue: queue.to_vec(),
        };
        let json = serde_json::to_string_pretty(&state)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        // Atomic write: write to temp, then rename
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, json)?;
        std::fs::rename(&temp_path, &self.path)?;

        self.dirty = false;
        Ok(())
    }

    fn dedup(&mut self) {
        let mut seen = HashSet::new();
        self.entries.retain(|entry| seen.insert(entry.uid));
    }
}
