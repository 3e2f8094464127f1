use compare_kernel_core::{
    decode_persisted, encode_persisted, Identifier, Normalized, SelectionError, SelectionSet,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::slot::SlotStorage;

/// Advisory raised when the durable slot rejected a write. The in-memory selection stays
/// authoritative and the write is retried on the next mutation or flush.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistenceWarning {
    pub code: String,
    pub slot_key: String,
    pub message: String,
}

impl PersistenceWarning {
    pub const CODE: &'static str = "PERSISTENCE_WRITE_FAILURE";

    fn new(slot_key: &str, err: &anyhow::Error) -> Self {
        Self {
            code: Self::CODE.to_string(),
            slot_key: slot_key.to_string(),
            message: format!("{err:#}"),
        }
    }
}

/// What startup found in the durable slot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HydrationReport {
    pub slot_key: String,
    pub restored: usize,
    pub malformed: bool,
    pub discarded: usize,
    pub read_error: Option<String>,
}

/// Published after every effective change.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SelectionSnapshot {
    pub revision: u64,
    pub selection: SelectionSet,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Mutation {
    pub changed: bool,
    pub revision: u64,
    pub warning: Option<PersistenceWarning>,
}

/// Authoritative owner of the current selection.
///
/// Every effective change bumps the revision, is written through to the slot and is published
/// on a watch channel. No-op mutations publish nothing.
pub struct SelectionStore<S> {
    storage: S,
    slot_key: String,
    selection: SelectionSet,
    revision: u64,
    dirty: bool,
    changes: watch::Sender<SelectionSnapshot>,
}

impl<S: SlotStorage> SelectionStore<S> {
    /// Load the selection persisted under `slot_key`.
    ///
    /// Unreadable or malformed slot content yields an empty (or partially recovered) selection
    /// and is reported, never raised.
    pub fn hydrate(storage: S, slot_key: impl Into<String>) -> (Self, HydrationReport) {
        let slot_key = slot_key.into();
        let mut report = HydrationReport {
            slot_key: slot_key.clone(),
            restored: 0,
            malformed: false,
            discarded: 0,
            read_error: None,
        };

        let selection = match storage.read_slot(&slot_key) {
            Ok(Some(raw)) => {
                let hydrated = decode_persisted(&raw);
                if hydrated.malformed {
                    warn!(
                        slot_key = %slot_key,
                        discarded = hydrated.discarded,
                        "persisted selection was malformed; recovered what was usable"
                    );
                }
                report.malformed = hydrated.malformed;
                report.discarded = hydrated.discarded;
                hydrated.selection
            }
            Ok(None) => SelectionSet::new(),
            Err(err) => {
                warn!(
                    slot_key = %slot_key,
                    error = %format!("{err:#}"),
                    "failed to read persisted selection"
                );
                report.read_error = Some(format!("{err:#}"));
                SelectionSet::new()
            }
        };
        report.restored = selection.len();

        let (changes, _) =
            watch::channel(SelectionSnapshot { revision: 0, selection: selection.clone() });
        let store = Self { storage, slot_key, selection, revision: 0, dirty: false, changes };
        (store, report)
    }

    /// Append `id` to the selection.
    ///
    /// # Errors
    /// Returns [`SelectionError::CapacityExceeded`] or [`SelectionError::DuplicateMember`]; the
    /// selection is unchanged and nothing is published.
    pub fn add(&mut self, id: Identifier) -> Result<Mutation, SelectionError> {
        self.selection.try_add(id)?;
        Ok(self.commit(true))
    }

    /// Remove `id`. Removing an absent member is a successful no-op.
    pub fn remove(&mut self, id: &Identifier) -> Mutation {
        let changed = self.selection.remove(id);
        self.commit(changed)
    }

    pub fn clear(&mut self) -> Mutation {
        let changed = self.selection.clear();
        self.commit(changed)
    }

    /// Replace the whole selection with a normalized `candidates` list.
    pub fn replace(&mut self, candidates: Vec<Identifier>) -> (Mutation, Normalized) {
        let normalized = SelectionSet::normalize(candidates);
        let changed = normalized.selection != self.selection;
        if changed {
            self.selection = normalized.selection.clone();
        }
        (self.commit(changed), normalized)
    }

    /// Retry a write that previously failed. Returns `None` when the slot is in sync.
    pub fn flush(&mut self) -> Option<PersistenceWarning> {
        if self.dirty {
            self.persist()
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains(&self, id: &Identifier) -> bool {
        self.selection.contains(id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.selection.len()
    }

    #[must_use]
    pub fn selection(&self) -> &SelectionSet {
        &self.selection
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// True while the slot lags behind the in-memory selection.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[must_use]
    pub fn slot_key(&self) -> &str {
        &self.slot_key
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SelectionSnapshot> {
        self.changes.subscribe()
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    fn commit(&mut self, changed: bool) -> Mutation {
        if changed {
            self.revision += 1;
            self.dirty = true;
        }

        let warning = if self.dirty { self.persist() } else { None };

        if changed {
            debug!(revision = self.revision, count = self.selection.len(), "selection changed");
            self.changes.send_replace(SelectionSnapshot {
                revision: self.revision,
                selection: self.selection.clone(),
            });
        }

        Mutation { changed, revision: self.revision, warning }
    }

    fn persist(&mut self) -> Option<PersistenceWarning> {
        let raw = encode_persisted(&self.selection);
        match self.storage.write_slot(&self.slot_key, &raw) {
            Ok(()) => {
                self.dirty = false;
                None
            }
            Err(err) => {
                warn!(
                    slot_key = %self.slot_key,
                    error = %format!("{err:#}"),
                    "failed to persist selection"
                );
                Some(PersistenceWarning::new(&self.slot_key, &err))
            }
        }
    }
}
