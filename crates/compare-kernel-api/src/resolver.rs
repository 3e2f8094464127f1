use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use compare_kernel_core::{
    EntryState, FetchError, Identifier, Resolution, ResolvedCache, SelectionSet, Settlement,
    VehicleRecord,
};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::selection::SelectionSnapshot;

/// Where full vehicle records come from.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Fetch the record for `id`.
    ///
    /// # Errors
    /// Returns a [`FetchError`] describing why the record is unavailable.
    async fn fetch(&self, id: &Identifier) -> Result<VehicleRecord, FetchError>;
}

#[async_trait]
impl<T: RecordSource + ?Sized> RecordSource for Arc<T> {
    async fn fetch(&self, id: &Identifier) -> Result<VehicleRecord, FetchError> {
        (**self).fetch(id).await
    }
}

/// Turns a selection into full records, fetching each identifier at most once while it stays
/// selected.
///
/// Fetches for one call run concurrently. A result that arrives after its identifier was
/// evicted is discarded; a failed identifier is fetched again on the next call.
pub struct DetailResolver<R> {
    source: R,
    fetch_timeout: Duration,
    cache: Mutex<ResolvedCache>,
}

impl<R: RecordSource> DetailResolver<R> {
    pub fn new(source: R, fetch_timeout: Duration) -> Self {
        Self { source, fetch_timeout, cache: Mutex::new(ResolvedCache::new()) }
    }

    /// Evict every cached entry that is not part of `selection`.
    pub fn retain(&self, selection: &SelectionSet) -> Vec<Identifier> {
        let evicted = self.cache.lock().retain_selection(selection);
        if !evicted.is_empty() {
            debug!(evicted = ?evicted, "evicted records no longer selected");
        }
        evicted
    }

    /// Resolve `selection`, returning records in selection order plus the identifiers that
    /// could not be fetched. Never fails as a whole.
    pub async fn resolve(&self, selection: &SelectionSet) -> Resolution {
        let pending = {
            let mut cache = self.cache.lock();
            let evicted = cache.retain_selection(selection);
            if !evicted.is_empty() {
                debug!(evicted = ?evicted, "evicted records no longer selected");
            }
            selection.iter().filter(|id| cache.begin(id)).cloned().collect::<Vec<_>>()
        };

        if !pending.is_empty() {
            debug!(count = pending.len(), "fetching vehicle records");
        }

        let outcomes = join_all(pending.into_iter().map(|id| async move {
            let outcome = self.fetch_one(&id).await;
            (id, outcome)
        }))
        .await;

        let mut cache = self.cache.lock();
        for (id, outcome) in outcomes {
            if let Err(err) = &outcome {
                warn!(id = %id, error = %err, code = err.code(), "vehicle record fetch failed");
            }
            if cache.settle(&id, outcome) == Settlement::Stale {
                debug!(id = %id, "discarded record for deselected vehicle");
            }
        }
        cache.consolidate(selection)
    }

    #[must_use]
    pub fn state(&self, id: &Identifier) -> Option<EntryState> {
        self.cache.lock().state(id)
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    async fn fetch_one(&self, id: &Identifier) -> Result<VehicleRecord, FetchError> {
        let record = tokio::time::timeout(self.fetch_timeout, self.source.fetch(id))
            .await
            .map_err(|_| FetchError::Timeout)??;

        if record.id != *id {
            return Err(FetchError::Malformed(format!(
                "requested vehicle {id} but record store returned {}",
                record.id
            )));
        }
        Ok(record)
    }
}

/// Resolution published for one selection revision.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolutionUpdate {
    pub revision: u64,
    pub resolution: Resolution,
}

/// Handle on the background resolution loop started by [`spawn_resolution`].
///
/// Dropping the feed stops the loop.
pub struct ResolutionFeed {
    updates: watch::Receiver<Option<ResolutionUpdate>>,
    handle: JoinHandle<()>,
}

impl ResolutionFeed {
    #[must_use]
    pub fn latest(&self) -> Option<ResolutionUpdate> {
        self.updates.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<ResolutionUpdate>> {
        self.updates.clone()
    }

    /// Wait until a resolution for `revision` (or a later one) has been published.
    ///
    /// Returns `None` when the loop stopped first.
    pub async fn wait_for_revision(&mut self, revision: u64) -> Option<ResolutionUpdate> {
        self.updates
            .wait_for(|update| update.as_ref().is_some_and(|update| update.revision >= revision))
            .await
            .ok()
            .and_then(|update| (*update).clone())
    }
}

impl Drop for ResolutionFeed {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Re-resolve on every selection change.
///
/// Each change starts its own resolution task. A result is published only if no newer revision
/// has been published already, so a slow resolve can never overwrite a fresher one.
///
/// # Panics
/// Panics when called outside a Tokio runtime.
pub fn spawn_resolution<R>(
    resolver: Arc<DetailResolver<R>>,
    mut changes: watch::Receiver<SelectionSnapshot>,
) -> ResolutionFeed
where
    R: RecordSource + 'static,
{
    let (updates, receiver) = watch::channel(None);
    let updates = Arc::new(updates);

    let handle = tokio::spawn(async move {
        let initial = changes.borrow_and_update().clone();
        resolve_revision(&resolver, &updates, initial);
        while changes.changed().await.is_ok() {
            let snapshot = changes.borrow_and_update().clone();
            resolve_revision(&resolver, &updates, snapshot);
        }
        debug!("selection channel closed; resolution loop stopped");
    });

    ResolutionFeed { updates: receiver, handle }
}

fn resolve_revision<R>(
    resolver: &Arc<DetailResolver<R>>,
    updates: &Arc<watch::Sender<Option<ResolutionUpdate>>>,
    snapshot: SelectionSnapshot,
) where
    R: RecordSource + 'static,
{
    let resolver = Arc::clone(resolver);
    let updates = Arc::clone(updates);
    tokio::spawn(async move {
        let resolution = resolver.resolve(&snapshot.selection).await;
        let revision = snapshot.revision;
        let published = updates.send_if_modified(|current| {
            if current.as_ref().is_some_and(|latest| latest.revision > revision) {
                return false;
            }
            *current = Some(ResolutionUpdate { revision, resolution });
            true
        });
        if !published {
            debug!(revision, "dropped superseded resolution");
        }
    });
}
