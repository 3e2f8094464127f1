use std::sync::Arc;

use anyhow::Result;
use compare_kernel_core::{
    Comparison, Identifier, Reconciliation, Resolution, SelectionError, SelectionSet,
    ShareableAddress, StartupSource,
};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::address::AddressSynchronizer;
use crate::config::EngineConfig;
use crate::resolver::{spawn_resolution, DetailResolver, RecordSource, ResolutionFeed};
use crate::selection::{
    HydrationReport, Mutation, PersistenceWarning, SelectionSnapshot, SelectionStore,
};
use crate::slot::SlotStorage;

/// How the session's selection was established.
#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub hydration: HydrationReport,
    pub reconciliation: Reconciliation,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<PersistenceWarning>,
}

/// Result of one accepted mutation, after storage and address have been brought in line.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MutationOutcome {
    pub changed: bool,
    pub revision: u64,
    pub selection: SelectionSet,
    pub count: usize,
    pub address: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dropped: Vec<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<PersistenceWarning>,
}

/// Single entry point wiring the selection store, the address synchronizer and the resolver.
///
/// The selection is owned here; the address and the resolved cache follow it on every
/// effective mutation.
pub struct CompareEngine<S, R> {
    store: SelectionStore<S>,
    address: AddressSynchronizer,
    resolver: Arc<DetailResolver<R>>,
}

impl<S, R> CompareEngine<S, R>
where
    S: SlotStorage,
    R: RecordSource + 'static,
{
    /// Hydrate from `storage`, reconcile with `opened_at` and publish the starting address.
    ///
    /// # Errors
    /// Returns an error when `config` is invalid. Storage problems are reported in the
    /// [`StartupReport`], never raised.
    pub fn start(
        storage: S,
        source: R,
        config: &EngineConfig,
        opened_at: Option<&str>,
    ) -> Result<(Self, StartupReport)> {
        config.validate()?;

        let (mut store, hydration) = SelectionStore::hydrate(storage, config.slot_key.clone());
        let mut address =
            AddressSynchronizer::new(config.address_param.clone(), &config.base_address);
        let reconciliation = address.reconcile(store.selection(), opened_at);

        let warning = match reconciliation.source {
            StartupSource::Address => {
                let (mutation, _) = store.replace(reconciliation.selection.as_slice().to_vec());
                mutation.warning
            }
            StartupSource::Persisted => None,
        };
        let current = address.sync(store.selection()).to_string();

        info!(
            source = ?reconciliation.source,
            count = store.count(),
            address = %current,
            "selection session started"
        );

        let resolver = Arc::new(DetailResolver::new(source, config.fetch_timeout()));
        let engine = Self { store, address, resolver };
        let report = StartupReport { hydration, reconciliation, address: current, warning };
        Ok((engine, report))
    }

    /// # Errors
    /// Returns [`SelectionError::CapacityExceeded`] or [`SelectionError::DuplicateMember`].
    pub fn add(&mut self, id: Identifier) -> Result<MutationOutcome, SelectionError> {
        let mutation = self.store.add(id)?;
        Ok(self.propagate(mutation, Vec::new()))
    }

    /// Parse `raw` and add it.
    ///
    /// # Errors
    /// Returns [`SelectionError::InvalidIdentifier`] or any error from [`Self::add`].
    pub fn add_raw(&mut self, raw: &str) -> Result<MutationOutcome, SelectionError> {
        self.add(Identifier::parse(raw)?)
    }

    pub fn remove(&mut self, id: &Identifier) -> MutationOutcome {
        let mutation = self.store.remove(id);
        self.propagate(mutation, Vec::new())
    }

    pub fn clear(&mut self) -> MutationOutcome {
        let mutation = self.store.clear();
        self.propagate(mutation, Vec::new())
    }

    /// Follow a shared address. A non-empty selection parameter replaces the selection; an
    /// absent or empty one leaves it untouched.
    pub fn navigate(&mut self, address: &str) -> MutationOutcome {
        let candidate = self.address.navigate(address).filter(|ids| !ids.is_empty());
        match candidate {
            Some(candidate) => {
                let (mutation, normalized) = self.store.replace(candidate);
                let mut dropped = normalized.duplicates;
                dropped.extend(normalized.overflow);
                self.propagate(mutation, dropped)
            }
            None => {
                let mutation = Mutation {
                    changed: false,
                    revision: self.store.revision(),
                    warning: self.store.flush(),
                };
                self.propagate(mutation, Vec::new())
            }
        }
    }

    /// Retry a persistence write that failed earlier.
    pub fn flush(&mut self) -> Option<PersistenceWarning> {
        self.store.flush()
    }

    #[must_use]
    pub fn contains(&self, id: &Identifier) -> bool {
        self.store.contains(id)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.store.count()
    }

    #[must_use]
    pub fn selection(&self) -> &SelectionSet {
        self.store.selection()
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        self.store.revision()
    }

    #[must_use]
    pub fn address(&self) -> &ShareableAddress {
        self.address.current()
    }

    #[must_use]
    pub fn resolver(&self) -> &Arc<DetailResolver<R>> {
        &self.resolver
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SelectionSnapshot> {
        self.store.subscribe()
    }

    #[must_use]
    pub fn storage(&self) -> &S {
        self.store.storage()
    }

    /// Resolve the current selection.
    pub async fn resolve(&self) -> Resolution {
        let selection = self.store.selection().clone();
        self.resolver.resolve(&selection).await
    }

    /// Resolve the current selection and mark the best value.
    ///
    /// # Errors
    /// Returns [`SelectionError::InsufficientMembers`] when fewer than two vehicles are
    /// selected. Individual fetch failures are reported inside the [`Comparison`].
    pub async fn compare(&self) -> Result<Comparison, SelectionError> {
        self.store.selection().ensure_comparable()?;
        Ok(Comparison::from(self.resolve().await))
    }

    /// Start re-resolving in the background on every selection change.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime, since the loop is started with
    /// [`tokio::spawn`].
    #[must_use]
    pub fn spawn_resolution(&self) -> ResolutionFeed {
        spawn_resolution(Arc::clone(&self.resolver), self.store.subscribe())
    }

    fn propagate(&mut self, mutation: Mutation, dropped: Vec<Identifier>) -> MutationOutcome {
        if mutation.changed {
            self.resolver.retain(self.store.selection());
        }
        let address = self.address.sync(self.store.selection()).to_string();
        debug!(
            changed = mutation.changed,
            revision = mutation.revision,
            address = %address,
            "selection propagated"
        );

        MutationOutcome {
            changed: mutation.changed,
            revision: mutation.revision,
            selection: self.store.selection().clone(),
            count: self.store.count(),
            address,
            dropped,
            warning: mutation.warning,
        }
    }
}
