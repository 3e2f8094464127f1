use compare_kernel_core::{
    reconcile_startup, Identifier, Reconciliation, SelectionSet, ShareableAddress,
};
use tracing::debug;

/// Keeps the shareable address in step with the selection.
///
/// The synchronizer owns the current address. Only the selection parameter is ever rewritten;
/// path, other parameters and fragment come from the last address navigated to.
#[derive(Debug, Clone)]
pub struct AddressSynchronizer {
    param: String,
    current: ShareableAddress,
}

impl AddressSynchronizer {
    #[must_use]
    pub fn new(param: impl Into<String>, base: &str) -> Self {
        Self { param: param.into(), current: ShareableAddress::parse(base) }
    }

    #[must_use]
    pub fn param(&self) -> &str {
        &self.param
    }

    #[must_use]
    pub fn current(&self) -> &ShareableAddress {
        &self.current
    }

    /// Address encoding `selection` on top of the current address.
    #[must_use]
    pub fn to_address(&self, selection: &SelectionSet) -> ShareableAddress {
        compare_kernel_core::to_address(selection, &self.current, &self.param)
    }

    /// Candidate identifiers carried by `address`; `None` when it has no selection parameter.
    #[must_use]
    pub fn from_address(&self, address: &str) -> Option<Vec<Identifier>> {
        compare_kernel_core::from_address(address, &self.param)
    }

    /// Adopt `address` as the current address and return its selection candidate.
    pub fn navigate(&mut self, address: &str) -> Option<Vec<Identifier>> {
        self.current = ShareableAddress::parse(address);
        self.current.selection(&self.param)
    }

    /// Startup rule: navigate to `opened_at` (when given) and decide between its selection
    /// and the persisted one.
    pub fn reconcile(
        &mut self,
        persisted: &SelectionSet,
        opened_at: Option<&str>,
    ) -> Reconciliation {
        let candidate = opened_at.and_then(|address| self.navigate(address));
        let reconciliation = reconcile_startup(persisted, candidate);
        debug!(
            source = ?reconciliation.source,
            dropped = reconciliation.dropped.len(),
            "reconciled startup selection"
        );
        reconciliation
    }

    /// Rewrite the current address from `selection`.
    pub fn sync(&mut self, selection: &SelectionSet) -> &ShareableAddress {
        self.current = self.to_address(selection);
        &self.current
    }
}
