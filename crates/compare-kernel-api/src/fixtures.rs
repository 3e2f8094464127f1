use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use compare_kernel_core::{FetchError, Identifier, PricingFacet, VehicleRecord};
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::resolver::RecordSource;
use crate::slot::SlotStorage;

pub(crate) fn id(raw: &str) -> Identifier {
    match Identifier::parse(raw) {
        Ok(id) => id,
        Err(err) => panic!("fixture identifier should parse: {err}"),
    }
}

pub(crate) fn ids(raw: &[u64]) -> Vec<Identifier> {
    raw.iter().copied().map(Identifier::from).collect()
}

pub(crate) fn record(raw: u64, pricing: PricingFacet) -> VehicleRecord {
    VehicleRecord {
        id: Identifier::from(raw),
        pricing,
        display: serde_json::json!({ "title": format!("vehicle {raw}") }),
    }
}

/// Slot whose reads and writes can be made to fail; clones share state.
#[derive(Debug, Clone, Default)]
pub(crate) struct FlakySlot {
    values: Arc<Mutex<BTreeMap<String, String>>>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl FlakySlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn value(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }
}

impl SlotStorage for FlakySlot {
    fn read_slot(&self, key: &str) -> Result<Option<String>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("slot medium is unreadable"));
        }
        Ok(self.values.lock().get(key).cloned())
    }

    fn write_slot(&mut self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("quota exceeded"));
        }
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// In-memory record source counting fetches per identifier.
///
/// Gated identifiers block until their gate is notified; slow identifiers sleep first.
#[derive(Default)]
pub(crate) struct FixtureSource {
    records: Mutex<BTreeMap<Identifier, VehicleRecord>>,
    failing: Mutex<BTreeSet<Identifier>>,
    gates: Mutex<BTreeMap<Identifier, Arc<Notify>>>,
    slow: Mutex<BTreeMap<Identifier, Duration>>,
    calls: Mutex<Vec<Identifier>>,
}

impl FixtureSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_record(self, record: VehicleRecord) -> Self {
        self.records.lock().insert(record.id.clone(), record);
        self
    }

    pub(crate) fn fail(&self, id: &Identifier, fail: bool) {
        let mut failing = self.failing.lock();
        if fail {
            failing.insert(id.clone());
        } else {
            failing.remove(id);
        }
    }

    pub(crate) fn gate(&self, id: &Identifier) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.gates.lock().insert(id.clone(), Arc::clone(&gate));
        gate
    }

    pub(crate) fn slow(&self, id: &Identifier, delay: Duration) {
        self.slow.lock().insert(id.clone(), delay);
    }

    pub(crate) fn calls_for(&self, id: &Identifier) -> usize {
        self.calls.lock().iter().filter(|call| *call == id).count()
    }
}

#[async_trait]
impl RecordSource for FixtureSource {
    async fn fetch(&self, id: &Identifier) -> Result<VehicleRecord, FetchError> {
        self.calls.lock().push(id.clone());

        let gate = self.gates.lock().get(id).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let delay = self.slow.lock().get(id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.failing.lock().contains(id) {
            return Err(FetchError::Transport(format!("connection reset fetching {id}")));
        }
        self.records.lock().get(id).cloned().ok_or_else(|| FetchError::NotFound(id.clone()))
    }
}
