//! Selection synchronization engine: keeps a bounded vehicle selection consistent across the
//! durable slot, the shareable address and the resolved record cache.

mod address;
mod config;
mod engine;
mod http;
mod resolver;
mod selection;
mod slot;

#[cfg(test)]
pub(crate) mod fixtures;

pub use address::AddressSynchronizer;
pub use config::{EngineConfig, DEFAULT_BASE_ADDRESS, DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_SLOT_KEY};
pub use engine::{CompareEngine, MutationOutcome, StartupReport};
pub use http::HttpRecordSource;
pub use resolver::{
    spawn_resolution, DetailResolver, RecordSource, ResolutionFeed, ResolutionUpdate,
};
pub use selection::{
    HydrationReport, Mutation, PersistenceWarning, SelectionSnapshot, SelectionStore,
};
pub use slot::{open_sqlite_slots, MemorySlot, SlotStorage};
