pub mod defs;
pub mod memory;
pub mod state;

pub use defs::{Item, ItemStore, StoreError, StoreResult};
pub use memory::MemoryStore;
pub use state::SqliteStore;
