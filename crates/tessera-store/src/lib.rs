pub mod memory;
pub mod registry;
pub mod sqlite;
pub mod traits;

use std::sync::Arc;

use tessera_core::config::{AppConfig, StoreBackend};
use tessera_core::error::Result;

pub use memory::MemoryStore;
pub use registry::RunRegistry;
pub use sqlite::SqliteStore;
pub use traits::RunStore;

/// Open the backend selected by `[store]`.
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn RunStore>> {
    match config.store.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StoreBackend::Sqlite => Ok(Arc::new(SqliteStore::open(&config.store_path())?)),
    }
}
