pub mod bootstrap;
pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use store::{ChatDirectory, PermissionStore, StoreError, StoreResult, UnreadStore};
