pub mod maintenance;
#[cfg(test)]
pub mod memory;
pub mod models;
pub mod sqlite;
pub mod store;

pub use sqlite::SqliteStore;
pub use store::Store;
