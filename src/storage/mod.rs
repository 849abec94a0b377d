//! Contact storage.
//!
//! [`ContactStore`] is the interface the resolver consumes. Two backends ship
//! with the crate: [`InMemoryContactStore`] and, behind the `persistent`
//! feature, a WAL-backed on-disk store.

mod index;
mod memory;
mod traits;

#[cfg(feature = "persistent")]
pub mod persistent;

pub use memory::InMemoryContactStore;
pub use traits::{ContactStore, StorageError};

#[cfg(feature = "persistent")]
pub use persistent::{open_database, PersistentConfig, PersistentContactStore};
