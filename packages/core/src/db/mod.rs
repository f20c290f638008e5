//! Storage Layer
//!
//! Everything that reads or writes the node tree goes through the
//! [`NodeStore`] trait:
//!
//! - [`MemoryStore`] - in-process store, one lock per space
//! - [`LibsqlStore`] - embedded libsql database (feature `libsql`, on by default)
//! - [`SortKeyAllocator`] - gapped integer sort keys and group renumbering,
//!   shared by both backends

mod error;
pub mod memory_store;
pub mod node_store;
pub mod sort_allocator;

#[cfg(feature = "libsql")]
pub mod libsql_store;

pub use error::{StoreError, StoreResult};
pub use memory_store::MemoryStore;
pub use node_store::NodeStore;
pub use sort_allocator::{
    KeyspaceExhausted, Placement, SiblingKey, SortKeyAllocator, DEFAULT_SORT_GAP,
};

#[cfg(feature = "libsql")]
pub use libsql_store::LibsqlStore;
