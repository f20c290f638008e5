//! PageTree Core
//!
//! Ordered tree engine for pages and blocks inside spaces. Every node sits in
//! a sibling group (`space_id`, `parent_id`) and carries an integer sort key
//! unique within that group.
//!
//! # Architecture
//!
//! - **Gapped sort keys**: appends leave room (`sort_gap`, default 1000) so
//!   most inserts touch a single row; collisions renumber the group
//! - **Atomic stores**: each move, reorder and create is one store
//!   transaction, including any renumbered siblings
//! - **libsql**: embedded SQLite-compatible database (feature `libsql`),
//!   with an in-memory store for tests and embedding
//!
//! # Modules
//!
//! - [`models`] - Node, creation input, payload updates, tree view
//! - [`behaviors`] - Parent/type legality and cycle checks
//! - [`db`] - `NodeStore` trait, sort key allocator, store backends
//! - [`services`] - `TreeService`, the public operation surface
//! - [`config`] - `TreeConfig`
//! - [`logging`] - tracing subscriber setup

pub mod behaviors;
pub mod config;
pub mod db;
pub mod logging;
pub mod models;
pub mod services;

// Re-export commonly used types
pub use config::TreeConfig;
pub use db::{MemoryStore, NodeStore, SortKeyAllocator, StoreError};
pub use models::{NewNode, Node, NodeTree, NodeType, NodeUpdate, RelativePosition, SiblingGroup};
pub use services::{ServiceResult, TreeService, TreeServiceError};

#[cfg(feature = "libsql")]
pub use db::LibsqlStore;
