//! NodeStore Trait - Storage Abstraction Layer
//!
//! This module defines the `NodeStore` trait that the tree service uses for
//! every read and write. Two implementations ship with the crate:
//!
//! - [`MemoryStore`](crate::db::MemoryStore) - in-process, one lock per space
//! - [`LibsqlStore`](crate::db::LibsqlStore) - embedded libsql/SQLite file
//!
//! # Design Decisions
//!
//! 1. **Async-First**: All methods are async so embedded and networked
//!    backends fit behind the same interface
//! 2. **One call, one transaction**: every mutating method is atomic; a move
//!    re-checks the parent, walks the ancestor chain, allocates keys and
//!    writes the node plus any renumbered siblings before it returns
//! 3. **Ownership Semantics**: `create` takes the node by value and hands back
//!    the stored copy
//! 4. **Typed errors**: [`StoreError`](crate::db::StoreError) keeps not-found,
//!    integrity and constraint failures distinguishable for the service layer
//!
//! # Examples
//!
//! ```rust,no_run
//! use pagetree_core::db::{MemoryStore, NodeStore};
//! use pagetree_core::models::{NewNode, Node, NodeType};
//! use std::sync::Arc;
//! use uuid::Uuid;
//!
//! # async fn example() -> Result<(), pagetree_core::db::StoreError> {
//! let store: Arc<dyn NodeStore> = Arc::new(MemoryStore::new());
//!
//! let page = Node::from_new(NewNode::page(Uuid::new_v4()), NodeType::Page);
//! let created = store.create_appended(page).await?;
//! assert_eq!(created.sort, 1000);
//! # Ok(())
//! # }
//! ```

use crate::db::error::StoreResult;
use crate::models::{Node, NodeUpdate, RelativePosition};
use async_trait::async_trait;
use uuid::Uuid;

/// Persistence operations for the ordered node tree
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`; the service shares one store
/// between concurrent request handlers.
///
/// # Concurrency
///
/// Mutations of one sibling group never interleave their read of the group
/// with their write. Key allocation for appends happens inside that write
/// (see [`create_appended`](NodeStore::create_appended)).
///
/// Locks are wider than a single sibling group: `MemoryStore` serializes
/// writers per space and `LibsqlStore` per database. A move has to validate
/// the destination parent and walk its ancestor chain, which can touch any
/// group of the space, so a per-group lock would not cover the cycle check.
/// Writes to different groups of the same space therefore queue behind each
/// other; separate `MemoryStore` spaces do not.
#[async_trait]
pub trait NodeStore: Send + Sync {
    //
    // CORE CRUD OPERATIONS
    //

    /// Get node by ID
    ///
    /// # Errors
    ///
    /// `StoreError::NotFound` if no such node exists.
    async fn get(&self, id: Uuid) -> StoreResult<Node>;

    /// Persist a new node with the sort key it already carries
    ///
    /// # Errors
    ///
    /// - `DuplicateSort` if the key is taken in the node's sibling group
    /// - `NotFound` if the parent does not exist
    /// - `Constraint` if the parent is in another space or has the wrong type
    async fn create(&self, node: Node) -> StoreResult<Node>;

    /// Persist a new node after the last member of its sibling group
    ///
    /// The incoming `sort` is ignored. The key is allocated in the same
    /// transaction as the insert, and the group is renumbered when the next
    /// key would overflow.
    ///
    /// # Errors
    ///
    /// Same as [`create`](NodeStore::create), plus `KeyspaceExhausted` if even
    /// a renumbered group cannot hold the node.
    async fn create_appended(&self, node: Node) -> StoreResult<Node>;

    /// Apply a payload update; ordering fields are untouched
    async fn update(&self, id: Uuid, update: NodeUpdate) -> StoreResult<Node>;

    /// Delete a node and all of its descendants
    ///
    /// # Returns
    ///
    /// Number of nodes removed (the node itself plus its subtree).
    ///
    /// # Errors
    ///
    /// `NotFound` if the node does not exist in `space_id`.
    async fn delete(&self, space_id: Uuid, id: Uuid) -> StoreResult<u64>;

    //
    // ORDERING
    //

    /// Direct children of `parent_id` (root nodes of the space when `None`),
    /// ascending by sort. Archived nodes are included.
    async fn list_children(&self, space_id: Uuid, parent_id: Option<Uuid>)
        -> StoreResult<Vec<Node>>;

    /// Key an appended node would receive: largest key in the group plus the
    /// gap, or the gap for an empty group
    ///
    /// A snapshot only; inserting with it races other writers. Use
    /// [`create_appended`](NodeStore::create_appended) to append.
    ///
    /// # Errors
    ///
    /// `KeyspaceExhausted` when the next key would overflow.
    async fn next_sort(&self, space_id: Uuid, parent_id: Option<Uuid>) -> StoreResult<i64>;

    //
    // HIERARCHY OPERATIONS
    //

    /// Reparent `id` (or keep it in place) and append it after the last sibling
    async fn move_to_parent_append(&self, id: Uuid, new_parent_id: Option<Uuid>)
        -> StoreResult<Node>;

    /// Reparent `id` and place it at `target_sort`, renumbering the
    /// destination group on collision
    async fn move_to_parent_at_sort(
        &self,
        id: Uuid,
        new_parent_id: Option<Uuid>,
        target_sort: i64,
    ) -> StoreResult<Node>;

    /// Change only the sort key of `id` within its current group
    async fn reorder_within_group(&self, id: Uuid, target_sort: i64) -> StoreResult<Node>;

    /// Move `id` directly before or after `anchor_id`, adopting the anchor's
    /// parent
    async fn move_relative(
        &self,
        id: Uuid,
        anchor_id: Uuid,
        position: RelativePosition,
    ) -> StoreResult<Node>;

    /// Rewrite a group's keys to `gap, 2*gap, ...` preserving order
    ///
    /// # Returns
    ///
    /// The group's members in order with their new keys.
    async fn renumber_group(&self, space_id: Uuid, parent_id: Option<Uuid>)
        -> StoreResult<Vec<Node>>;
}
