//! Tree Mutation Service
//!
//! Entry point for every page and block operation. The service checks
//! arguments and operation/type applicability, then delegates each
//! multi-step write to a single atomic [`NodeStore`] call.
//!
//! # Operations
//!
//! Each operation exists once, generic over [`NodeType`], with thin page and
//! block wrappers (`create_page`, `create_block`, ..., `update_block_sort`).
//!
//! # Retries and deadlines
//!
//! Sort keys, appends included, are allocated inside the store's write, so
//! concurrent callers queue instead of racing. A write that still trips the
//! unique key index (another process writing the same database, a store
//! without serialized writers) surfaces as
//! [`TreeServiceError::IntegrityConflict`]; it is re-run with a fresh read up
//! to `TreeConfig::conflict_retries` times. When
//! `TreeConfig::operation_timeout_ms` is set, each operation is bounded by
//! `tokio::time::timeout` and reports [`TreeServiceError::Cancelled`] on
//! expiry. Nothing is persisted by an operation that did not complete.
//!
//! # Examples
//!
//! ```rust
//! use pagetree_core::models::NewNode;
//! use pagetree_core::services::TreeService;
//! use pagetree_core::TreeConfig;
//! use uuid::Uuid;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let service = TreeService::in_memory(TreeConfig::default())?;
//! let space_id = Uuid::new_v4();
//!
//! let p1 = service.create_page(NewNode::page(space_id)).await?;
//! let p2 = service.create_page(NewNode::page(space_id)).await?;
//! assert_eq!((p1.sort, p2.sort), (1000, 2000));
//!
//! let moved = service.move_page(p2.id, None, Some(1500)).await?;
//! assert_eq!(moved.sort, 1500);
//! # Ok(())
//! # }
//! ```

use crate::behaviors::{ensure_kind, validate_parent};
use crate::config::TreeConfig;
use crate::db::{MemoryStore, NodeStore};
use crate::models::{NewNode, Node, NodeTree, NodeType, NodeUpdate, RelativePosition};
use crate::services::error::{ServiceResult, TreeServiceError};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

/// Ordered page/block tree operations over a [`NodeStore`]
#[derive(Clone)]
pub struct TreeService {
    store: Arc<dyn NodeStore>,
    config: TreeConfig,
}

impl TreeService {
    /// Service with default configuration.
    ///
    /// The store's own allocator decides the key gap; build it with
    /// [`TreeConfig::allocator`] to keep the two in step.
    pub fn new(store: Arc<dyn NodeStore>) -> Self {
        Self {
            store,
            config: TreeConfig::default(),
        }
    }

    pub fn with_config(store: Arc<dyn NodeStore>, config: TreeConfig) -> ServiceResult<Self> {
        config.validate().map_err(TreeServiceError::invalid_config)?;
        Ok(Self { store, config })
    }

    /// Service over a fresh [`MemoryStore`] using `config.sort_gap`.
    pub fn in_memory(config: TreeConfig) -> ServiceResult<Self> {
        config.validate().map_err(TreeServiceError::invalid_config)?;
        let store = Arc::new(MemoryStore::with_allocator(config.allocator()));
        Self::with_config(store, config)
    }

    /// Service over a [`LibsqlStore`](crate::db::LibsqlStore) file using
    /// `config.sort_gap`.
    #[cfg(feature = "libsql")]
    pub async fn open(db_path: std::path::PathBuf, config: TreeConfig) -> ServiceResult<Self> {
        config.validate().map_err(TreeServiceError::invalid_config)?;
        let store = crate::db::LibsqlStore::with_allocator(db_path, config.allocator())
            .await
            .map_err(TreeServiceError::Storage)?;
        Self::with_config(Arc::new(store), config)
    }

    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    pub fn store(&self) -> Arc<dyn NodeStore> {
        Arc::clone(&self.store)
    }

    //
    // PAGE OPERATIONS
    //

    pub async fn create_page(&self, input: NewNode) -> ServiceResult<Node> {
        self.create_node(NodeType::Page, input).await
    }

    pub async fn delete_page(&self, space_id: Uuid, page_id: Uuid) -> ServiceResult<u64> {
        self.delete_node(NodeType::Page, space_id, page_id).await
    }

    pub async fn get_page_properties(&self, page_id: Uuid) -> ServiceResult<Node> {
        self.get_node_properties(NodeType::Page, page_id).await
    }

    pub async fn update_page_properties(
        &self,
        page_id: Uuid,
        update: NodeUpdate,
    ) -> ServiceResult<Node> {
        self.update_node_properties(NodeType::Page, page_id, update)
            .await
    }

    pub async fn list_page_children(&self, page_id: Uuid) -> ServiceResult<Vec<Node>> {
        self.list_node_children(NodeType::Page, page_id, true).await
    }

    /// Move a page under `new_parent_id` (a page) or to the space root.
    /// Without `target_sort` the page is appended after its new siblings.
    pub async fn move_page(
        &self,
        page_id: Uuid,
        new_parent_id: Option<Uuid>,
        target_sort: Option<i64>,
    ) -> ServiceResult<Node> {
        self.move_node(NodeType::Page, page_id, new_parent_id, target_sort)
            .await
    }

    pub async fn update_page_sort(&self, page_id: Uuid, sort: i64) -> ServiceResult<Node> {
        self.update_node_sort(NodeType::Page, page_id, sort).await
    }

    //
    // BLOCK OPERATIONS
    //

    pub async fn create_block(&self, input: NewNode) -> ServiceResult<Node> {
        self.create_node(NodeType::Block, input).await
    }

    pub async fn delete_block(&self, space_id: Uuid, block_id: Uuid) -> ServiceResult<u64> {
        self.delete_node(NodeType::Block, space_id, block_id).await
    }

    pub async fn get_block_properties(&self, block_id: Uuid) -> ServiceResult<Node> {
        self.get_node_properties(NodeType::Block, block_id).await
    }

    pub async fn update_block_properties(
        &self,
        block_id: Uuid,
        update: NodeUpdate,
    ) -> ServiceResult<Node> {
        self.update_node_properties(NodeType::Block, block_id, update)
            .await
    }

    pub async fn list_block_children(&self, block_id: Uuid) -> ServiceResult<Vec<Node>> {
        self.list_node_children(NodeType::Block, block_id, true)
            .await
    }

    /// Move a block under another page or block; blocks always have a parent.
    pub async fn move_block(
        &self,
        block_id: Uuid,
        new_parent_id: Uuid,
        target_sort: Option<i64>,
    ) -> ServiceResult<Node> {
        if new_parent_id.is_nil() {
            return Err(TreeServiceError::invalid_argument(
                "move_block",
                "parent id is required for block",
            ));
        }
        self.move_node(NodeType::Block, block_id, Some(new_parent_id), target_sort)
            .await
    }

    pub async fn update_block_sort(&self, block_id: Uuid, sort: i64) -> ServiceResult<Node> {
        self.update_node_sort(NodeType::Block, block_id, sort).await
    }

    //
    // GENERIC OPERATIONS
    //

    /// Create a node of type `expected`, appended to its sibling group.
    ///
    /// # Errors
    ///
    /// - `InvalidArgument` for an empty space id, a mismatching `input.node_type`
    ///   or a block without parent
    /// - `NotFound` if the parent does not exist
    /// - `ConstraintViolation` if the parent has the wrong type or lives in
    ///   another space
    pub async fn create_node(&self, expected: NodeType, input: NewNode) -> ServiceResult<Node> {
        let operation = format!("create_{}", expected);
        self.run(&operation, async {
            if input.space_id.is_nil() {
                return Err(TreeServiceError::invalid_argument(
                    &operation,
                    "space id is empty",
                ));
            }

            let node_type = input.node_type.unwrap_or(expected);
            if node_type != expected {
                return Err(TreeServiceError::invalid_argument(
                    &operation,
                    format!("type must be {}", expected),
                ));
            }

            let mut input = input;
            input.id = input.id.filter(|id| !id.is_nil());
            input.parent_id = input.parent_id.filter(|id| !id.is_nil());

            let parent = match input.parent_id {
                Some(parent_id) => Some(self.fetch(&operation, parent_id).await?),
                None => None,
            };
            validate_parent(node_type, input.space_id, parent.as_ref())
                .map_err(|e| TreeServiceError::constraint(&operation, e))?;

            let template = Node::from_new(input, node_type);
            if !template.properties.is_object() {
                return Err(TreeServiceError::invalid_argument(
                    &operation,
                    "properties must be a JSON object",
                ));
            }

            let (template, op) = (&template, operation.as_str());
            let created = self
                .with_conflict_retry(op, || async move {
                    self.store
                        .create_appended(template.clone())
                        .await
                        .map_err(|e| TreeServiceError::store(op, e))
                })
                .await?;

            tracing::debug!(
                node_id = %created.id,
                space_id = %created.space_id,
                parent_id = ?created.parent_id,
                sort = created.sort,
                "created {}",
                node_type
            );
            Ok(created)
        })
        .await
    }

    /// Delete a node and its descendants, returning how many were removed.
    pub async fn delete_node(
        &self,
        expected: NodeType,
        space_id: Uuid,
        id: Uuid,
    ) -> ServiceResult<u64> {
        let operation = format!("delete_{}", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            if space_id.is_nil() {
                return Err(TreeServiceError::invalid_argument(
                    &operation,
                    "space id is empty",
                ));
            }

            let node = self.fetch_kind(&operation, expected, id).await?;
            if node.space_id != space_id {
                return Err(TreeServiceError::not_found(id));
            }

            let removed = self
                .store
                .delete(space_id, id)
                .await
                .map_err(|e| TreeServiceError::store(&operation, e))?;
            tracing::debug!(node_id = %id, %space_id, removed, "deleted {}", expected);
            Ok(removed)
        })
        .await
    }

    pub async fn get_node_properties(&self, expected: NodeType, id: Uuid) -> ServiceResult<Node> {
        let operation = format!("get_{}_properties", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            self.fetch_kind(&operation, expected, id).await
        })
        .await
    }

    /// Patch title, properties or the archived flag. Ordering is untouched;
    /// an empty patch returns the node as stored.
    pub async fn update_node_properties(
        &self,
        expected: NodeType,
        id: Uuid,
        update: NodeUpdate,
    ) -> ServiceResult<Node> {
        let operation = format!("update_{}_properties", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            let node = self.fetch_kind(&operation, expected, id).await?;

            if update.is_empty() {
                return Ok(node);
            }
            if update.properties.as_ref().is_some_and(|p| !p.is_object()) {
                return Err(TreeServiceError::invalid_argument(
                    &operation,
                    "properties must be a JSON object",
                ));
            }

            self.store
                .update(id, update)
                .await
                .map_err(|e| TreeServiceError::store(&operation, e))
        })
        .await
    }

    /// Direct children of `id` ascending by sort.
    pub async fn list_node_children(
        &self,
        expected: NodeType,
        id: Uuid,
        include_archived: bool,
    ) -> ServiceResult<Vec<Node>> {
        let operation = format!("list_{}_children", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            let parent = self.fetch_kind(&operation, expected, id).await?;

            let mut children = self
                .store
                .list_children(parent.space_id, Some(id))
                .await
                .map_err(|e| TreeServiceError::store(&operation, e))?;
            if !include_archived {
                children.retain(|n| !n.archived);
            }
            Ok(children)
        })
        .await
    }

    /// Root pages of a space ascending by sort, archived ones included.
    pub async fn list_root_pages(&self, space_id: Uuid) -> ServiceResult<Vec<Node>> {
        let operation = "list_root_pages";
        self.run(operation, async {
            if space_id.is_nil() {
                return Err(TreeServiceError::invalid_argument(
                    operation,
                    "space id is empty",
                ));
            }
            self.store
                .list_children(space_id, None)
                .await
                .map_err(|e| TreeServiceError::store(operation, e))
        })
        .await
    }

    /// Reparent and/or reorder a node.
    ///
    /// `new_parent_id = None` moves a page to the space root. With
    /// `target_sort` the node takes that key (renumbering the destination
    /// group if a sibling already holds it); otherwise it is appended.
    pub async fn move_node(
        &self,
        expected: NodeType,
        id: Uuid,
        new_parent_id: Option<Uuid>,
        target_sort: Option<i64>,
    ) -> ServiceResult<Node> {
        let operation = format!("move_{}", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            let new_parent_id = new_parent_id.filter(|p| !p.is_nil());

            if new_parent_id == Some(id) {
                return Err(TreeServiceError::Cycle {
                    node_id: id,
                    parent_id: id,
                });
            }

            let node = self.fetch_kind(&operation, expected, id).await?;
            let parent = match new_parent_id {
                Some(parent_id) => Some(self.fetch(&operation, parent_id).await?),
                None => None,
            };
            validate_parent(node.node_type, node.space_id, parent.as_ref())
                .map_err(|e| TreeServiceError::constraint(&operation, e))?;

            let op = operation.as_str();
            let moved = self
                .with_conflict_retry(op, || async move {
                    let result = match target_sort {
                        Some(sort) => {
                            self.store
                                .move_to_parent_at_sort(id, new_parent_id, sort)
                                .await
                        }
                        None => self.store.move_to_parent_append(id, new_parent_id).await,
                    };
                    result.map_err(|e| TreeServiceError::store(op, e))
                })
                .await?;

            tracing::debug!(
                node_id = %id,
                parent_id = ?moved.parent_id,
                sort = moved.sort,
                "moved {}",
                expected
            );
            Ok(moved)
        })
        .await
    }

    /// Reorder a node within its current sibling group.
    pub async fn update_node_sort(
        &self,
        expected: NodeType,
        id: Uuid,
        sort: i64,
    ) -> ServiceResult<Node> {
        let operation = format!("update_{}_sort", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            self.fetch_kind(&operation, expected, id).await?;

            let op = operation.as_str();
            self.with_conflict_retry(op, || async move {
                self.store
                    .reorder_within_group(id, sort)
                    .await
                    .map_err(|e| TreeServiceError::store(op, e))
            })
            .await
        })
        .await
    }

    /// Place a node directly before or after `anchor_id`, joining the
    /// anchor's sibling group.
    pub async fn move_node_relative(
        &self,
        expected: NodeType,
        id: Uuid,
        anchor_id: Uuid,
        position: RelativePosition,
    ) -> ServiceResult<Node> {
        let operation = format!("move_{}_relative", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            if anchor_id.is_nil() {
                return Err(TreeServiceError::invalid_argument(
                    &operation,
                    "anchor id is empty",
                ));
            }
            if anchor_id == id {
                return Err(TreeServiceError::invalid_argument(
                    &operation,
                    "node cannot be positioned relative to itself",
                ));
            }

            let node = self.fetch_kind(&operation, expected, id).await?;
            let anchor = self.fetch(&operation, anchor_id).await?;
            if anchor.space_id != node.space_id {
                return Err(TreeServiceError::constraint_violation(
                    &operation,
                    format!(
                        "anchor {} belongs to space {}, not {}",
                        anchor_id, anchor.space_id, node.space_id
                    ),
                ));
            }
            let parent = match anchor.parent_id {
                Some(parent_id) => Some(self.fetch(&operation, parent_id).await?),
                None => None,
            };
            validate_parent(node.node_type, node.space_id, parent.as_ref())
                .map_err(|e| TreeServiceError::constraint(&operation, e))?;

            let op = operation.as_str();
            self.with_conflict_retry(op, || async move {
                self.store
                    .move_relative(id, anchor_id, position)
                    .await
                    .map_err(|e| TreeServiceError::store(op, e))
            })
            .await
        })
        .await
    }

    /// Nested view of `id` and its descendants, children ordered by sort.
    /// Archived descendants (and everything below them) are left out.
    pub async fn get_subtree(&self, expected: NodeType, id: Uuid) -> ServiceResult<NodeTree> {
        let operation = format!("get_{}_subtree", expected);
        self.run(&operation, async {
            require_id(&operation, expected, id)?;
            let root = self.fetch_kind(&operation, expected, id).await?;
            let space_id = root.space_id;

            // Breadth-first: parents always precede their children
            let mut order = vec![root];
            let mut seen = HashSet::from([id]);
            let mut next = 0;
            while next < order.len() {
                let parent_id = order[next].id;
                next += 1;
                let children = self
                    .store
                    .list_children(space_id, Some(parent_id))
                    .await
                    .map_err(|e| TreeServiceError::store(&operation, e))?;
                order.extend(
                    children
                        .into_iter()
                        .filter(|n| !n.archived && seen.insert(n.id)),
                );
            }

            let mut built: HashMap<Uuid, Vec<NodeTree>> = HashMap::new();
            let mut tree = None;
            for node in order.into_iter().rev() {
                let mut children = built.remove(&node.id).unwrap_or_default();
                children.reverse();
                let (node_id, parent_id) = (node.id, node.parent_id);
                let subtree = NodeTree { node, children };
                match parent_id {
                    Some(parent_id) if node_id != id => {
                        built.entry(parent_id).or_default().push(subtree)
                    }
                    _ => tree = Some(subtree),
                }
            }
            tree.ok_or_else(|| TreeServiceError::not_found(id))
        })
        .await
    }

    /// Rewrite a sibling group's keys to `gap, 2*gap, ...` in current order.
    pub async fn renumber_children(
        &self,
        space_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> ServiceResult<Vec<Node>> {
        let operation = "renumber_children";
        self.run(operation, async {
            if space_id.is_nil() {
                return Err(TreeServiceError::invalid_argument(
                    operation,
                    "space id is empty",
                ));
            }
            let parent_id = parent_id.filter(|p| !p.is_nil());
            if let Some(parent_id) = parent_id {
                let parent = self.fetch(operation, parent_id).await?;
                if parent.space_id != space_id {
                    return Err(TreeServiceError::not_found(parent_id));
                }
            }

            self.store
                .renumber_group(space_id, parent_id)
                .await
                .map_err(|e| TreeServiceError::store(operation, e))
        })
        .await
    }

    //
    // HELPERS
    //

    async fn fetch(&self, operation: &str, id: Uuid) -> ServiceResult<Node> {
        self.store
            .get(id)
            .await
            .map_err(|e| TreeServiceError::store(operation, e))
    }

    async fn fetch_kind(&self, operation: &str, expected: NodeType, id: Uuid) -> ServiceResult<Node> {
        let node = self.fetch(operation, id).await?;
        ensure_kind(&node, expected).map_err(|e| TreeServiceError::constraint(operation, e))?;
        Ok(node)
    }

    /// Re-run `attempt` after an integrity conflict, up to the configured
    /// number of retries. Each attempt reads fresh state.
    async fn with_conflict_retry<T, F, Fut>(&self, operation: &str, mut attempt: F) -> ServiceResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ServiceResult<T>>,
    {
        let max_retries = self.config.conflict_retries;
        let mut retries = 0u32;

        loop {
            match attempt().await {
                Ok(value) => {
                    if retries > 0 {
                        tracing::debug!(operation, retries, "succeeded after sort key conflict");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_integrity_conflict() && retries < max_retries => {
                    retries += 1;
                    tracing::debug!(
                        operation,
                        attempt = retries,
                        max_retries,
                        error = %e,
                        "sort key conflict, retrying"
                    );
                }
                Err(e) => {
                    if e.is_integrity_conflict() {
                        tracing::warn!(operation, max_retries, error = %e, "sort key conflict persisted");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Bound `fut` by the configured operation timeout.
    async fn run<T, Fut>(&self, operation: &str, fut: Fut) -> ServiceResult<T>
    where
        Fut: Future<Output = ServiceResult<T>>,
    {
        match self.config.operation_timeout() {
            Some(limit) => tokio::time::timeout(limit, fut).await.unwrap_or_else(|_| {
                tracing::warn!(operation, timeout_ms = limit.as_millis() as u64, "operation timed out");
                Err(TreeServiceError::cancelled(operation))
            }),
            None => fut.await,
        }
    }
}

fn require_id(operation: &str, node_type: NodeType, id: Uuid) -> ServiceResult<()> {
    if id.is_nil() {
        return Err(TreeServiceError::invalid_argument(
            operation,
            format!("{} id is empty", node_type),
        ));
    }
    Ok(())
}
