//! In-process NodeStore
//!
//! `MemoryStore` keeps every space in its own `tokio::sync::Mutex`. An
//! operation locks the space it touches for its whole read-compute-write,
//! so mutations of a sibling group never interleave while operations on
//! other spaces run independently.
//!
//! Writes are staged as a change set and applied in one synchronous step
//! after all awaits, so a dropped (cancelled) future never leaves a partial
//! write behind.

use crate::behaviors::{ensure_acyclic, validate_parent};
use crate::db::error::{StoreError, StoreResult};
use crate::db::node_store::NodeStore;
use crate::db::sort_allocator::{KeyspaceExhausted, Placement, SiblingKey, SortKeyAllocator};
use crate::models::{Node, NodeUpdate, RelativePosition, SiblingGroup};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Where a moving node should land inside its destination group
#[derive(Debug, Clone, Copy)]
enum Target {
    Append,
    At(i64),
    NextTo(Uuid, RelativePosition),
}

/// All nodes of one space plus a per-group sort index
#[derive(Debug, Default)]
struct SpaceState {
    nodes: HashMap<Uuid, Node>,
    groups: HashMap<Option<Uuid>, BTreeMap<i64, Uuid>>,
}

impl SpaceState {
    fn get(&self, id: Uuid) -> StoreResult<&Node> {
        self.nodes.get(&id).ok_or_else(|| StoreError::not_found(id))
    }

    fn parent_of(&self, id: Uuid) -> Option<Uuid> {
        self.nodes.get(&id).and_then(|n| n.parent_id)
    }

    fn siblings(&self, parent_id: Option<Uuid>) -> Vec<SiblingKey> {
        self.groups
            .get(&parent_id)
            .map(|group| {
                group
                    .iter()
                    .map(|(sort, id)| SiblingKey::new(*id, *sort))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn children(&self, parent_id: Option<Uuid>) -> Vec<Node> {
        self.groups
            .get(&parent_id)
            .map(|group| {
                group
                    .values()
                    .filter_map(|id| self.nodes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn max_sort(&self, parent_id: Option<Uuid>) -> Option<i64> {
        self.groups
            .get(&parent_id)
            .and_then(|group| group.keys().next_back().copied())
    }

    fn ensure_parent_exists(&self, parent_id: Option<Uuid>) -> StoreResult<()> {
        if let Some(parent_id) = parent_id {
            self.get(parent_id)?;
        }
        Ok(())
    }

    /// Compute the change set for moving `id` under `new_parent_id`.
    fn plan_move(
        &self,
        allocator: &SortKeyAllocator,
        id: Uuid,
        new_parent_id: Option<Uuid>,
        target: Target,
    ) -> StoreResult<Vec<Node>> {
        let node = self.get(id)?.clone();

        let parent = new_parent_id.map(|p| self.get(p)).transpose()?;
        validate_parent(node.node_type, node.space_id, parent)?;
        if let Some(parent_id) = new_parent_id {
            ensure_acyclic(id, parent_id, self.nodes.len(), |n| self.parent_of(n))?;
        }

        let group = SiblingGroup::new(node.space_id, new_parent_id);
        let siblings = self.siblings(new_parent_id);
        let exhausted = |e: KeyspaceExhausted| StoreError::keyspace_exhausted(group, e);

        let placement = match target {
            Target::Append => allocator.place_last(&siblings, id).map_err(exhausted)?,
            Target::At(sort) => allocator.place_at(&siblings, id, sort).map_err(exhausted)?,
            Target::NextTo(anchor, position) => allocator
                .place_next_to(&siblings, id, anchor, position == RelativePosition::After)
                .ok_or_else(|| StoreError::not_found(anchor))?
                .map_err(exhausted)?,
        };

        Ok(self.changes_for(node, new_parent_id, placement))
    }

    /// Turn a placement into updated node records.
    fn changes_for(&self, mut node: Node, parent_id: Option<Uuid>, placement: Placement) -> Vec<Node> {
        let now = Utc::now();
        match placement {
            Placement::Key(sort) => {
                node.parent_id = parent_id;
                node.sort = sort;
                node.updated_at = now;
                vec![node]
            }
            Placement::Renumber(keys) => {
                tracing::info!(
                    group = %SiblingGroup::new(node.space_id, parent_id),
                    members = keys.len(),
                    "renumbering sibling group"
                );
                keys.into_iter()
                    .filter_map(|key| {
                        if key.id == node.id {
                            let mut moved = node.clone();
                            moved.parent_id = parent_id;
                            moved.sort = key.sort;
                            moved.updated_at = now;
                            return Some(moved);
                        }
                        let sibling = self.nodes.get(&key.id)?;
                        if sibling.sort == key.sort {
                            return None;
                        }
                        let mut sibling = sibling.clone();
                        sibling.sort = key.sort;
                        sibling.updated_at = now;
                        Some(sibling)
                    })
                    .collect()
            }
        }
    }

    /// Apply a change set atomically, refusing duplicate keys.
    fn commit(&mut self, space_id: Uuid, changes: Vec<Node>) -> StoreResult<()> {
        let mut detached = Vec::with_capacity(changes.len());
        for node in &changes {
            if let Some(old) = self.nodes.get(&node.id) {
                if let Some(group) = self.groups.get_mut(&old.parent_id) {
                    group.remove(&old.sort);
                }
                detached.push((old.parent_id, old.sort, old.id));
            }
        }

        let mut claimed = HashSet::with_capacity(changes.len());
        let conflict = changes
            .iter()
            .find(|n| {
                let taken = self
                    .groups
                    .get(&n.parent_id)
                    .is_some_and(|group| group.contains_key(&n.sort));
                taken || !claimed.insert((n.parent_id, n.sort))
            })
            .map(|n| (n.parent_id, n.sort));

        if let Some((parent_id, sort)) = conflict {
            for (parent_id, sort, id) in detached {
                self.groups.entry(parent_id).or_default().insert(sort, id);
            }
            return Err(StoreError::duplicate_sort(
                SiblingGroup::new(space_id, parent_id),
                sort,
            ));
        }

        for node in changes {
            self.groups
                .entry(node.parent_id)
                .or_default()
                .insert(node.sort, node.id);
            self.nodes.insert(node.id, node);
        }
        Ok(())
    }

    /// `id` and every descendant, parents before children.
    fn subtree(&self, id: Uuid) -> Vec<Uuid> {
        let mut ids = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            ids.push(current);
            if let Some(children) = self.groups.get(&Some(current)) {
                queue.extend(children.values().copied());
            }
        }
        ids
    }
}

/// In-memory [`NodeStore`] with per-space locking
#[derive(Debug, Default)]
pub struct MemoryStore {
    allocator: SortKeyAllocator,
    spaces: RwLock<HashMap<Uuid, Arc<Mutex<SpaceState>>>>,
    /// node id -> space id
    locator: RwLock<HashMap<Uuid, Uuid>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allocator(allocator: SortKeyAllocator) -> Self {
        Self {
            allocator,
            ..Self::default()
        }
    }

    pub fn allocator(&self) -> &SortKeyAllocator {
        &self.allocator
    }

    /// Number of stored nodes across all spaces.
    pub async fn len(&self) -> usize {
        self.locator.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locator.read().await.is_empty()
    }

    async fn space(&self, space_id: Uuid) -> Arc<Mutex<SpaceState>> {
        if let Some(space) = self.spaces.read().await.get(&space_id) {
            return Arc::clone(space);
        }
        let mut spaces = self.spaces.write().await;
        Arc::clone(spaces.entry(space_id).or_default())
    }

    async fn existing_space(&self, space_id: Uuid) -> Option<Arc<Mutex<SpaceState>>> {
        self.spaces.read().await.get(&space_id).cloned()
    }

    /// Space id and lock of the space holding `id`.
    async fn space_of(&self, id: Uuid) -> StoreResult<(Uuid, Arc<Mutex<SpaceState>>)> {
        let space_id = self
            .locator
            .read()
            .await
            .get(&id)
            .copied()
            .ok_or_else(|| StoreError::not_found(id))?;
        Ok((space_id, self.space(space_id).await))
    }

    /// Insert a new node at its own key, or after the last sibling when
    /// `append` is set. The key is chosen under the space lock.
    async fn insert(&self, mut node: Node, append: bool) -> StoreResult<Node> {
        node.validate()
            .map_err(|e| StoreError::invalid_node(e.to_string()))?;

        let space = self.space(node.space_id).await;
        let mut state = space.lock().await;
        let mut locator = self.locator.write().await;

        if locator.contains_key(&node.id) {
            return Err(StoreError::invalid_node(format!(
                "node {} already exists",
                node.id
            )));
        }

        let parent = node.parent_id.map(|p| state.get(p)).transpose()?;
        validate_parent(node.node_type, node.space_id, parent)?;

        let (id, space_id, parent_id) = (node.id, node.space_id, node.parent_id);
        let changes = if append {
            let group = SiblingGroup::new(space_id, parent_id);
            let placement = self
                .allocator
                .place_last(&state.siblings(parent_id), id)
                .map_err(|e| StoreError::keyspace_exhausted(group, e))?;
            match placement {
                Placement::Key(sort) => {
                    node.sort = sort;
                    vec![node]
                }
                renumbered => state.changes_for(node, parent_id, renumbered),
            }
        } else {
            vec![node]
        };

        state.commit(space_id, changes)?;
        locator.insert(id, space_id);
        state.get(id).cloned()
    }

    async fn relocate(
        &self,
        id: Uuid,
        parent: impl FnOnce(&SpaceState) -> StoreResult<Option<Uuid>>,
        target: Target,
    ) -> StoreResult<Node> {
        let (space_id, space) = self.space_of(id).await?;
        let mut state = space.lock().await;

        let new_parent_id = parent(&*state)?;
        let changes = state.plan_move(&self.allocator, id, new_parent_id, target)?;
        state.commit(space_id, changes)?;

        let moved = state.get(id)?.clone();
        tracing::debug!(
            node_id = %id,
            parent_id = ?moved.parent_id,
            sort = moved.sort,
            "node positioned"
        );
        Ok(moved)
    }
}

#[async_trait]
impl NodeStore for MemoryStore {
    async fn get(&self, id: Uuid) -> StoreResult<Node> {
        let (_, space) = self.space_of(id).await?;
        let state = space.lock().await;
        state.get(id).cloned()
    }

    async fn create(&self, node: Node) -> StoreResult<Node> {
        self.insert(node, false).await
    }

    async fn create_appended(&self, node: Node) -> StoreResult<Node> {
        self.insert(node, true).await
    }

    async fn update(&self, id: Uuid, update: NodeUpdate) -> StoreResult<Node> {
        let (_, space) = self.space_of(id).await?;
        let mut state = space.lock().await;

        let mut node = state.get(id)?.clone();
        node.apply_update(&update);
        node.validate()
            .map_err(|e| StoreError::invalid_node(e.to_string()))?;

        state.nodes.insert(id, node.clone());
        Ok(node)
    }

    async fn delete(&self, space_id: Uuid, id: Uuid) -> StoreResult<u64> {
        let space = self
            .existing_space(space_id)
            .await
            .ok_or_else(|| StoreError::not_found(id))?;
        let mut state = space.lock().await;
        let mut locator = self.locator.write().await;

        let node = state.get(id)?;
        let (parent_id, sort) = (node.parent_id, node.sort);

        let removed = state.subtree(id);
        if let Some(group) = state.groups.get_mut(&parent_id) {
            group.remove(&sort);
        }
        for removed_id in &removed {
            state.nodes.remove(removed_id);
            state.groups.remove(&Some(*removed_id));
            locator.remove(removed_id);
        }

        tracing::debug!(node_id = %id, removed = removed.len(), "deleted subtree");
        Ok(removed.len() as u64)
    }

    async fn list_children(
        &self,
        space_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Vec<Node>> {
        let Some(space) = self.existing_space(space_id).await else {
            return match parent_id {
                Some(parent_id) => Err(StoreError::not_found(parent_id)),
                None => Ok(Vec::new()),
            };
        };
        let state = space.lock().await;
        state.ensure_parent_exists(parent_id)?;
        Ok(state.children(parent_id))
    }

    async fn next_sort(&self, space_id: Uuid, parent_id: Option<Uuid>) -> StoreResult<i64> {
        let space = self.space(space_id).await;
        let state = space.lock().await;

        let group = SiblingGroup::new(space_id, parent_id);
        self.allocator
            .next_key(state.max_sort(parent_id))
            .ok_or_else(|| {
                StoreError::keyspace_exhausted(
                    group,
                    KeyspaceExhausted {
                        members: state.groups.get(&parent_id).map_or(0, |g| g.len()),
                        gap: self.allocator.gap(),
                    },
                )
            })
    }

    async fn move_to_parent_append(
        &self,
        id: Uuid,
        new_parent_id: Option<Uuid>,
    ) -> StoreResult<Node> {
        self.relocate(id, |_| Ok(new_parent_id), Target::Append)
            .await
    }

    async fn move_to_parent_at_sort(
        &self,
        id: Uuid,
        new_parent_id: Option<Uuid>,
        target_sort: i64,
    ) -> StoreResult<Node> {
        self.relocate(id, |_| Ok(new_parent_id), Target::At(target_sort))
            .await
    }

    async fn reorder_within_group(&self, id: Uuid, target_sort: i64) -> StoreResult<Node> {
        self.relocate(
            id,
            |state| Ok(state.get(id)?.parent_id),
            Target::At(target_sort),
        )
        .await
    }

    async fn move_relative(
        &self,
        id: Uuid,
        anchor_id: Uuid,
        position: RelativePosition,
    ) -> StoreResult<Node> {
        if anchor_id == id {
            return Err(StoreError::invalid_node(
                "node cannot be positioned relative to itself",
            ));
        }
        self.relocate(
            id,
            |state| Ok(state.get(anchor_id)?.parent_id),
            Target::NextTo(anchor_id, position),
        )
        .await
    }

    async fn renumber_group(
        &self,
        space_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Vec<Node>> {
        let Some(space) = self.existing_space(space_id).await else {
            return match parent_id {
                Some(parent_id) => Err(StoreError::not_found(parent_id)),
                None => Ok(Vec::new()),
            };
        };
        let mut state = space.lock().await;
        state.ensure_parent_exists(parent_id)?;

        let group = SiblingGroup::new(space_id, parent_id);
        let keys = self
            .allocator
            .compact(&state.siblings(parent_id))
            .map_err(|e| StoreError::keyspace_exhausted(group, e))?;

        let now = Utc::now();
        let changes: Vec<Node> = keys
            .iter()
            .filter_map(|key| {
                let node = state.nodes.get(&key.id)?;
                (node.sort != key.sort).then(|| {
                    let mut node = node.clone();
                    node.sort = key.sort;
                    node.updated_at = now;
                    node
                })
            })
            .collect();

        tracing::info!(%group, changed = changes.len(), "compacted sibling group");
        state.commit(space_id, changes)?;
        Ok(state.children(parent_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behaviors::ConstraintError;
    use crate::models::{NewNode, NodeType};

    async fn put(store: &MemoryStore, input: NewNode, node_type: NodeType) -> Node {
        let mut node = Node::from_new(input, node_type);
        node.sort = store.next_sort(node.space_id, node.parent_id).await.unwrap();
        store.create(node).await.unwrap()
    }

    fn sorts(nodes: &[Node]) -> Vec<i64> {
        nodes.iter().map(|n| n.sort).collect()
    }

    #[tokio::test]
    async fn test_append_is_monotonic() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();

        for expected in [1000, 2000, 3000] {
            let page = put(&store, NewNode::page(space_id), NodeType::Page).await;
            assert_eq!(page.sort, expected);
        }
        assert_eq!(store.len().await, 3);
    }

    #[tokio::test]
    async fn test_create_rejects_duplicate_sort() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let first = put(&store, NewNode::page(space_id), NodeType::Page).await;

        let mut clash = Node::from_new(NewNode::page(space_id), NodeType::Page);
        clash.sort = first.sort;
        let err = store.create(clash).await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSort { sort: 1000, .. }));
    }

    #[tokio::test]
    async fn test_create_appended_allocates_key() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let page = put(&store, NewNode::page(space_id), NodeType::Page).await;

        let mut block = Node::from_new(NewNode::block(space_id, page.id), NodeType::Block);
        block.sort = 42;
        let first = store.create_appended(block.clone()).await.unwrap();
        assert_eq!(first.sort, 1000);

        block.id = Uuid::new_v4();
        let second = store.create_appended(block).await.unwrap();
        assert_eq!(second.sort, 2000);
    }

    #[tokio::test]
    async fn test_create_appended_renumbers_on_overflow() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let mut last = Node::from_new(NewNode::page(space_id), NodeType::Page);
        last.sort = i64::MAX - 10;
        let last = store.create(last).await.unwrap();

        let appended = store
            .create_appended(Node::from_new(NewNode::page(space_id), NodeType::Page))
            .await
            .unwrap();
        assert_eq!(appended.sort, 2000);

        let children = store.list_children(space_id, None).await.unwrap();
        let ids: Vec<Uuid> = children.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![last.id, appended.id]);
        assert_eq!(sorts(&children), vec![1000, 2000]);
    }

    #[tokio::test]
    async fn test_create_rejects_missing_parent() {
        let store = MemoryStore::new();
        let mut block = Node::from_new(
            NewNode::block(Uuid::new_v4(), Uuid::new_v4()),
            NodeType::Block,
        );
        block.sort = 1000;
        assert!(matches!(
            store.create(block).await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_rejects_cycle() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let root = put(&store, NewNode::page(space_id), NodeType::Page).await;
        let child = put(&store, NewNode::page(space_id).with_parent(root.id), NodeType::Page).await;
        let grandchild =
            put(&store, NewNode::page(space_id).with_parent(child.id), NodeType::Page).await;

        let err = store
            .move_to_parent_append(root.id, Some(grandchild.id))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Constraint(ConstraintError::Cycle { .. })
        ));

        // Nothing moved
        assert_eq!(store.get(root.id).await.unwrap().parent_id, None);
    }

    #[tokio::test]
    async fn test_reorder_collision_renumbers_whole_group() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let a = put(&store, NewNode::page(space_id), NodeType::Page).await;
        let b = put(&store, NewNode::page(space_id), NodeType::Page).await;
        let c = put(&store, NewNode::page(space_id), NodeType::Page).await;

        // Squeeze b right after a, then move c onto b's key
        store.reorder_within_group(b.id, 1001).await.unwrap();
        store.reorder_within_group(c.id, 1001).await.unwrap();

        let children = store.list_children(space_id, None).await.unwrap();
        let ids: Vec<Uuid> = children.iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);
        assert_eq!(sorts(&children), vec![1000, 2000, 3000]);
    }

    #[tokio::test]
    async fn test_move_relative_between_siblings() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let a = put(&store, NewNode::page(space_id), NodeType::Page).await;
        let b = put(&store, NewNode::page(space_id), NodeType::Page).await;
        let c = put(&store, NewNode::page(space_id).with_parent(a.id), NodeType::Page).await;

        let moved = store
            .move_relative(c.id, a.id, RelativePosition::After)
            .await
            .unwrap();
        assert_eq!(moved.parent_id, None);
        assert_eq!(moved.sort, 1500);

        let ids: Vec<Uuid> = store
            .list_children(space_id, None)
            .await
            .unwrap()
            .iter()
            .map(|n| n.id)
            .collect();
        assert_eq!(ids, vec![a.id, c.id, b.id]);
    }

    #[tokio::test]
    async fn test_delete_cascades_and_frees_keys() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let page = put(&store, NewNode::page(space_id), NodeType::Page).await;
        let block = put(&store, NewNode::block(space_id, page.id), NodeType::Block).await;
        put(&store, NewNode::block(space_id, block.id), NodeType::Block).await;

        assert_eq!(store.delete(space_id, page.id).await.unwrap(), 3);
        assert!(store.is_empty().await);
        assert!(matches!(
            store.get(block.id).await,
            Err(StoreError::NotFound { .. })
        ));

        // Root group is empty again
        assert_eq!(store.next_sort(space_id, None).await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn test_delete_scoped_to_space() {
        let store = MemoryStore::new();
        let page = put(&store, NewNode::page(Uuid::new_v4()), NodeType::Page).await;

        let other_space = Uuid::new_v4();
        store.space(other_space).await;
        assert!(matches!(
            store.delete(other_space, page.id).await,
            Err(StoreError::NotFound { .. })
        ));
        assert!(store.get(page.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_renumber_group_compacts() {
        let store = MemoryStore::new();
        let space_id = Uuid::new_v4();
        let a = put(&store, NewNode::page(space_id), NodeType::Page).await;
        let b = put(&store, NewNode::page(space_id), NodeType::Page).await;
        store.reorder_within_group(a.id, -40).await.unwrap();
        store.reorder_within_group(b.id, 7).await.unwrap();

        let compacted = store.renumber_group(space_id, None).await.unwrap();
        assert_eq!(sorts(&compacted), vec![1000, 2000]);
        assert_eq!(compacted[0].id, a.id);
    }

    #[test]
    fn test_blocking_lookup_of_unknown_node() {
        let store = MemoryStore::new();
        let result = tokio_test::block_on(store.get(Uuid::new_v4()));
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }
}
