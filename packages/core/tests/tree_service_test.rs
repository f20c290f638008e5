//! Integration tests for TreeService
//!
//! Every scenario runs against both stores:
//! - ordering scenarios (append, insert between, collision renumbering)
//! - structural rules (type legality, cycles)
//! - tree-wide invariants after a mixed sequence of operations

use anyhow::Result;
use pagetree_core::{
    LibsqlStore, MemoryStore, NewNode, Node, NodeStore, NodeType, NodeUpdate, RelativePosition,
    TreeService, TreeServiceError,
};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

/// Test helper: one service per backend. The TempDir must outlive the service.
async fn create_test_services() -> Result<(Vec<(&'static str, TreeService)>, TempDir)> {
    let temp_dir = TempDir::new()?;
    let libsql = LibsqlStore::new(temp_dir.path().join("test.db")).await?;

    let services = vec![
        ("memory", TreeService::new(Arc::new(MemoryStore::new()))),
        ("libsql", TreeService::new(Arc::new(libsql))),
    ];
    Ok((services, temp_dir))
}

fn ids(nodes: &[Node]) -> Vec<Uuid> {
    nodes.iter().map(|n| n.id).collect()
}

fn sorts(nodes: &[Node]) -> Vec<i64> {
    nodes.iter().map(|n| n.sort).collect()
}

/// Walk the whole space and assert the tree invariants hold.
async fn assert_tree_invariants(store: &Arc<dyn NodeStore>, space_id: Uuid) -> Result<usize> {
    let mut pending = vec![(None::<Node>, store.list_children(space_id, None).await?)];
    let mut seen = HashSet::new();

    while let Some((parent, children)) = pending.pop() {
        let keys: HashSet<i64> = children.iter().map(|n| n.sort).collect();
        assert_eq!(keys.len(), children.len(), "duplicate sort under {:?}", parent.as_ref().map(|p| p.id));
        assert!(
            children.windows(2).all(|w| w[0].sort < w[1].sort),
            "children not ascending"
        );

        for child in children {
            assert!(seen.insert(child.id), "node {} reachable twice", child.id);
            assert_eq!(child.space_id, space_id);
            match (&parent, child.node_type) {
                (None, NodeType::Block) => panic!("root block {}", child.id),
                (Some(p), NodeType::Page) => assert_eq!(p.node_type, NodeType::Page),
                _ => {}
            }
            let grandchildren = store.list_children(space_id, Some(child.id)).await?;
            pending.push((Some(child), grandchildren));
        }
    }
    Ok(seen.len())
}

// =========================================================================
// Ordering
// =========================================================================

#[tokio::test]
async fn test_move_between_two_root_pages() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let p1 = service.create_page(NewNode::page(space_id)).await?;
        let p2 = service.create_page(NewNode::page(space_id)).await?;
        assert_eq!((p1.sort, p2.sort), (1000, 2000), "{backend}");

        service.move_page(p2.id, None, Some(1500)).await?;

        let roots = service.list_root_pages(space_id).await?;
        assert_eq!(ids(&roots), vec![p1.id, p2.id], "{backend}");
        assert_eq!(sorts(&roots), vec![1000, 1500], "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_append_is_strictly_increasing() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let page = service.create_page(NewNode::page(space_id)).await?;

        let mut last = i64::MIN;
        for _ in 0..8 {
            let block = service
                .create_block(NewNode::block(space_id, page.id))
                .await?;
            assert!(block.sort > last, "{backend}");
            last = block.sort;
        }

        // Moving a block to the end also lands after every sibling
        let children = service.list_page_children(page.id).await?;
        let moved = service.move_block(children[0].id, page.id, None).await?;
        assert!(moved.sort > last, "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_collision_renumbers_group_without_duplicates() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let page = service.create_page(NewNode::page(space_id)).await?;
        let a = service.create_block(NewNode::block(space_id, page.id)).await?;
        let b = service.create_block(NewNode::block(space_id, page.id)).await?;
        let c = service.create_block(NewNode::block(space_id, page.id)).await?;

        // a=1000, b=1001 leaves no room between them
        service.update_block_sort(b.id, 1001).await?;
        // c onto b's key: group becomes a, c, b
        service.update_block_sort(c.id, 1001).await?;

        let children = service.list_page_children(page.id).await?;
        assert_eq!(ids(&children), vec![a.id, c.id, b.id], "{backend}");
        assert_eq!(sorts(&children), vec![1000, 2000, 3000], "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_extreme_key_elsewhere_does_not_block_renumbering() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let page = service.create_page(NewNode::page(space_id)).await?;
        let outlier = service.create_page(NewNode::page(space_id)).await?;
        let a = service.create_block(NewNode::block(space_id, page.id)).await?;
        let b = service.create_block(NewNode::block(space_id, page.id)).await?;
        let c = service.create_block(NewNode::block(space_id, page.id)).await?;

        service.update_page_sort(outlier.id, i64::MIN).await?;
        let moved = service.update_block_sort(c.id, a.sort).await?;
        assert_eq!(moved.sort, 1000, "{backend}");

        let children = service.list_page_children(page.id).await?;
        assert_eq!(ids(&children), vec![c.id, a.id, b.id], "{backend}");
        assert_eq!(sorts(&children), vec![1000, 2000, 3000], "{backend}");

        let roots = service.list_root_pages(space_id).await?;
        assert_eq!(ids(&roots), vec![outlier.id, page.id], "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_reorder_to_own_sort_changes_nothing() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let page = service.create_page(NewNode::page(space_id)).await?;
        let blocks = [
            service.create_block(NewNode::block(space_id, page.id)).await?,
            service.create_block(NewNode::block(space_id, page.id)).await?,
        ];

        let before = service.list_page_children(page.id).await?;
        service.update_block_sort(blocks[1].id, blocks[1].sort).await?;
        service.update_block_sort(blocks[1].id, blocks[1].sort).await?;
        let after = service.list_page_children(page.id).await?;

        assert_eq!(sorts(&before), sorts(&after), "{backend}");
        assert_eq!(ids(&before), ids(&after), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_relative_moves_keep_neighbour_order() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let page = service.create_page(NewNode::page(space_id)).await?;
        let a = service.create_block(NewNode::block(space_id, page.id)).await?;
        let b = service.create_block(NewNode::block(space_id, page.id)).await?;
        let c = service.create_block(NewNode::block(space_id, page.id)).await?;

        service
            .move_node_relative(NodeType::Block, c.id, a.id, RelativePosition::After)
            .await?;
        service
            .move_node_relative(NodeType::Block, b.id, a.id, RelativePosition::Before)
            .await?;

        let children = service.list_page_children(page.id).await?;
        assert_eq!(ids(&children), vec![b.id, a.id, c.id], "{backend}");
    }
    Ok(())
}

// =========================================================================
// Structure
// =========================================================================

#[tokio::test]
async fn test_block_without_parent_is_rejected() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let result = service.create_block(NewNode::new(Uuid::new_v4())).await;
        assert!(
            matches!(result, Err(TreeServiceError::InvalidArgument { .. })),
            "{backend}"
        );
    }
    Ok(())
}

#[tokio::test]
async fn test_move_under_own_child_is_cycle() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let p1 = service.create_page(NewNode::page(space_id)).await?;
        let child = service
            .create_page(NewNode::page(space_id).with_parent(p1.id))
            .await?;
        let grandchild = service
            .create_page(NewNode::page(space_id).with_parent(child.id))
            .await?;

        for target in [child.id, grandchild.id] {
            let result = service.move_page(p1.id, Some(target), Some(10)).await;
            assert!(
                matches!(result, Err(TreeServiceError::Cycle { .. })),
                "{backend}"
            );
        }

        // Rejected moves leave the tree untouched
        let p1_after = service.get_page_properties(p1.id).await?;
        assert_eq!((p1_after.parent_id, p1_after.sort), (None, p1.sort), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_subtree_is_nested_and_ordered() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let page = service.create_page(NewNode::page(space_id).with_title("Doc")).await?;
        let heading = service.create_block(NewNode::block(space_id, page.id)).await?;
        let body = service.create_block(NewNode::block(space_id, page.id)).await?;
        let nested = service.create_block(NewNode::block(space_id, heading.id)).await?;
        let hidden = service.create_block(NewNode::block(space_id, body.id)).await?;
        service
            .update_block_properties(hidden.id, NodeUpdate::new().with_archived(true))
            .await?;

        let tree = service.get_subtree(NodeType::Page, page.id).await?;
        assert_eq!(tree.node.title, "Doc", "{backend}");
        assert_eq!(tree.node_count(), 4, "{backend}");
        assert_eq!(tree.children[0].node.id, heading.id, "{backend}");
        assert_eq!(tree.children[0].children[0].node.id, nested.id, "{backend}");
        assert!(tree.children[1].children.is_empty(), "{backend}");
    }
    Ok(())
}

#[tokio::test]
async fn test_invariants_hold_after_mixed_operations() -> Result<()> {
    let (services, _temp_dir) = create_test_services().await?;
    for (backend, service) in services {
        let space_id = Uuid::new_v4();
        let mut pages = Vec::new();
        let mut blocks = Vec::new();

        for i in 0..4 {
            let parent = pages.get(i / 2).map(|p: &Node| p.id);
            let input = match parent {
                Some(parent_id) => NewNode::page(space_id).with_parent(parent_id),
                None => NewNode::page(space_id),
            };
            pages.push(service.create_page(input).await?);
        }
        for i in 0..10 {
            let parent = if i % 3 == 0 {
                pages[i % pages.len()].id
            } else {
                blocks
                    .last()
                    .map(|b: &Node| b.id)
                    .unwrap_or(pages[0].id)
            };
            blocks.push(service.create_block(NewNode::block(space_id, parent)).await?);
        }

        // Shuffle things around deterministically; some of these must fail
        for (i, block) in blocks.clone().iter().enumerate() {
            let parent = if i % 2 == 0 { pages[i % 4].id } else { blocks[(i * 7) % 10].id };
            let target = if i % 3 == 0 { Some(1000) } else { None };
            match service.move_block(block.id, parent, target).await {
                Ok(_) | Err(TreeServiceError::Cycle { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        for page in &pages[1..] {
            service.move_page(page.id, None, Some(1000)).await?;
        }
        service.update_page_sort(pages[3].id, 1).await?;

        let count = assert_tree_invariants(&service.store(), space_id).await?;
        assert_eq!(count, 14, "{backend}");

        let removed = service.delete_page(space_id, pages[0].id).await?;
        let remaining = assert_tree_invariants(&service.store(), space_id).await?;
        assert_eq!(remaining as u64 + removed, 14, "{backend}");
    }
    Ok(())
}

#[test]
fn test_blocking_caller() -> Result<()> {
    let service = TreeService::new(Arc::new(MemoryStore::new()));
    let space_id = Uuid::new_v4();

    let page = tokio_test::block_on(service.create_page(NewNode::page(space_id)))?;
    let fetched = tokio_test::block_on(service.get_page_properties(page.id))?;
    assert_eq!(fetched, page);
    Ok(())
}
