//! Concurrent access tests
//!
//! Many tasks mutating the same sibling group must never leave duplicate
//! sort keys behind, and work in unrelated spaces must not block on each
//! other.

use anyhow::Result;
use pagetree_core::{LibsqlStore, MemoryStore, NewNode, Node, TreeConfig, TreeService};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::task::JoinSet;
use uuid::Uuid;

const WRITERS: u32 = 12;

/// Keys are allocated inside each store write, so no writer should ever
/// need a retry.
fn no_retry_config() -> TreeConfig {
    TreeConfig {
        conflict_retries: 0,
        ..TreeConfig::default()
    }
}

fn assert_unique_sorts(children: &[Node]) {
    let keys: HashSet<i64> = children.iter().map(|n| n.sort).collect();
    assert_eq!(keys.len(), children.len(), "duplicate sort keys: {:?}", children);
}

async fn concurrent_appends(service: Arc<TreeService>) -> Result<()> {
    let space_id = Uuid::new_v4();
    let page = service.create_page(NewNode::page(space_id)).await?;
    let page_id = page.id;

    let mut tasks = JoinSet::new();
    for _ in 0..WRITERS {
        let service = Arc::clone(&service);
        tasks.spawn(async move { service.create_block(NewNode::block(space_id, page_id)).await });
    }
    while let Some(result) = tasks.join_next().await {
        result??;
    }

    let children = service.list_page_children(page.id).await?;
    assert_eq!(children.len(), WRITERS as usize);
    assert_unique_sorts(&children);
    Ok(())
}

async fn concurrent_moves_to_same_key(service: Arc<TreeService>) -> Result<()> {
    let space_id = Uuid::new_v4();
    let target = service.create_page(NewNode::page(space_id)).await?;
    let source = service.create_page(NewNode::page(space_id)).await?;

    let mut blocks = Vec::new();
    for _ in 0..WRITERS {
        blocks.push(service.create_block(NewNode::block(space_id, source.id)).await?);
    }

    let mut tasks = JoinSet::new();
    for block in blocks {
        let service = Arc::clone(&service);
        let target_id = target.id;
        tasks.spawn(async move { service.move_block(block.id, target_id, Some(1000)).await });
    }
    while let Some(result) = tasks.join_next().await {
        result??;
    }

    let moved = service.list_page_children(target.id).await?;
    assert_eq!(moved.len(), WRITERS as usize);
    assert_unique_sorts(&moved);
    assert!(service.list_page_children(source.id).await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_appends() -> Result<()> {
    let service = Arc::new(TreeService::in_memory(TreeConfig::default())?);
    concurrent_appends(service).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_moves_to_same_key() -> Result<()> {
    let service = Arc::new(TreeService::in_memory(TreeConfig::default())?);
    concurrent_moves_to_same_key(service).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_libsql_concurrent_appends() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let service = Arc::new(TreeService::open(temp_dir.path().join("test.db"), TreeConfig::default()).await?);
    concurrent_appends(service).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_libsql_concurrent_moves_to_same_key() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let store = LibsqlStore::new(temp_dir.path().join("test.db")).await?;
    let service = Arc::new(TreeService::with_config(Arc::new(store), TreeConfig::default())?);
    concurrent_moves_to_same_key(service).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_memory_concurrent_creates_need_no_retry() -> Result<()> {
    let service = Arc::new(TreeService::in_memory(no_retry_config())?);
    concurrent_appends(Arc::clone(&service)).await?;
    concurrent_moves_to_same_key(service).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_libsql_concurrent_creates_need_no_retry() -> Result<()> {
    let temp_dir = TempDir::new()?;
    let service = Arc::new(TreeService::open(temp_dir.path().join("test.db"), no_retry_config()).await?);
    concurrent_appends(Arc::clone(&service)).await?;
    concurrent_moves_to_same_key(service).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_disjoint_spaces_proceed_in_parallel() -> Result<()> {
    let service = Arc::new(TreeService::new(Arc::new(MemoryStore::new())));

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let service = Arc::clone(&service);
        tasks.spawn(async move {
            let space_id = Uuid::new_v4();
            let page = service.create_page(NewNode::page(space_id)).await?;
            for _ in 0..20 {
                service.create_block(NewNode::block(space_id, page.id)).await?;
            }
            service.list_page_children(page.id).await
        });
    }

    let finished = tokio::time::timeout(Duration::from_secs(10), async {
        let mut groups = Vec::new();
        while let Some(result) = tasks.join_next().await {
            groups.push(result??);
        }
        Ok::<_, anyhow::Error>(groups)
    })
    .await??;

    assert_eq!(finished.len(), 8);
    for children in finished {
        assert_eq!(children.len(), 20);
        let sorts: Vec<i64> = children.iter().map(|n| n.sort).collect();
        assert_eq!(sorts, (1..=20).map(|i| i * 1000).collect::<Vec<_>>());
    }
    Ok(())
}

#[tokio::test]
async fn test_dropped_operation_persists_nothing() -> Result<()> {
    let service = TreeService::in_memory(TreeConfig::default())?;
    let space_id = Uuid::new_v4();
    let page = service.create_page(NewNode::page(space_id)).await?;

    // Polled once and dropped before completion
    {
        let pending = service.create_block(NewNode::block(space_id, page.id));
        tokio::pin!(pending);
        let _ = poll_once(pending.as_mut()).await;
    }

    let children = service.list_page_children(page.id).await?;
    assert!(children.len() <= 1);
    assert_unique_sorts(&children);
    Ok(())
}

/// Poll a future a single time, returning whether it finished.
async fn poll_once<F: Future + Unpin>(fut: F) -> bool {
    let mut fut = fut;
    std::future::poll_fn(|cx| {
        std::task::Poll::Ready(std::pin::Pin::new(&mut fut).poll(cx).is_ready())
    })
    .await
}
