//! libsql-backed NodeStore
//!
//! Nodes live in a single `nodes` table. The database enforces what it can
//! on its own:
//!
//! - `UNIQUE (space_id, COALESCE(parent_id, ''), sort)` so keys never repeat
//!   inside a sibling group (root groups included)
//! - `CHECK` constraints on the node type, on blocks requiring a parent, and
//!   on self-parenting
//! - `parent_id` references `nodes(id)` with `ON DELETE CASCADE`
//!
//! Parent type and cycle checks run in Rust inside the same `BEGIN IMMEDIATE`
//! transaction as the write. Writers are additionally serialized through an
//! in-process lock so concurrent moves wait instead of hitting `SQLITE_BUSY`.
//!
//! Every operation opens its own connection (see `connect_with_timeout`). A
//! dropped future drops its connection, which rolls back any open
//! transaction.

use crate::behaviors::{ensure_acyclic, validate_parent};
use crate::db::error::{StoreError, StoreResult};
use crate::db::node_store::NodeStore;
use crate::db::sort_allocator::{KeyspaceExhausted, Placement, SiblingKey, SortKeyAllocator};
use crate::models::{Node, NodeType, NodeUpdate, RelativePosition, SiblingGroup};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const NODE_COLUMNS: &str =
    "id, space_id, type, parent_id, title, properties, sort, archived, created_at, updated_at";

const SORT_INDEX: &str = "ux_nodes_space_parent_sort";

/// Where a moving node should land inside its destination group
#[derive(Debug, Clone, Copy)]
enum Target {
    Append,
    At(i64),
    NextTo(Uuid, RelativePosition),
}

/// Node store backed by an embedded libsql database file
///
/// # Examples
///
/// ```no_run
/// use pagetree_core::db::LibsqlStore;
/// use std::path::PathBuf;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let store = LibsqlStore::new(PathBuf::from("./data/pagetree.db")).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LibsqlStore {
    db: Arc<Database>,
    db_path: PathBuf,
    allocator: SortKeyAllocator,
    write_lock: Mutex<()>,
}

impl LibsqlStore {
    /// Open (or create) the database at `db_path` with the default key gap.
    ///
    /// Parent directories are created as needed and the schema is
    /// initialized idempotently.
    pub async fn new(db_path: PathBuf) -> StoreResult<Self> {
        Self::with_allocator(db_path, SortKeyAllocator::default()).await
    }

    pub async fn with_allocator(db_path: PathBuf, allocator: SortKeyAllocator) -> StoreResult<Self> {
        let is_new_database = !db_path.exists();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = Builder::new_local(&db_path)
            .build()
            .await
            .map_err(|e| StoreError::connection_failed(db_path.clone(), e))?;

        let store = Self {
            db: Arc::new(db),
            db_path,
            allocator,
            write_lock: Mutex::new(()),
        };
        store.initialize_schema(is_new_database).await?;

        tracing::info!(path = %store.db_path.display(), "opened node store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Open a connection with a 5 second busy timeout and foreign keys on.
    pub async fn connect_with_timeout(&self) -> StoreResult<Connection> {
        let conn = self
            .db
            .connect()
            .map_err(|e| StoreError::connection_failed(self.db_path.clone(), e))?;
        execute_pragma(&conn, "PRAGMA busy_timeout = 5000").await?;
        execute_pragma(&conn, "PRAGMA foreign_keys = ON").await?;
        Ok(conn)
    }

    async fn initialize_schema(&self, is_new_database: bool) -> StoreResult<()> {
        let conn = self.connect_with_timeout().await?;
        execute_pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS nodes (
                id TEXT PRIMARY KEY,
                space_id TEXT NOT NULL,
                type TEXT NOT NULL CHECK (type IN ('page', 'block')),
                parent_id TEXT,
                title TEXT NOT NULL DEFAULT '',
                properties TEXT NOT NULL DEFAULT '{}',
                sort INTEGER NOT NULL,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (type <> 'block' OR parent_id IS NOT NULL),
                CHECK (parent_id IS NULL OR parent_id <> id),
                FOREIGN KEY (parent_id) REFERENCES nodes(id) ON DELETE CASCADE
            )",
            (),
        )
        .await
        .map_err(|e| {
            StoreError::initialization_failed(format!("Failed to create nodes table: {}", e))
        })?;

        let indexes = [
            format!(
                "CREATE UNIQUE INDEX IF NOT EXISTS {} ON nodes(space_id, COALESCE(parent_id, ''), sort)",
                SORT_INDEX
            ),
            "CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_id)".to_string(),
        ];
        for sql in &indexes {
            conn.execute(sql, ()).await.map_err(|e| {
                StoreError::initialization_failed(format!("Failed to create index: {}", e))
            })?;
        }

        if is_new_database {
            execute_pragma(&conn, "PRAGMA wal_checkpoint(TRUNCATE)").await?;
        }
        Ok(())
    }

    /// Take the writer lock and open an immediate transaction.
    async fn begin(&self) -> StoreResult<(MutexGuard<'_, ()>, Connection)> {
        let guard = self.write_lock.lock().await;
        let conn = self.connect_with_timeout().await?;
        conn.execute("BEGIN IMMEDIATE", ())
            .await
            .map_err(|e| StoreError::sql_execution(format!("Failed to begin transaction: {}", e)))?;
        Ok((guard, conn))
    }

    async fn relocate(
        &self,
        conn: &Connection,
        id: Uuid,
        new_parent_id: Option<Uuid>,
        target: Target,
    ) -> StoreResult<Node> {
        let node = fetch_node(conn, id).await?;

        let parent = match new_parent_id {
            Some(parent_id) => Some(fetch_node(conn, parent_id).await?),
            None => None,
        };
        validate_parent(node.node_type, node.space_id, parent.as_ref())?;

        if let Some(parent_id) = new_parent_id {
            let max_steps = count_space(conn, node.space_id).await?;
            let chain = ancestor_chain(conn, parent_id, max_steps).await?;
            ensure_acyclic(id, parent_id, max_steps, |n| chain.get(&n).copied().flatten())?;
        }

        let group = SiblingGroup::new(node.space_id, new_parent_id);
        let siblings = sibling_keys(conn, group).await?;
        let exhausted = |e: KeyspaceExhausted| StoreError::keyspace_exhausted(group, e);

        let placement = match target {
            Target::Append => self.allocator.place_last(&siblings, id).map_err(exhausted)?,
            Target::At(sort) => self
                .allocator
                .place_at(&siblings, id, sort)
                .map_err(exhausted)?,
            Target::NextTo(anchor, position) => self
                .allocator
                .place_next_to(&siblings, id, anchor, position == RelativePosition::After)
                .ok_or_else(|| StoreError::not_found(anchor))?
                .map_err(exhausted)?,
        };

        let keys = match placement {
            Placement::Key(sort) => vec![SiblingKey::new(id, sort)],
            Placement::Renumber(keys) => {
                tracing::info!(%group, members = keys.len(), "renumbering sibling group");
                keys
            }
        };

        let now = Utc::now();
        write_keys(conn, group, &keys, Some((id, node.parent_id)), now).await?;

        let moved = fetch_node(conn, id).await?;
        tracing::debug!(node_id = %id, parent_id = ?moved.parent_id, sort = moved.sort, "node positioned");
        Ok(moved)
    }

    async fn transact<T>(
        &self,
        conn: &Connection,
        result: StoreResult<T>,
    ) -> StoreResult<T> {
        match result {
            Ok(value) => {
                conn.execute("COMMIT", ()).await.map_err(|e| {
                    StoreError::sql_execution(format!("Failed to commit transaction: {}", e))
                })?;
                Ok(value)
            }
            Err(e) => {
                let _rollback = conn.execute("ROLLBACK", ()).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl NodeStore for LibsqlStore {
    async fn get(&self, id: Uuid) -> StoreResult<Node> {
        let conn = self.connect_with_timeout().await?;
        fetch_node(&conn, id).await
    }

    async fn create(&self, node: Node) -> StoreResult<Node> {
        node.validate()
            .map_err(|e| StoreError::invalid_node(e.to_string()))?;

        let (_guard, conn) = self.begin().await?;
        let result: StoreResult<Node> = async {
            let parent = match node.parent_id {
                Some(parent_id) => Some(fetch_node(&conn, parent_id).await?),
                None => None,
            };
            validate_parent(node.node_type, node.space_id, parent.as_ref())?;
            insert_node(&conn, &node).await?;
            Ok(node)
        }
        .await;
        self.transact(&conn, result).await
    }

    async fn create_appended(&self, mut node: Node) -> StoreResult<Node> {
        node.validate()
            .map_err(|e| StoreError::invalid_node(e.to_string()))?;

        let (_guard, conn) = self.begin().await?;
        let result: StoreResult<Node> = async {
            let parent = match node.parent_id {
                Some(parent_id) => Some(fetch_node(&conn, parent_id).await?),
                None => None,
            };
            validate_parent(node.node_type, node.space_id, parent.as_ref())?;

            let group = node.group();
            let siblings = sibling_keys(&conn, group).await?;
            let placement = self
                .allocator
                .place_last(&siblings, node.id)
                .map_err(|e| StoreError::keyspace_exhausted(group, e))?;

            match placement {
                Placement::Key(sort) => node.sort = sort,
                Placement::Renumber(keys) => {
                    tracing::info!(%group, members = keys.len(), "renumbering sibling group");
                    let existing: Vec<SiblingKey> =
                        keys.iter().copied().filter(|k| k.id != node.id).collect();
                    write_keys(&conn, group, &existing, None, Utc::now()).await?;
                    if let Some(own) = keys.iter().find(|k| k.id == node.id) {
                        node.sort = own.sort;
                    }
                }
            }

            insert_node(&conn, &node).await?;
            tracing::debug!(node_id = %node.id, %group, sort = node.sort, "appended node");
            Ok(node)
        }
        .await;
        self.transact(&conn, result).await
    }

    async fn update(&self, id: Uuid, update: NodeUpdate) -> StoreResult<Node> {
        let (_guard, conn) = self.begin().await?;
        let result: StoreResult<Node> = async {
            let mut node = fetch_node(&conn, id).await?;
            node.apply_update(&update);
            node.validate()
                .map_err(|e| StoreError::invalid_node(e.to_string()))?;

            conn.execute(
                "UPDATE nodes SET title = ?, properties = ?, archived = ?, updated_at = ? WHERE id = ?",
                vec![
                    Value::Text(node.title.clone()),
                    Value::Text(node.properties.to_string()),
                    Value::Integer(i64::from(node.archived)),
                    Value::Text(node.updated_at.to_rfc3339()),
                    Value::Text(id.to_string()),
                ],
            )
            .await
            .map_err(|e| StoreError::sql_execution(format!("Failed to update node: {}", e)))?;
            Ok(node)
        }
        .await;
        self.transact(&conn, result).await
    }

    async fn delete(&self, space_id: Uuid, id: Uuid) -> StoreResult<u64> {
        let (_guard, conn) = self.begin().await?;
        let result: StoreResult<u64> = async {
            let node = fetch_node(&conn, id).await?;
            if node.space_id != space_id {
                return Err(StoreError::not_found(id));
            }

            let max_steps = count_space(&conn, space_id).await?;
            let removed = count_subtree(&conn, id, max_steps).await?;

            conn.execute(
                "DELETE FROM nodes WHERE id = ? AND space_id = ?",
                vec![Value::Text(id.to_string()), Value::Text(space_id.to_string())],
            )
            .await
            .map_err(|e| StoreError::sql_execution(format!("Failed to delete node: {}", e)))?;

            tracing::debug!(node_id = %id, removed, "deleted subtree");
            Ok(removed)
        }
        .await;
        self.transact(&conn, result).await
    }

    async fn list_children(
        &self,
        space_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Vec<Node>> {
        let conn = self.connect_with_timeout().await?;
        if let Some(parent_id) = parent_id {
            let parent = fetch_node(&conn, parent_id).await?;
            if parent.space_id != space_id {
                return Err(StoreError::not_found(parent_id));
            }
        }
        fetch_children(&conn, SiblingGroup::new(space_id, parent_id)).await
    }

    async fn next_sort(&self, space_id: Uuid, parent_id: Option<Uuid>) -> StoreResult<i64> {
        let conn = self.connect_with_timeout().await?;
        let group = SiblingGroup::new(space_id, parent_id);

        let mut rows = conn
            .query(
                "SELECT MAX(sort), COUNT(*) FROM nodes WHERE space_id = ? AND parent_id IS ?",
                group_params(group),
            )
            .await
            .map_err(|e| StoreError::sql_execution(format!("Failed to query max sort: {}", e)))?;

        let (max, members) = match rows
            .next()
            .await
            .map_err(|e| StoreError::sql_execution(e.to_string()))?
        {
            Some(row) => (
                row.get::<Option<i64>>(0)
                    .map_err(|e| StoreError::sql_execution(e.to_string()))?,
                row.get::<i64>(1)
                    .map_err(|e| StoreError::sql_execution(e.to_string()))?,
            ),
            None => (None, 0),
        };

        self.allocator.next_key(max).ok_or_else(|| {
            StoreError::keyspace_exhausted(
                group,
                KeyspaceExhausted {
                    members: usize::try_from(members).unwrap_or(usize::MAX),
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
        let (_guard, conn) = self.begin().await?;
        let result = self.relocate(&conn, id, new_parent_id, Target::Append).await;
        self.transact(&conn, result).await
    }

    async fn move_to_parent_at_sort(
        &self,
        id: Uuid,
        new_parent_id: Option<Uuid>,
        target_sort: i64,
    ) -> StoreResult<Node> {
        let (_guard, conn) = self.begin().await?;
        let result = self
            .relocate(&conn, id, new_parent_id, Target::At(target_sort))
            .await;
        self.transact(&conn, result).await
    }

    async fn reorder_within_group(&self, id: Uuid, target_sort: i64) -> StoreResult<Node> {
        let (_guard, conn) = self.begin().await?;
        let result: StoreResult<Node> = async {
            let node = fetch_node(&conn, id).await?;
            self.relocate(&conn, id, node.parent_id, Target::At(target_sort))
                .await
        }
        .await;
        self.transact(&conn, result).await
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

        let (_guard, conn) = self.begin().await?;
        let result: StoreResult<Node> = async {
            let node = fetch_node(&conn, id).await?;
            let anchor = fetch_node(&conn, anchor_id).await?;
            if anchor.space_id != node.space_id {
                return Err(StoreError::not_found(anchor_id));
            }
            self.relocate(
                &conn,
                id,
                anchor.parent_id,
                Target::NextTo(anchor_id, position),
            )
            .await
        }
        .await;
        self.transact(&conn, result).await
    }

    async fn renumber_group(
        &self,
        space_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> StoreResult<Vec<Node>> {
        let group = SiblingGroup::new(space_id, parent_id);

        let (_guard, conn) = self.begin().await?;
        let result: StoreResult<Vec<Node>> = async {
            if let Some(parent_id) = parent_id {
                fetch_node(&conn, parent_id).await?;
            }
            let siblings = sibling_keys(&conn, group).await?;
            let keys = self
                .allocator
                .compact(&siblings)
                .map_err(|e| StoreError::keyspace_exhausted(group, e))?;

            write_keys(&conn, group, &keys, None, Utc::now()).await?;
            tracing::info!(%group, members = keys.len(), "compacted sibling group");
            fetch_children(&conn, group).await
        }
        .await;
        self.transact(&conn, result).await
    }
}

//
// SQL HELPERS
//

/// PRAGMA statements return rows, so they go through `query` rather than
/// `execute`.
async fn execute_pragma(conn: &Connection, pragma: &str) -> StoreResult<()> {
    let mut stmt = conn.prepare(pragma).await.map_err(|e| {
        StoreError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
    })?;
    let _ = stmt.query(()).await.map_err(|e| {
        StoreError::sql_execution(format!("Failed to execute '{}': {}", pragma, e))
    })?;
    Ok(())
}

fn uuid_value(id: Option<Uuid>) -> Value {
    id.map_or(Value::Null, |id| Value::Text(id.to_string()))
}

fn group_params(group: SiblingGroup) -> Vec<Value> {
    vec![
        Value::Text(group.space_id.to_string()),
        uuid_value(group.parent_id),
    ]
}

fn is_sort_conflict(e: &libsql::Error) -> bool {
    let message = e.to_string();
    message.contains("UNIQUE constraint failed") && message.contains(SORT_INDEX)
}

fn parse_uuid(value: &str, column: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| StoreError::invalid_node(format!("Bad {} '{}': {}", column, value, e)))
}

fn parse_time(value: &str, column: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::invalid_node(format!("Bad {} '{}': {}", column, value, e)))
}

fn row_to_node(row: &libsql::Row) -> StoreResult<Node> {
    let column = |e: libsql::Error| StoreError::sql_execution(format!("Failed to read row: {}", e));

    let id: String = row.get(0).map_err(column)?;
    let space_id: String = row.get(1).map_err(column)?;
    let node_type: String = row.get(2).map_err(column)?;
    let parent_id: Option<String> = row.get(3).map_err(column)?;
    let title: String = row.get(4).map_err(column)?;
    let properties: String = row.get(5).map_err(column)?;
    let sort: i64 = row.get(6).map_err(column)?;
    let archived: i64 = row.get(7).map_err(column)?;
    let created_at: String = row.get(8).map_err(column)?;
    let updated_at: String = row.get(9).map_err(column)?;

    Ok(Node {
        id: parse_uuid(&id, "id")?,
        space_id: parse_uuid(&space_id, "space_id")?,
        node_type: node_type
            .parse::<NodeType>()
            .map_err(|e| StoreError::invalid_node(e.to_string()))?,
        parent_id: parent_id
            .as_deref()
            .map(|p| parse_uuid(p, "parent_id"))
            .transpose()?,
        title,
        properties: serde_json::from_str(&properties)
            .map_err(|e| StoreError::invalid_node(format!("Bad properties: {}", e)))?,
        sort,
        archived: archived != 0,
        created_at: parse_time(&created_at, "created_at")?,
        updated_at: parse_time(&updated_at, "updated_at")?,
    })
}

async fn fetch_node(conn: &Connection, id: Uuid) -> StoreResult<Node> {
    let mut rows = conn
        .query(
            &format!("SELECT {} FROM nodes WHERE id = ?", NODE_COLUMNS),
            vec![Value::Text(id.to_string())],
        )
        .await
        .map_err(|e| StoreError::sql_execution(format!("Failed to execute get query: {}", e)))?;

    match rows
        .next()
        .await
        .map_err(|e| StoreError::sql_execution(e.to_string()))?
    {
        Some(row) => row_to_node(&row),
        None => Err(StoreError::not_found(id)),
    }
}

async fn fetch_children(conn: &Connection, group: SiblingGroup) -> StoreResult<Vec<Node>> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {} FROM nodes WHERE space_id = ? AND parent_id IS ? ORDER BY sort",
                NODE_COLUMNS
            ),
            group_params(group),
        )
        .await
        .map_err(|e| StoreError::sql_execution(format!("Failed to list children: {}", e)))?;

    let mut nodes = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| StoreError::sql_execution(e.to_string()))?
    {
        nodes.push(row_to_node(&row)?);
    }
    Ok(nodes)
}

async fn sibling_keys(conn: &Connection, group: SiblingGroup) -> StoreResult<Vec<SiblingKey>> {
    let mut rows = conn
        .query(
            "SELECT id, sort FROM nodes WHERE space_id = ? AND parent_id IS ? ORDER BY sort",
            group_params(group),
        )
        .await
        .map_err(|e| StoreError::sql_execution(format!("Failed to read sibling keys: {}", e)))?;

    let mut keys = Vec::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| StoreError::sql_execution(e.to_string()))?
    {
        let id: String = row
            .get(0)
            .map_err(|e| StoreError::sql_execution(e.to_string()))?;
        let sort: i64 = row
            .get(1)
            .map_err(|e| StoreError::sql_execution(e.to_string()))?;
        keys.push(SiblingKey::new(parse_uuid(&id, "id")?, sort));
    }
    Ok(keys)
}

async fn scalar(conn: &Connection, sql: &str, params: Vec<Value>) -> StoreResult<i64> {
    let mut rows = conn
        .query(sql, params)
        .await
        .map_err(|e| StoreError::sql_execution(format!("Failed to execute '{}': {}", sql, e)))?;
    let row = rows
        .next()
        .await
        .map_err(|e| StoreError::sql_execution(e.to_string()))?
        .ok_or_else(|| StoreError::sql_execution(format!("No result for '{}'", sql)))?;
    Ok(row
        .get::<Option<i64>>(0)
        .map_err(|e| StoreError::sql_execution(e.to_string()))?
        .unwrap_or(0))
}

async fn count_space(conn: &Connection, space_id: Uuid) -> StoreResult<usize> {
    let count = scalar(
        conn,
        "SELECT COUNT(*) FROM nodes WHERE space_id = ?",
        vec![Value::Text(space_id.to_string())],
    )
    .await?;
    Ok(usize::try_from(count).unwrap_or(0))
}

async fn count_subtree(conn: &Connection, id: Uuid, max_depth: usize) -> StoreResult<u64> {
    let count = scalar(
        conn,
        "WITH RECURSIVE subtree(id, depth) AS (
            SELECT id, 0 FROM nodes WHERE id = ?1
            UNION ALL
            SELECT n.id, s.depth + 1 FROM nodes n JOIN subtree s ON n.parent_id = s.id
            WHERE s.depth < ?2
        )
        SELECT COUNT(*) FROM subtree",
        vec![
            Value::Text(id.to_string()),
            Value::Integer(i64::try_from(max_depth).unwrap_or(i64::MAX)),
        ],
    )
    .await?;
    Ok(u64::try_from(count).unwrap_or(0))
}

/// `start` and its ancestors, mapped to their parents.
async fn ancestor_chain(
    conn: &Connection,
    start: Uuid,
    max_depth: usize,
) -> StoreResult<HashMap<Uuid, Option<Uuid>>> {
    let mut rows = conn
        .query(
            "WITH RECURSIVE chain(id, parent_id, depth) AS (
                SELECT id, parent_id, 0 FROM nodes WHERE id = ?1
                UNION ALL
                SELECT n.id, n.parent_id, c.depth + 1 FROM nodes n JOIN chain c ON n.id = c.parent_id
                WHERE c.depth < ?2
            )
            SELECT id, parent_id FROM chain",
            vec![
                Value::Text(start.to_string()),
                Value::Integer(i64::try_from(max_depth).unwrap_or(i64::MAX)),
            ],
        )
        .await
        .map_err(|e| StoreError::sql_execution(format!("Failed to walk ancestors: {}", e)))?;

    let mut chain = HashMap::new();
    while let Some(row) = rows
        .next()
        .await
        .map_err(|e| StoreError::sql_execution(e.to_string()))?
    {
        let id: String = row
            .get(0)
            .map_err(|e| StoreError::sql_execution(e.to_string()))?;
        let parent_id: Option<String> = row
            .get(1)
            .map_err(|e| StoreError::sql_execution(e.to_string()))?;
        chain.insert(
            parse_uuid(&id, "id")?,
            parent_id
                .as_deref()
                .map(|p| parse_uuid(p, "parent_id"))
                .transpose()?,
        );
    }
    Ok(chain)
}

async fn insert_node(conn: &Connection, node: &Node) -> StoreResult<()> {
    conn.execute(
        &format!(
            "INSERT INTO nodes ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            NODE_COLUMNS
        ),
        vec![
            Value::Text(node.id.to_string()),
            Value::Text(node.space_id.to_string()),
            Value::Text(node.node_type.to_string()),
            uuid_value(node.parent_id),
            Value::Text(node.title.clone()),
            Value::Text(node.properties.to_string()),
            Value::Integer(node.sort),
            Value::Integer(i64::from(node.archived)),
            Value::Text(node.created_at.to_rfc3339()),
            Value::Text(node.updated_at.to_rfc3339()),
        ],
    )
    .await
    .map_err(|e| {
        if is_sort_conflict(&e) {
            StoreError::duplicate_sort(node.group(), node.sort)
        } else if e.to_string().contains("nodes.id") {
            StoreError::invalid_node(format!("node {} already exists", node.id))
        } else {
            StoreError::sql_execution(format!("Failed to insert node: {}", e))
        }
    })?;
    Ok(())
}

/// Start of `count` consecutive integers that are absent from `used`,
/// preferring the run just below the smallest key.
fn free_run(used: &mut [i64], count: i64) -> Option<i64> {
    used.sort_unstable();
    let (first, last) = match (used.first(), used.last()) {
        (Some(first), Some(last)) => (*first, *last),
        _ => return Some(-count),
    };
    if let Some(start) = first.checked_sub(count) {
        return Some(start);
    }
    used.windows(2)
        .find(|pair| i128::from(pair[1]) - i128::from(pair[0]) > i128::from(count))
        .map(|pair| pair[0] + 1)
        .or_else(|| last.checked_add(count).map(|_| last + 1))
}

/// Write new keys for members of `group`. `moving` is `(id, old parent)` of
/// a node entering the group as part of the same write.
///
/// Multi-row writes first park the rows on a run of keys that neither the
/// groups involved nor the new keys use, so intermediate states never trip
/// the unique index. Only the destination group and the mover's old group
/// are considered; keys elsewhere in the space cannot collide.
async fn write_keys(
    conn: &Connection,
    group: SiblingGroup,
    keys: &[SiblingKey],
    moving: Option<(Uuid, Option<Uuid>)>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let conflict = |e: libsql::Error, sort: i64| {
        if is_sort_conflict(&e) {
            StoreError::duplicate_sort(group, sort)
        } else {
            StoreError::sql_execution(format!("Failed to write sort key: {}", e))
        }
    };

    if keys.len() > 1 {
        let mut used: Vec<i64> = keys.iter().map(|k| k.sort).collect();
        used.extend(sibling_keys(conn, group).await?.iter().map(|k| k.sort));
        if let Some((_, from)) = moving {
            if from != group.parent_id {
                let old_group = SiblingGroup::new(group.space_id, from);
                used.extend(sibling_keys(conn, old_group).await?.iter().map(|k| k.sort));
            }
        }

        let count = i64::try_from(keys.len()).unwrap_or(i64::MAX);
        let start = free_run(&mut used, count).ok_or_else(|| {
            StoreError::keyspace_exhausted(
                group,
                KeyspaceExhausted {
                    members: keys.len(),
                    gap: 0,
                },
            )
        })?;
        let parked = (0..count).map(|offset| start + offset);

        for (key, parked) in keys.iter().zip(parked) {
            conn.execute(
                "UPDATE nodes SET sort = ? WHERE id = ?",
                vec![Value::Integer(parked), Value::Text(key.id.to_string())],
            )
            .await
            .map_err(|e| conflict(e, parked))?;
        }
    }

    for key in keys {
        match moving {
            Some((moving_id, _)) if moving_id == key.id => {
                conn.execute(
                    "UPDATE nodes SET parent_id = ?, sort = ?, updated_at = ? WHERE id = ?",
                    vec![
                        uuid_value(group.parent_id),
                        Value::Integer(key.sort),
                        Value::Text(now.to_rfc3339()),
                        Value::Text(key.id.to_string()),
                    ],
                )
                .await
                .map_err(|e| conflict(e, key.sort))?;
            }
            _ => {
                conn.execute(
                    "UPDATE nodes SET sort = ?, updated_at = ? WHERE id = ?",
                    vec![
                        Value::Integer(key.sort),
                        Value::Text(now.to_rfc3339()),
                        Value::Text(key.id.to_string()),
                    ],
                )
                .await
                .map_err(|e| conflict(e, key.sort))?;
            }
        }
    }
    Ok(())
}
