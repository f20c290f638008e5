//! Store Error Types
//!
//! Errors raised by [`NodeStore`](crate::db::NodeStore) implementations:
//! missing records, sort-key integrity conflicts, structural rule violations
//! detected inside a write transaction, and backend failures.

use crate::behaviors::ConstraintError;
use crate::db::sort_allocator::KeyspaceExhausted;
use crate::models::SiblingGroup;
#[cfg(feature = "libsql")]
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store operation errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Node (or referenced parent/anchor) does not exist
    #[error("Node not found: {id}")]
    NotFound { id: Uuid },

    /// A write would have produced a duplicate sort key within a group
    #[error("Duplicate sort {sort} in sibling group {group}")]
    DuplicateSort { group: SiblingGroup, sort: i64 },

    /// Structural rule violated inside the transaction
    #[error(transparent)]
    Constraint(#[from] ConstraintError),

    /// The group cannot hold any more keys at the configured gap
    #[error("Sibling group {group}: {source}")]
    KeyspaceExhausted {
        group: SiblingGroup,
        source: KeyspaceExhausted,
    },

    /// Record failed structural validation or could not be decoded
    #[error("Invalid node record: {0}")]
    InvalidNode(String),

    /// Failed to establish database connection
    #[cfg(feature = "libsql")]
    #[error("Failed to connect to database at {path}: {source}")]
    ConnectionFailed {
        path: PathBuf,
        source: libsql::Error,
    },

    /// Failed to initialize database schema
    #[error("Failed to initialize database schema: {0}")]
    InitializationFailed(String),

    /// Failed to create parent directory
    #[error("Failed to create parent directory for database: {0}")]
    DirectoryCreationFailed(#[from] std::io::Error),

    /// SQL execution error with context
    #[error("SQL execution failed: {context}")]
    SqlExecution { context: String },
}

impl StoreError {
    pub fn not_found(id: Uuid) -> Self {
        Self::NotFound { id }
    }

    pub fn duplicate_sort(group: SiblingGroup, sort: i64) -> Self {
        Self::DuplicateSort { group, sort }
    }

    pub fn keyspace_exhausted(group: SiblingGroup, source: KeyspaceExhausted) -> Self {
        Self::KeyspaceExhausted { group, source }
    }

    pub fn invalid_node(msg: impl Into<String>) -> Self {
        Self::InvalidNode(msg.into())
    }

    pub fn initialization_failed(msg: impl Into<String>) -> Self {
        Self::InitializationFailed(msg.into())
    }

    pub fn sql_execution(context: impl Into<String>) -> Self {
        Self::SqlExecution {
            context: context.into(),
        }
    }

    #[cfg(feature = "libsql")]
    pub fn connection_failed(path: PathBuf, source: libsql::Error) -> Self {
        Self::ConnectionFailed { path, source }
    }
}
