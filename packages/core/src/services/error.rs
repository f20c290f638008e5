//! Service Layer Error Types
//!
//! Public error taxonomy of [`TreeService`](crate::services::TreeService).
//! Store errors are folded into it with the failing operation attached.

use crate::behaviors::ConstraintError;
use crate::db::StoreError;
use thiserror::Error;
use uuid::Uuid;

pub type ServiceResult<T> = Result<T, TreeServiceError>;

/// Tree service operation errors
#[derive(Error, Debug)]
pub enum TreeServiceError {
    /// Caller supplied an unusable argument (empty id, wrong type, missing parent)
    #[error("{operation}: {reason}")]
    InvalidArgument { operation: String, reason: String },

    /// The tree's structural rules reject the request
    #[error("{operation}: {reason}")]
    ConstraintViolation { operation: String, reason: String },

    /// Node (or referenced parent/anchor) does not exist
    #[error("Node not found: {id}")]
    NotFound { id: Uuid },

    /// Reparent would make a node its own ancestor
    #[error("Cycle detected: node {node_id} cannot move under {parent_id}")]
    Cycle { node_id: Uuid, parent_id: Uuid },

    /// A concurrent writer claimed the same sort key
    #[error("Sort {sort} already taken in space {space_id} under parent {parent_id:?}")]
    IntegrityConflict {
        space_id: Uuid,
        parent_id: Option<Uuid>,
        sort: i64,
    },

    /// The operation was abandoned before it committed
    #[error("{operation}: cancelled before completion")]
    Cancelled { operation: String },

    /// Backend failure
    #[error("Storage operation failed: {0}")]
    Storage(#[source] StoreError),

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl TreeServiceError {
    pub fn invalid_argument(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn constraint_violation(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    pub fn not_found(id: Uuid) -> Self {
        Self::NotFound { id }
    }

    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Classify a constraint failure raised while serving `operation`.
    pub fn constraint(operation: impl Into<String>, err: ConstraintError) -> Self {
        match err {
            ConstraintError::Cycle { node_id, parent_id } => Self::Cycle { node_id, parent_id },
            ConstraintError::MissingParent { .. } => Self::invalid_argument(operation, err.to_string()),
            ConstraintError::ParentTypeMismatch { .. }
            | ConstraintError::CrossSpaceParent { .. }
            | ConstraintError::KindMismatch { .. } => {
                Self::constraint_violation(operation, err.to_string())
            }
        }
    }

    /// Classify a store failure raised while serving `operation`.
    pub fn store(operation: impl Into<String>, err: StoreError) -> Self {
        match err {
            StoreError::NotFound { id } => Self::NotFound { id },
            StoreError::DuplicateSort { group, sort } => Self::IntegrityConflict {
                space_id: group.space_id,
                parent_id: group.parent_id,
                sort,
            },
            StoreError::Constraint(e) => Self::constraint(operation, e),
            StoreError::InvalidNode(reason) => Self::invalid_argument(operation, reason),
            other => Self::Storage(other),
        }
    }

    pub fn is_integrity_conflict(&self) -> bool {
        matches!(self, Self::IntegrityConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<StoreError> for TreeServiceError {
    fn from(err: StoreError) -> Self {
        Self::store("store", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeType, SiblingGroup};

    #[test]
    fn test_store_errors_keep_their_identity() {
        let id = Uuid::new_v4();
        assert!(TreeServiceError::from(StoreError::not_found(id)).is_not_found());

        let group = SiblingGroup::new(Uuid::new_v4(), Some(id));
        let err = TreeServiceError::from(StoreError::duplicate_sort(group, 2000));
        assert!(matches!(
            err,
            TreeServiceError::IntegrityConflict { parent_id: Some(p), sort: 2000, .. } if p == id
        ));
    }

    #[test]
    fn test_constraint_classification() {
        let missing = TreeServiceError::constraint(
            "create_block",
            ConstraintError::MissingParent {
                node_type: NodeType::Block,
            },
        );
        assert!(matches!(missing, TreeServiceError::InvalidArgument { .. }));
        assert_eq!(missing.to_string(), "create_block: parent id is required for block");

        let (node_id, parent_id) = (Uuid::new_v4(), Uuid::new_v4());
        let cycle = TreeServiceError::from(StoreError::Constraint(ConstraintError::Cycle {
            node_id,
            parent_id,
        }));
        assert!(matches!(cycle, TreeServiceError::Cycle { .. }));
    }
}
