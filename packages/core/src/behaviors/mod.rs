//! Node Type Constraints
//!
//! This module decides which node types may nest under which parents and
//! which operations apply to which type:
//!
//! - [`validate_parent`] - parent legality for create and reparent
//! - [`ensure_kind`] - page operations only touch pages, block operations only blocks
//! - [`ensure_acyclic`] - reject a reparent that would make a node its own ancestor
//!
//! Everything here is pure. Callers fetch the nodes (and surface lookup
//! failures themselves); these functions only inspect what they are given.

use crate::models::{Node, NodeType};
use thiserror::Error;
use uuid::Uuid;

/// Structural rule violations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConstraintError {
    /// A block was given no parent
    #[error("parent id is required for {node_type}")]
    MissingParent { node_type: NodeType },

    /// Parent type does not accept this child type
    #[error("parent must be page: {parent_id} is a {parent_type}")]
    ParentTypeMismatch {
        node_type: NodeType,
        parent_id: Uuid,
        parent_type: NodeType,
    },

    /// Parent lives in another space
    #[error("parent {parent_id} belongs to space {parent_space_id}, not {space_id}")]
    CrossSpaceParent {
        parent_id: Uuid,
        parent_space_id: Uuid,
        space_id: Uuid,
    },

    /// Operation addressed at the wrong kind of node
    #[error("node {node_id} is a {actual}, not a {expected}")]
    KindMismatch {
        node_id: Uuid,
        expected: NodeType,
        actual: NodeType,
    },

    /// Reparent would create an ancestor cycle
    #[error("cannot move node {node_id} under {parent_id}: it would become its own ancestor")]
    Cycle { node_id: Uuid, parent_id: Uuid },
}

/// Whether a `child` type may sit directly under a `parent` type.
pub fn can_nest(child: NodeType, parent: NodeType) -> bool {
    match (child, parent) {
        (NodeType::Page, NodeType::Page) => true,
        (NodeType::Page, NodeType::Block) => false,
        (NodeType::Block, NodeType::Page) => true,
        (NodeType::Block, NodeType::Block) => true,
    }
}

/// Whether a node type may exist without a parent.
pub fn can_be_root(node_type: NodeType) -> bool {
    match node_type {
        NodeType::Page => true,
        NodeType::Block => false,
    }
}

/// Check a `(type, parent)` pair for a node living in `space_id`.
///
/// | type  | parent        | result                |
/// |-------|---------------|-----------------------|
/// | page  | none          | ok (root page)        |
/// | page  | page          | ok                    |
/// | page  | block         | `ParentTypeMismatch`  |
/// | block | none          | `MissingParent`       |
/// | block | page or block | ok                    |
pub fn validate_parent(
    node_type: NodeType,
    space_id: Uuid,
    parent: Option<&Node>,
) -> Result<(), ConstraintError> {
    let Some(parent) = parent else {
        if can_be_root(node_type) {
            return Ok(());
        }
        return Err(ConstraintError::MissingParent { node_type });
    };

    if parent.space_id != space_id {
        return Err(ConstraintError::CrossSpaceParent {
            parent_id: parent.id,
            parent_space_id: parent.space_id,
            space_id,
        });
    }

    if !can_nest(node_type, parent.node_type) {
        return Err(ConstraintError::ParentTypeMismatch {
            node_type,
            parent_id: parent.id,
            parent_type: parent.node_type,
        });
    }

    Ok(())
}

/// Reject operations addressed at the wrong kind of node.
pub fn ensure_kind(node: &Node, expected: NodeType) -> Result<(), ConstraintError> {
    if node.node_type != expected {
        return Err(ConstraintError::KindMismatch {
            node_id: node.id,
            expected,
            actual: node.node_type,
        });
    }
    Ok(())
}

/// Walk the destination parent's ancestor chain and reject the move if
/// `node_id` appears in it.
///
/// `parent_of` resolves a node to its parent (`None` at a root or when the
/// node is unknown). The walk stops after `max_steps` hops; running out of
/// steps means the existing chain is already cyclic, which is reported the
/// same way.
pub fn ensure_acyclic<F>(
    node_id: Uuid,
    new_parent_id: Uuid,
    max_steps: usize,
    mut parent_of: F,
) -> Result<(), ConstraintError>
where
    F: FnMut(Uuid) -> Option<Uuid>,
{
    let cycle = || ConstraintError::Cycle {
        node_id,
        parent_id: new_parent_id,
    };

    let mut current = Some(new_parent_id);
    let mut steps = 0usize;
    while let Some(id) = current {
        if id == node_id {
            return Err(cycle());
        }
        if steps >= max_steps {
            return Err(cycle());
        }
        steps += 1;
        current = parent_of(id);
    }
    Ok(())
}
