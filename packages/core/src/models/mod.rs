//! Data Models
//!
//! This module contains the data structures shared by every layer:
//!
//! - `Node` - Page or block record with its sibling sort key
//! - `NewNode` / `NodeUpdate` - Creation input and payload patches
//! - `SiblingGroup` - Key of an ordered sibling group
//! - `NodeTree` - Nested read model for subtree fetches

mod node;

pub use node::{
    NewNode, Node, NodeTree, NodeType, NodeUpdate, RelativePosition, SiblingGroup,
    ValidationError,
};
