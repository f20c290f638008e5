//! Node Data Structures
//!
//! This module defines the `Node` record shared by pages and blocks, plus the
//! input and patch types the tree service accepts.
//!
//! # Architecture
//!
//! - **Closed type set**: every node is either a [`NodeType::Page`] or a
//!   [`NodeType::Block`]; behavior differences are matched explicitly
//! - **Sibling groups**: nodes sharing `(space_id, parent_id)` form a group
//!   totally ordered by `sort`
//! - **Opaque payload**: `title` and `properties` never influence ordering
//!
//! # Examples
//!
//! ```rust
//! use pagetree_core::models::{NewNode, NodeType};
//! use serde_json::json;
//! use uuid::Uuid;
//!
//! let space_id = Uuid::new_v4();
//!
//! // Root page
//! let page = NewNode::page(space_id).with_title("Roadmap");
//!
//! // Block nested under some page
//! let block = NewNode::block(space_id, Uuid::new_v4())
//!     .with_properties(json!({ "text": "first paragraph" }));
//! assert_eq!(block.node_type, Some(NodeType::Block));
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Validation errors for node records
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid node type: {0}")]
    InvalidNodeType(String),

    #[error("Invalid parent reference: {0}")]
    InvalidParent(String),

    #[error("Properties validation failed: {0}")]
    InvalidProperties(String),
}

/// The two kinds of node that participate in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Document-level node; may be a root or nest under another page.
    Page,
    /// Content node; always has a parent (page or block).
    Block,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Page => "page",
            NodeType::Block => "block",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "page" => Ok(NodeType::Page),
            "block" => Ok(NodeType::Block),
            other => Err(ValidationError::InvalidNodeType(other.to_string())),
        }
    }
}

/// Key of a sibling group: all nodes sharing a space and a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiblingGroup {
    pub space_id: Uuid,
    pub parent_id: Option<Uuid>,
}

impl SiblingGroup {
    pub fn new(space_id: Uuid, parent_id: Option<Uuid>) -> Self {
        Self {
            space_id,
            parent_id,
        }
    }
}

impl fmt::Display for SiblingGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.parent_id {
            Some(parent_id) => write!(f, "{}/{}", self.space_id, parent_id),
            None => write!(f, "{}/<root>", self.space_id),
        }
    }
}

/// A page or block record.
///
/// # Fields
///
/// - `id`: Unique identifier, immutable
/// - `space_id`: Owning space, immutable
/// - `node_type`: Page or block, immutable
/// - `parent_id`: Optional parent (required for blocks)
/// - `sort`: Position among siblings, unique within the sibling group
/// - `archived`: Hidden from default child listings, still addressable
/// - `title` / `properties`: Opaque payload
/// - `created_at` / `updated_at`: Maintained by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: Uuid,

    pub space_id: Uuid,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    /// Parent node ID (back-reference, not ownership)
    pub parent_id: Option<Uuid>,

    #[serde(default)]
    pub title: String,

    /// Free-form JSON object payload
    pub properties: serde_json::Value,

    pub sort: i64,

    #[serde(default)]
    pub archived: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

impl Node {
    /// Build a node from creation input. The sort key is left at zero; the
    /// service assigns it from the allocator before persisting.
    pub fn from_new(input: NewNode, node_type: NodeType) -> Self {
        let now = Utc::now();
        Self {
            id: input.id.unwrap_or_else(Uuid::new_v4),
            space_id: input.space_id,
            node_type,
            parent_id: input.parent_id,
            title: input.title,
            properties: input.properties,
            sort: 0,
            archived: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// The sibling group this node currently belongs to.
    pub fn group(&self) -> SiblingGroup {
        SiblingGroup::new(self.space_id, self.parent_id)
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    pub fn is_page(&self) -> bool {
        self.node_type == NodeType::Page
    }

    /// Validate record-level structure (not tree legality).
    ///
    /// # Errors
    ///
    /// - `id` or `space_id` is nil
    /// - `properties` is not a JSON object
    /// - the node names itself as parent
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_nil() {
            return Err(ValidationError::MissingField("id".to_string()));
        }

        if self.space_id.is_nil() {
            return Err(ValidationError::MissingField("space_id".to_string()));
        }

        if !self.properties.is_object() {
            return Err(ValidationError::InvalidProperties(
                "properties must be a JSON object".to_string(),
            ));
        }

        if self.parent_id == Some(self.id) {
            return Err(ValidationError::InvalidParent(
                "Node cannot be its own parent".to_string(),
            ));
        }

        Ok(())
    }

    /// Apply a payload patch. Ordering fields are never touched.
    pub fn apply_update(&mut self, update: &NodeUpdate) {
        if let Some(title) = &update.title {
            self.title = title.clone();
        }
        if let Some(properties) = &update.properties {
            self.properties = properties.clone();
        }
        if let Some(archived) = update.archived {
            self.archived = archived;
        }
        self.updated_at = Utc::now();
    }
}

/// Creation input for pages and blocks.
///
/// `node_type` may be left empty; the create operation fills in its own type
/// and rejects a mismatching one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewNode {
    /// Caller-supplied ID; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,

    pub space_id: Uuid,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<NodeType>,

    #[serde(default)]
    pub parent_id: Option<Uuid>,

    #[serde(default)]
    pub title: String,

    #[serde(default = "empty_object")]
    pub properties: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl NewNode {
    /// Untyped input in `space_id`; the create call decides the type.
    pub fn new(space_id: Uuid) -> Self {
        Self {
            id: None,
            space_id,
            node_type: None,
            parent_id: None,
            title: String::new(),
            properties: empty_object(),
        }
    }

    pub fn page(space_id: Uuid) -> Self {
        Self {
            node_type: Some(NodeType::Page),
            ..Self::new(space_id)
        }
    }

    pub fn block(space_id: Uuid, parent_id: Uuid) -> Self {
        Self {
            node_type: Some(NodeType::Block),
            parent_id: Some(parent_id),
            ..Self::new(space_id)
        }
    }

    pub fn with_id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_parent(mut self, parent_id: Uuid) -> Self {
        self.parent_id = Some(parent_id);
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = properties;
        self
    }
}

/// Partial payload update for PATCH-style property edits
///
/// Only provided fields change. Parent and sort are deliberately absent:
/// structural changes go through the move/reorder operations.
///
/// # Examples
///
/// ```rust
/// # use pagetree_core::models::NodeUpdate;
/// # use serde_json::json;
/// let update = NodeUpdate::new()
///     .with_title("Renamed")
///     .with_properties(json!({ "icon": "star" }));
/// assert!(!update.is_empty());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Replaces the whole properties object
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub archived: Option<bool>,
}

impl NodeUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = Some(properties);
        self
    }

    pub fn with_archived(mut self, archived: bool) -> Self {
        self.archived = Some(archived);
        self
    }

    /// Check if update contains any changes
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.properties.is_none() && self.archived.is_none()
    }
}

/// Where to place a node relative to an anchor sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelativePosition {
    Before,
    After,
}

/// A node with its (recursively fetched) children, ordered by sort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTree {
    pub node: Node,
    pub children: Vec<NodeTree>,
}

impl NodeTree {
    pub fn leaf(node: Node) -> Self {
        Self {
            node,
            children: Vec::new(),
        }
    }

    /// Total number of nodes in this tree, including the root.
    pub fn node_count(&self) -> usize {
        1 + self
            .children
            .iter()
            .map(NodeTree::node_count)
            .sum::<usize>()
    }
}
