//! Schema document model.
//!
//! The schema file is a UTF-8 JSON array of sync definitions. Each definition
//! binds one source database to one target index and declares the document
//! tree rooted at a pivot table. Parsing is strict: unknown keys anywhere in
//! the document are rejected.
//!
//! Structural validation (tables, columns, foreign keys) happens later, when
//! the tree is built against database reflection; this module only guarantees
//! the document is well-formed.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::SyncError;

/// Default Postgres schema for nodes that do not specify one.
pub const DEFAULT_SCHEMA: &str = "public";

/// One sync definition: a source database, a target index, and a node tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Source database name.
    pub database: String,
    /// Target index name; defaults to the database name.
    #[serde(default)]
    pub index: Option<String>,
    /// Index mappings, passed through to the index as-is.
    #[serde(default)]
    pub mappings: Option<Value>,
    /// Index settings, passed through to the index as-is.
    #[serde(default)]
    pub settings: Option<Value>,
    /// Plugin names applied in order by the post-processing hook.
    #[serde(default)]
    pub plugins: Vec<String>,
    /// The root node of the document tree.
    pub nodes: NodeConfig,
}

impl SyncConfig {
    /// The target index name.
    pub fn index(&self) -> &str {
        self.index.as_deref().unwrap_or(&self.database)
    }

    /// Load every sync definition from a schema file.
    pub fn load_all(path: impl AsRef<Path>) -> Result<Vec<SyncConfig>, SyncError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_str_all(&content)
    }

    /// Parse sync definitions from a JSON string.
    pub fn from_str_all(content: &str) -> Result<Vec<SyncConfig>, SyncError> {
        serde_json::from_str(content).map_err(|e| SyncError::InvalidSchema(e.to_string()))
    }
}

/// One table placement in the document tree.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub table: String,
    #[serde(default = "default_schema")]
    pub schema: String,
    /// Columns to project; empty means every reflected column.
    /// Entries may be JSON-path expressions such as `meta->tags->0`.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Key this node appears under in the parent document; defaults to the
    /// table name.
    #[serde(default)]
    pub label: Option<String>,
    /// Required on every non-root node.
    #[serde(default)]
    pub relationship: Option<RelationshipConfig>,
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    #[serde(default)]
    pub children: Vec<NodeConfig>,
}

impl NodeConfig {
    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.table)
    }
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

/// How a child folds into its parent document.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelationshipConfig {
    /// `one_to_one` or `one_to_many`. Optional here so a missing value can be
    /// reported as a distinct error at tree build time.
    #[serde(rename = "type")]
    pub kind: Option<RelationshipKind>,
    /// `object` or `scalar`.
    pub variant: Option<RelationshipVariant>,
    /// Intermediate tables bridging parent and child.
    #[serde(default)]
    pub through_tables: Vec<String>,
    /// Explicit column override when more than one foreign key exists.
    #[serde(default)]
    pub foreign_key: Option<ForeignKeyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipKind {
    OneToOne,
    OneToMany,
}

impl fmt::Display for RelationshipKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationshipKind::OneToOne => write!(f, "one_to_one"),
            RelationshipKind::OneToMany => write!(f, "one_to_many"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipVariant {
    /// Child rows render as JSON objects.
    Object,
    /// Child rows render as their sole non-key column value.
    Scalar,
}

/// `{parent: [...], child: [...]}` column override.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForeignKeyConfig {
    pub parent: Vec<String>,
    pub child: Vec<String>,
}

/// Transform rules for one node, applied rename → replace → concat → move →
/// mapping.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TransformConfig {
    /// Key renames: `{"id": "publisher_id"}`.
    pub rename: BTreeMap<String, String>,
    /// Per-column substring substitutions: `{"code": {"-": "="}}`.
    pub replace: BTreeMap<String, BTreeMap<String, String>>,
    /// Column concatenations into a new destination key.
    pub concat: ConcatRules,
    /// Key relocations: `{"name": "$root.publisher.name"}`.
    #[serde(rename = "move")]
    pub move_: BTreeMap<String, String>,
    /// Index type hints, passed through to the mapping collaborator.
    pub mapping: BTreeMap<String, Value>,
}

impl TransformConfig {
    pub fn is_empty(&self) -> bool {
        self.rename.is_empty()
            && self.replace.is_empty()
            && self.concat.as_slice().is_empty()
            && self.move_.is_empty()
            && self.mapping.is_empty()
    }
}

/// A single concat rule or a list of them.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ConcatRules {
    One(ConcatConfig),
    Many(Vec<ConcatConfig>),
}

impl ConcatRules {
    pub fn as_slice(&self) -> &[ConcatConfig] {
        match self {
            ConcatRules::One(rule) => std::slice::from_ref(rule),
            ConcatRules::Many(rules) => rules,
        }
    }
}

impl Default for ConcatRules {
    fn default() -> Self {
        ConcatRules::Many(Vec::new())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConcatConfig {
    pub columns: Vec<String>,
    pub destination: String,
    #[serde(default)]
    pub delimiter: String,
}
