//! The document tree.
//!
//! A [`Tree`] binds a schema document's node tree to database reflection.
//! Nodes live in an arena indexed by [`NodeId`]; parent links are plain
//! indices. Building the tree performs all structural validation, so that
//! anything that can fail from configuration fails here and never at query
//! time.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::SyncError;
use crate::reflect::{Reflection, TableRef};
use crate::schema::{
    ForeignKeyConfig, NodeConfig, RelationshipKind, RelationshipVariant, TransformConfig,
};

pub type NodeId = usize;

/// One step of a join plan: rows of `child` attach to rows of `parent` where
/// `parent.parent_columns = child.child_columns`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinStep {
    pub parent: TableRef,
    pub parent_columns: Vec<String>,
    pub child: TableRef,
    pub child_columns: Vec<String>,
}

/// Resolved relationship of a node to its parent.
#[derive(Debug, Clone)]
pub struct Relationship {
    pub kind: RelationshipKind,
    pub variant: RelationshipVariant,
    pub through: Option<TableRef>,
}

/// A projected column, possibly reaching into a JSON value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// The underlying table column.
    pub source: String,
    /// JSON accessor steps applied to the source column.
    pub path: Vec<PathStep>,
    /// Key this column appears under in the projected object.
    pub output: String,
}

impl ColumnSpec {
    fn plain(name: &str) -> Self {
        ColumnSpec {
            source: name.to_string(),
            path: Vec::new(),
            output: name.to_string(),
        }
    }
}

/// One JSON accessor: the operator and its operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathStep {
    /// `->key`
    Key(String),
    /// `->i`
    Index(i64),
    /// `->>key`
    KeyText(String),
    /// `->>i`
    IndexText(i64),
    /// `#>{a,b,c}`
    Slice(Vec<String>),
    /// `#>>{a,b,c}`
    SliceText(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub table: TableRef,
    pub label: String,
    pub columns: Vec<ColumnSpec>,
    /// Primary key columns, from reflection, in constraint order.
    pub primary_keys: Vec<String>,
    /// `None` only on the root.
    pub relationship: Option<Relationship>,
    pub transform: TransformConfig,
    pub children: Vec<NodeId>,
    /// Join steps linking this node to its parent: one step for a direct
    /// foreign key, two when a through table bridges them. Empty on the root.
    pub parent_steps: Vec<JoinStep>,
}

impl Node {
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Fully qualified node name for error messages.
    pub fn name(&self) -> String {
        self.table.to_string()
    }

    /// Projected columns that are not part of the primary key.
    pub fn non_key_columns(&self) -> Vec<&ColumnSpec> {
        self.columns
            .iter()
            .filter(|spec| !self.primary_keys.contains(&spec.output))
            .collect()
    }

    /// The single value column of a scalar node.
    pub fn scalar_column(&self) -> &ColumnSpec {
        self.non_key_columns()[0]
    }
}

#[derive(Debug, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    by_table: HashMap<TableRef, NodeId>,
    through_tables: HashMap<TableRef, NodeId>,
}

impl Tree {
    /// Build and validate the tree for one sync definition.
    pub fn build(config: &NodeConfig, reflection: &Reflection) -> Result<Tree, SyncError> {
        if config.relationship.is_some() {
            return Err(SyncError::InvalidSchema(format!(
                "root node {} must not declare a relationship",
                config.table
            )));
        }
        let mut tree = Tree {
            nodes: Vec::new(),
            by_table: HashMap::new(),
            through_tables: HashMap::new(),
        };
        tree.add_node(config, None, reflection)?;
        Ok(tree)
    }

    fn add_node(
        &mut self,
        config: &NodeConfig,
        parent: Option<NodeId>,
        reflection: &Reflection,
    ) -> Result<NodeId, SyncError> {
        let table = TableRef::new(config.schema.clone(), config.table.clone());

        if !reflection.has_schema(&table.schema) {
            return Err(SyncError::UnknownSchema(table.schema.clone()));
        }
        let meta = reflection
            .table(&table)
            .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;
        if meta.primary_keys.is_empty() {
            return Err(SyncError::InvalidSchema(format!(
                "no primary key found on table {table}"
            )));
        }

        let columns = if config.columns.is_empty() {
            meta.columns.iter().map(|c| ColumnSpec::plain(&c.name)).collect()
        } else {
            config
                .columns
                .iter()
                .map(|raw| {
                    let spec = parse_column(raw)?;
                    if !meta.has_column(&spec.source) {
                        return Err(SyncError::UnknownColumn {
                            table: table.to_string(),
                            column: spec.source.clone(),
                        });
                    }
                    Ok(spec)
                })
                .collect::<Result<Vec<_>, _>>()?
        };

        let (relationship, parent_steps) = match parent {
            None => (None, Vec::new()),
            Some(parent_id) => {
                let relationship_config = config.relationship.as_ref().ok_or_else(|| {
                    SyncError::MissingRelationship(table.to_string())
                })?;
                let (kind, variant) = match (relationship_config.kind, relationship_config.variant)
                {
                    (Some(kind), Some(variant)) => (kind, variant),
                    _ => return Err(SyncError::MissingRelationship(table.to_string())),
                };

                if relationship_config.through_tables.len() > 1 {
                    return Err(SyncError::InvalidSchema(format!(
                        "multiple through tables on {}: {:?}",
                        table, relationship_config.through_tables
                    )));
                }

                let parent_table = self.nodes[parent_id].table.clone();
                let through = relationship_config
                    .through_tables
                    .first()
                    .map(|name| TableRef::new(table.schema.clone(), name.clone()));

                let steps = match &through {
                    Some(through_table) => {
                        if relationship_config.foreign_key.is_some() {
                            return Err(SyncError::InvalidSchema(format!(
                                "foreign_key override cannot be combined with through_tables on {table}"
                            )));
                        }
                        if through_table == &parent_table || through_table == &table {
                            return Err(SyncError::CycleDetected(through_table.to_string()));
                        }
                        if reflection.table(through_table).is_none() {
                            return Err(SyncError::UnknownTable(through_table.to_string()));
                        }
                        vec![
                            resolve_step(&parent_table, through_table, None, reflection)?,
                            resolve_step(through_table, &table, None, reflection)?,
                        ]
                    }
                    None => vec![resolve_step(
                        &parent_table,
                        &table,
                        relationship_config.foreign_key.as_ref(),
                        reflection,
                    )?],
                };

                (
                    Some(Relationship {
                        kind,
                        variant,
                        through: through.clone(),
                    }),
                    steps,
                )
            }
        };

        if let Some(relationship) = &relationship {
            if relationship.variant == RelationshipVariant::Scalar {
                let non_key = columns
                    .iter()
                    .filter(|spec| !meta.primary_keys.contains(&spec.output))
                    .count();
                if non_key != 1 {
                    return Err(SyncError::InvalidSchema(format!(
                        "scalar node {table} must project exactly one non-key column"
                    )));
                }
            }
        }

        let label = config.label().to_string();
        if let Some(parent_id) = parent {
            let siblings = self.nodes[parent_id].children.clone();
            for sibling in siblings {
                if self.nodes[sibling].label == label {
                    return Err(SyncError::InvalidSchema(format!(
                        "duplicate label \"{label}\" under {}",
                        self.nodes[parent_id].table
                    )));
                }
            }
        }

        let id = self.nodes.len();
        let through = relationship.as_ref().and_then(|r| r.through.clone());
        self.nodes.push(Node {
            id,
            parent,
            table: table.clone(),
            label,
            columns,
            primary_keys: meta.primary_keys.clone(),
            relationship,
            transform: config.transform.clone().unwrap_or_default(),
            children: Vec::new(),
            parent_steps,
        });
        self.by_table.entry(table).or_insert(id);
        if let Some(through_table) = through {
            self.through_tables.insert(through_table, id);
        }
        if let Some(parent_id) = parent {
            self.nodes[parent_id].children.push(id);
        }

        for child in &config.children {
            self.add_node(child, Some(id), reflection)?;
        }
        Ok(id)
    }

    pub fn root(&self) -> &Node {
        &self.nodes[0]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    /// Nodes in depth-first (pre-order) order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    /// Look up the node placed at the given table, if any.
    pub fn lookup(&self, table: &TableRef) -> Option<NodeId> {
        self.by_table.get(table).copied()
    }

    /// Look up the child node bridged by the given through table, if any.
    pub fn lookup_through(&self, table: &TableRef) -> Option<NodeId> {
        self.through_tables.get(table).copied()
    }

    /// Every table the tree touches: node tables plus through tables.
    pub fn tables(&self) -> BTreeSet<TableRef> {
        let mut tables: BTreeSet<TableRef> =
            self.nodes.iter().map(|n| n.table.clone()).collect();
        tables.extend(self.through_tables.keys().cloned());
        tables
    }

    pub fn schemas(&self) -> BTreeSet<String> {
        self.tables().into_iter().map(|t| t.schema).collect()
    }

    /// The full join plan from the root down to the given node.
    pub fn join_plan(&self, id: NodeId) -> Vec<JoinStep> {
        let node = &self.nodes[id];
        match node.parent {
            None => Vec::new(),
            Some(parent) => {
                let mut plan = self.join_plan(parent);
                plan.extend(node.parent_steps.iter().cloned());
                plan
            }
        }
    }

    /// Output keys of a node's projected object, after column selection and
    /// transform rename.
    pub fn projection(&self, id: NodeId) -> Vec<String> {
        let node = &self.nodes[id];
        node.columns
            .iter()
            .map(|spec| {
                node.transform
                    .rename
                    .get(&spec.output)
                    .cloned()
                    .unwrap_or_else(|| spec.output.clone())
            })
            .collect()
    }

    /// Mapping type hints collected over the whole tree, keyed by label path
    /// from the root, for the index-mapping collaborator.
    pub fn mapping_hints(&self) -> BTreeMap<String, serde_json::Value> {
        let mut hints = BTreeMap::new();
        for node in &self.nodes {
            let mut path = Vec::new();
            let mut current = node;
            while let Some(parent) = current.parent {
                path.push(current.label.clone());
                current = &self.nodes[parent];
            }
            path.reverse();
            for (column, hint) in &node.transform.mapping {
                let mut key_path = path.clone();
                key_path.push(column.clone());
                hints.insert(key_path.join("."), hint.clone());
            }
        }
        hints
    }
}

/// Resolve the join step between two adjacent tables.
fn resolve_step(
    parent: &TableRef,
    child: &TableRef,
    fk_override: Option<&ForeignKeyConfig>,
    reflection: &Reflection,
) -> Result<JoinStep, SyncError> {
    if let Some(fk) = fk_override {
        for (table, columns) in [(parent, &fk.parent), (child, &fk.child)] {
            let meta = reflection
                .table(table)
                .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?;
            for column in columns {
                if !meta.has_column(column) {
                    return Err(SyncError::UnknownColumn {
                        table: table.to_string(),
                        column: column.clone(),
                    });
                }
            }
        }
        return Ok(JoinStep {
            parent: parent.clone(),
            parent_columns: fk.parent.clone(),
            child: child.clone(),
            child_columns: fk.child.clone(),
        });
    }

    let fks = reflection.foreign_keys_between(parent, child);
    match fks.len() {
        0 => Err(SyncError::UnreachableNode {
            parent: parent.to_string(),
            child: child.to_string(),
        }),
        1 => {
            let fk = fks[0];
            if &fk.referring == child {
                Ok(JoinStep {
                    parent: parent.clone(),
                    parent_columns: fk.referred_columns.clone(),
                    child: child.clone(),
                    child_columns: fk.referring_columns.clone(),
                })
            } else {
                Ok(JoinStep {
                    parent: parent.clone(),
                    parent_columns: fk.referring_columns.clone(),
                    child: child.clone(),
                    child_columns: fk.referred_columns.clone(),
                })
            }
        }
        _ => Err(SyncError::AmbiguousForeignKey {
            parent: parent.to_string(),
            child: child.to_string(),
        }),
    }
}

/// Parse a column expression, which may reach into a JSON value with the
/// native accessors `->`, `->>`, `#>` and `#>>`.
///
/// The projected output key is the path tokens joined with underscores,
/// braces stripped: `meta#>{a,b}->0` projects as `meta_a,b_0`.
pub fn parse_column(raw: &str) -> Result<ColumnSpec, SyncError> {
    if !raw.contains("->") && !raw.contains("#>") {
        if raw.is_empty() {
            return Err(SyncError::UnsupportedJsonPath(raw.to_string()));
        }
        return Ok(ColumnSpec::plain(raw));
    }

    let mut rest = raw;
    let mut source = None;
    let mut path = Vec::new();
    let mut tokens: Vec<String> = Vec::new();

    while !rest.is_empty() {
        let (op_index, op) = match (rest.find("->"), rest.find("#>")) {
            (Some(a), Some(h)) if h < a => (h, "#>"),
            (Some(a), _) => (a, "->"),
            (None, Some(h)) => (h, "#>"),
            (None, None) => {
                // trailing operand with no further operator
                let operand = rest;
                rest = "";
                push_operand(operand, &mut source, &mut path, &mut tokens, raw)?;
                continue;
            }
        };

        let operand = &rest[..op_index];
        if !operand.is_empty() {
            push_operand(operand, &mut source, &mut path, &mut tokens, raw)?;
        } else if source.is_none() {
            return Err(SyncError::UnsupportedJsonPath(raw.to_string()));
        }

        let after = &rest[op_index + 2..];
        let text_form = after.starts_with('>');
        let after = if text_form { &after[1..] } else { after };

        // find the end of this operand: the next operator or end of input
        let end = next_operator_index(after).unwrap_or(after.len());
        let operand = &after[..end];
        if operand.is_empty() {
            return Err(SyncError::UnsupportedJsonPath(raw.to_string()));
        }

        let step = if op == "#>" {
            let inner = operand
                .strip_prefix('{')
                .and_then(|s| s.strip_suffix('}'))
                .ok_or_else(|| SyncError::UnsupportedJsonPath(raw.to_string()))?;
            let keys: Vec<String> = inner.split(',').map(|s| s.trim().to_string()).collect();
            if keys.iter().any(|k| k.is_empty()) {
                return Err(SyncError::UnsupportedJsonPath(raw.to_string()));
            }
            if text_form {
                PathStep::SliceText(keys)
            } else {
                PathStep::Slice(keys)
            }
        } else if let Ok(index) = operand.parse::<i64>() {
            if text_form {
                PathStep::IndexText(index)
            } else {
                PathStep::Index(index)
            }
        } else if text_form {
            PathStep::KeyText(operand.to_string())
        } else {
            PathStep::Key(operand.to_string())
        };
        path.push(step);
        tokens.push(operand.replace(['{', '}'], ""));
        rest = &after[end..];
    }

    let source = source.ok_or_else(|| SyncError::UnsupportedJsonPath(raw.to_string()))?;
    let mut output_tokens = vec![source.clone()];
    output_tokens.extend(tokens);
    Ok(ColumnSpec {
        source,
        path,
        output: output_tokens.join("_"),
    })
}

fn push_operand(
    operand: &str,
    source: &mut Option<String>,
    path: &[PathStep],
    _tokens: &mut [String],
    raw: &str,
) -> Result<(), SyncError> {
    if source.is_none() && path.is_empty() {
        *source = Some(operand.to_string());
        Ok(())
    } else {
        Err(SyncError::UnsupportedJsonPath(raw.to_string()))
    }
}

fn next_operator_index(s: &str) -> Option<usize> {
    match (s.find("->"), s.find("#>")) {
        (Some(a), Some(h)) => Some(a.min(h)),
        (Some(a), None) => Some(a),
        (None, Some(h)) => Some(h),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::fixtures;
    use crate::schema::SyncConfig;

    fn book_config() -> NodeConfig {
        let configs = SyncConfig::from_str_all(
            r#"[{
              "database": "bookstore",
              "nodes": {
                "table": "book",
                "columns": ["isbn", "title", "description"],
                "children": [
                  {
                    "table": "author",
                    "columns": ["name"],
                    "label": "authors",
                    "relationship": {
                      "type": "one_to_many",
                      "variant": "scalar",
                      "through_tables": ["book_author"]
                    }
                  }
                ]
              }
            }]"#,
        )
        .unwrap();
        configs.into_iter().next().unwrap().nodes
    }

    #[test]
    fn test_build_book_tree() {
        let tree = Tree::build(&book_config(), &fixtures::bookstore()).unwrap();
        let root = tree.root();
        assert_eq!(root.table, TableRef::new("public", "book"));
        assert_eq!(root.primary_keys, vec!["isbn"]);
        assert_eq!(root.children.len(), 1);

        let author = tree.node(root.children[0]);
        assert_eq!(author.label, "authors");
        assert_eq!(author.parent_steps.len(), 2);
        assert_eq!(
            author.parent_steps[0],
            JoinStep {
                parent: TableRef::new("public", "book"),
                parent_columns: vec!["isbn".to_string()],
                child: TableRef::new("public", "book_author"),
                child_columns: vec!["book_isbn".to_string()],
            }
        );
        assert_eq!(author.parent_steps[1].child_columns, vec!["id"]);
        assert_eq!(author.scalar_column().output, "name");
    }

    #[test]
    fn test_lookup_and_tables() {
        let tree = Tree::build(&book_config(), &fixtures::bookstore()).unwrap();
        let book_author = TableRef::new("public", "book_author");
        assert!(tree.lookup(&TableRef::new("public", "author")).is_some());
        assert!(tree.lookup(&book_author).is_none());
        assert!(tree.lookup_through(&book_author).is_some());

        let tables = tree.tables();
        assert_eq!(tables.len(), 3);
        assert!(tables.contains(&book_author));
        assert_eq!(tree.schemas().into_iter().collect::<Vec<_>>(), vec!["public"]);
    }

    #[test]
    fn test_join_plan_reaches_root() {
        let tree = Tree::build(&book_config(), &fixtures::bookstore()).unwrap();
        let author_id = tree.lookup(&TableRef::new("public", "author")).unwrap();
        let plan = tree.join_plan(author_id);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].parent.table, "book");
        assert_eq!(plan[1].child.table, "author");
    }

    #[test]
    fn test_unknown_table() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"table": "missing"}"#).unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::UnknownTable(_)));
    }

    #[test]
    fn test_unknown_column() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"table": "book", "columns": ["isbn", "price"]}"#).unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::UnknownColumn { .. }));
    }

    #[test]
    fn test_unknown_schema() {
        let config: NodeConfig =
            serde_json::from_str(r#"{"table": "book", "schema": "audit"}"#).unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::UnknownSchema(_)));
    }

    #[test]
    fn test_missing_relationship() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"table": "book", "children": [{"table": "publisher"}]}"#,
        )
        .unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::MissingRelationship(_)));
    }

    #[test]
    fn test_unreachable_node() {
        // author has no direct foreign key to book
        let config: NodeConfig = serde_json::from_str(
            r#"{"table": "book", "children": [
                {"table": "author",
                 "relationship": {"type": "one_to_many", "variant": "object"}}
            ]}"#,
        )
        .unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::UnreachableNode { .. }));
    }

    #[test]
    fn test_cycle_detected_for_self_through() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"table": "book", "children": [
                {"table": "author",
                 "relationship": {"type": "one_to_many", "variant": "scalar",
                                  "through_tables": ["book"]}}
            ]}"#,
        )
        .unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::CycleDetected(_)));
    }

    #[test]
    fn test_duplicate_sibling_labels() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"table": "book", "children": [
                {"table": "publisher", "label": "extra",
                 "relationship": {"type": "one_to_one", "variant": "object"}},
                {"table": "author", "label": "extra",
                 "relationship": {"type": "one_to_many", "variant": "scalar",
                                  "through_tables": ["book_author"]}}
            ]}"#,
        )
        .unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidSchema(_)));
    }

    #[test]
    fn test_root_relationship_rejected() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"table": "book",
                "relationship": {"type": "one_to_one", "variant": "object"}}"#,
        )
        .unwrap();
        let err = Tree::build(&config, &fixtures::bookstore()).unwrap_err();
        assert!(matches!(err, SyncError::InvalidSchema(_)));
    }

    #[test]
    fn test_projection_applies_rename() {
        let config: NodeConfig = serde_json::from_str(
            r#"{"table": "book", "columns": ["isbn", "title"],
                "transform": {"rename": {"isbn": "book_isbn"}}}"#,
        )
        .unwrap();
        let tree = Tree::build(&config, &fixtures::bookstore()).unwrap();
        assert_eq!(tree.projection(0), vec!["book_isbn", "title"]);
    }

    #[test]
    fn test_parse_plain_column() {
        let spec = parse_column("title").unwrap();
        assert_eq!(spec.source, "title");
        assert!(spec.path.is_empty());
        assert_eq!(spec.output, "title");
    }

    #[test]
    fn test_parse_json_path_columns() {
        let spec = parse_column("meta->keywords").unwrap();
        assert_eq!(spec.source, "meta");
        assert_eq!(spec.path, vec![PathStep::Key("keywords".to_string())]);
        assert_eq!(spec.output, "meta_keywords");

        let spec = parse_column("meta->tags->0").unwrap();
        assert_eq!(
            spec.path,
            vec![PathStep::Key("tags".to_string()), PathStep::Index(0)]
        );
        assert_eq!(spec.output, "meta_tags_0");

        let spec = parse_column("meta#>{a,b}->1").unwrap();
        assert_eq!(
            spec.path,
            vec![
                PathStep::Slice(vec!["a".to_string(), "b".to_string()]),
                PathStep::Index(1)
            ]
        );
        assert_eq!(spec.output, "meta_a,b_1");

        let spec = parse_column("meta->>title").unwrap();
        assert_eq!(spec.path, vec![PathStep::KeyText("title".to_string())]);
    }

    #[test]
    fn test_parse_malformed_json_path() {
        assert!(matches!(
            parse_column("meta->"),
            Err(SyncError::UnsupportedJsonPath(_))
        ));
        assert!(matches!(
            parse_column("->key"),
            Err(SyncError::UnsupportedJsonPath(_))
        ));
        assert!(matches!(
            parse_column("meta#>a,b"),
            Err(SyncError::UnsupportedJsonPath(_))
        ));
    }
}
