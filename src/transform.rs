//! Document transforms.
//!
//! `transform` is a pure function over the denormalized document, applied per
//! node in a fixed order: rename → replace → concat → move → mapping. Rules
//! after `rename` see the renamed keys. `mapping` never mutates the document;
//! it is a type hint surfaced through [`crate::tree::Tree::mapping_hints`].

use serde_json::{Map, Value};

use crate::error::SyncError;
use crate::schema::TransformConfig;
use crate::tree::{NodeId, Tree};

/// Apply every node's transform rules to a document produced for the tree's
/// pivot. Fails with a per-document data error when a `move` rule references
/// a key or target path the document does not carry.
pub fn apply(tree: &Tree, doc: &mut Value) -> Result<(), SyncError> {
    let mut moves = Vec::new();
    walk(tree, tree.root().id, doc, &mut moves)?;

    for pending in moves {
        apply_move(doc, &pending)?;
    }
    Ok(())
}

struct PendingMove {
    /// Label path under the root, from a `$root.a.b` target.
    target: Vec<String>,
    key: String,
    value: Value,
}

fn walk(
    tree: &Tree,
    node_id: NodeId,
    value: &mut Value,
    moves: &mut Vec<PendingMove>,
) -> Result<(), SyncError> {
    match value {
        Value::Array(items) => {
            for item in items {
                walk(tree, node_id, item, moves)?;
            }
            Ok(())
        }
        Value::Object(object) => {
            let node = tree.node(node_id);
            // descend before renaming so child labels still resolve
            for &child_id in &node.children {
                let label = &tree.node(child_id).label;
                if let Some(child_value) = object.get_mut(label) {
                    walk(tree, child_id, child_value, moves)?;
                }
            }
            apply_rules(&node.transform, &node.table.to_string(), object, moves)
        }
        // scalar children carry no keys to transform
        _ => Ok(()),
    }
}

fn apply_rules(
    rules: &TransformConfig,
    table: &str,
    object: &mut Map<String, Value>,
    moves: &mut Vec<PendingMove>,
) -> Result<(), SyncError> {
    for (from, to) in &rules.rename {
        if let Some(value) = object.remove(from) {
            object.insert(to.clone(), value);
        }
    }

    for (column, substitutions) in &rules.replace {
        if let Some(value) = object.get_mut(column) {
            for (search, replacement) in substitutions {
                replace_in(value, search, replacement);
            }
        }
    }

    for concat in rules.concat.as_slice() {
        let parts: Vec<String> = concat
            .columns
            .iter()
            .map(|column| object.get(column).map(concat_string).unwrap_or_default())
            .collect();
        object.insert(
            concat.destination.clone(),
            Value::String(parts.join(&concat.delimiter)),
        );
    }

    for (key, target) in &rules.move_ {
        let path = target.strip_prefix("$root").ok_or_else(|| {
            SyncError::InvalidSchema(format!("move target must start with $root: {target}"))
        })?;
        let value = object
            .remove(key)
            .ok_or_else(|| SyncError::TransformRuleMissingColumn {
                table: table.to_string(),
                column: key.clone(),
            })?;
        moves.push(PendingMove {
            target: path
                .split('.')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
            key: key.clone(),
            value,
        });
    }

    Ok(())
}

/// Substring substitution; only string values (and strings inside arrays)
/// change, anything else passes through.
fn replace_in(value: &mut Value, search: &str, replacement: &str) {
    match value {
        Value::String(s) => *s = s.replace(search, replacement),
        Value::Array(items) => {
            for item in items {
                replace_in(item, search, replacement);
            }
        }
        _ => {}
    }
}

/// String form of a concat input; absent and null inputs render empty.
fn concat_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn apply_move(doc: &mut Value, pending: &PendingMove) -> Result<(), SyncError> {
    let mut target = &mut *doc;
    for segment in &pending.target {
        target = match target {
            Value::Object(object) => object.get_mut(segment).ok_or_else(|| {
                SyncError::TransformRuleMissingColumn {
                    table: format!("$root.{}", pending.target.join(".")),
                    column: pending.key.clone(),
                }
            })?,
            _ => {
                return Err(SyncError::TransformRuleMissingColumn {
                    table: format!("$root.{}", pending.target.join(".")),
                    column: pending.key.clone(),
                })
            }
        };
    }

    match target {
        Value::Object(object) => {
            object.insert(pending.key.clone(), pending.value.clone());
            Ok(())
        }
        Value::Array(items) => {
            for item in items {
                if let Value::Object(object) = item {
                    object.insert(pending.key.clone(), pending.value.clone());
                }
            }
            Ok(())
        }
        _ => Err(SyncError::TransformRuleMissingColumn {
            table: format!("$root.{}", pending.target.join(".")),
            column: pending.key.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::fixtures;
    use crate::schema::{NodeConfig, SyncConfig};
    use serde_json::json;

    fn tree_for(schema: &str) -> Tree {
        let configs = SyncConfig::from_str_all(schema).unwrap();
        let nodes: NodeConfig = configs.into_iter().next().unwrap().nodes;
        Tree::build(&nodes, &fixtures::bookstore()).unwrap()
    }

    #[test]
    fn test_rename() {
        let tree = tree_for(
            r#"[{"database": "bookstore", "nodes": {
                "table": "book", "columns": ["isbn", "title", "description"],
                "transform": {"rename": {"isbn": "book_isbn", "title": "book_title"}},
                "children": [{
                    "table": "author", "columns": ["name"], "label": "authors",
                    "relationship": {"type": "one_to_many", "variant": "scalar",
                                     "through_tables": ["book_author"]}
                }]
            }}]"#,
        );
        let mut doc = json!({
            "isbn": "9785811243570",
            "title": "Charlie and the chocolate factory",
            "description": "Willy Wonka's famous factory",
            "authors": ["Roald Dahl"]
        });
        apply(&tree, &mut doc).unwrap();
        assert_eq!(
            doc,
            json!({
                "book_isbn": "9785811243570",
                "book_title": "Charlie and the chocolate factory",
                "description": "Willy Wonka's famous factory",
                "authors": ["Roald Dahl"]
            })
        );
    }

    #[test]
    fn test_replace_only_touches_strings() {
        let tree = tree_for(
            r#"[{"database": "bookstore", "nodes": {
                "table": "book", "columns": ["isbn", "publisher_id"],
                "transform": {"replace": {"isbn": {"-": "="}}, "rename": {}}
            }}]"#,
        );
        let mut doc = json!({"isbn": "978-83-74", "publisher_id": 42});
        apply(&tree, &mut doc).unwrap();
        assert_eq!(doc, json!({"isbn": "978=83=74", "publisher_id": 42}));
    }

    #[test]
    fn test_concat_with_missing_inputs() {
        let tree = tree_for(
            r#"[{"database": "bookstore", "nodes": {
                "table": "book", "columns": ["isbn", "title"],
                "transform": {"concat": {
                    "columns": ["isbn", "missing", "title"],
                    "destination": "summary", "delimiter": "-"
                }}
            }}]"#,
        );
        let mut doc = json!({"isbn": "123", "title": "T"});
        apply(&tree, &mut doc).unwrap();
        assert_eq!(doc["summary"], json!("123--T"));
    }

    #[test]
    fn test_fixed_rule_order() {
        // rename runs before replace and concat, so both see the new key
        let tree = tree_for(
            r#"[{"database": "bookstore", "nodes": {
                "table": "book", "columns": ["isbn", "title"],
                "transform": {
                    "rename": {"isbn": "code"},
                    "replace": {"code": {"-": ""}},
                    "concat": {"columns": ["code", "title"], "destination": "slug", "delimiter": "/"}
                }
            }}]"#,
        );
        let mut doc = json!({"isbn": "12-3", "title": "T"});
        apply(&tree, &mut doc).unwrap();
        assert_eq!(doc, json!({"code": "123", "title": "T", "slug": "123/T"}));
    }

    #[test]
    fn test_move_into_child_namespace() {
        let tree = tree_for(
            r#"[{"database": "bookstore", "nodes": {
                "table": "book", "columns": ["isbn", "title"],
                "transform": {"move": {"title": "$root.publisher"}},
                "children": [{
                    "table": "publisher", "label": "publisher",
                    "relationship": {"type": "one_to_one", "variant": "object"}
                }]
            }}]"#,
        );
        let mut doc = json!({
            "isbn": "123",
            "title": "T",
            "publisher": {"id": 1, "name": "P"}
        });
        apply(&tree, &mut doc).unwrap();
        assert_eq!(
            doc,
            json!({"isbn": "123", "publisher": {"id": 1, "name": "P", "title": "T"}})
        );
    }

    #[test]
    fn test_move_missing_key_is_data_error() {
        let tree = tree_for(
            r#"[{"database": "bookstore", "nodes": {
                "table": "book", "columns": ["isbn"],
                "transform": {"move": {"absent": "$root"}}
            }}]"#,
        );
        let mut doc = json!({"isbn": "123"});
        let err = apply(&tree, &mut doc).unwrap_err();
        assert!(matches!(err, SyncError::TransformRuleMissingColumn { .. }));
    }

    #[test]
    fn test_child_array_objects_transformed() {
        let tree = tree_for(
            r#"[{"database": "bookstore", "nodes": {
                "table": "book", "columns": ["isbn"],
                "children": [{
                    "table": "author", "label": "authors",
                    "columns": ["name"],
                    "transform": {"rename": {"name": "full_name"}},
                    "relationship": {"type": "one_to_many", "variant": "object",
                                     "through_tables": ["book_author"]}
                }]
            }}]"#,
        );
        let mut doc = json!({
            "isbn": "123",
            "authors": [{"name": "A"}, {"name": "B"}]
        });
        apply(&tree, &mut doc).unwrap();
        assert_eq!(
            doc["authors"],
            json!([{"full_name": "A"}, {"full_name": "B"}])
        );
    }
}
