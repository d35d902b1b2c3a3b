//! Query synthesizer.
//!
//! Turns a document tree into one SQL statement that yields, per pivot row,
//! a complete denormalized `jsonb` document plus the pivot primary key. Each
//! child node folds into its parent as a correlated subquery aggregating over
//! the parent-side foreign key columns:
//!
//! - `object` × `one_to_one`  → a `JSONB_BUILD_OBJECT` singleton (SQL NULL
//!   when no child row exists),
//! - `object` × `one_to_many` → `COALESCE(JSONB_AGG(...), '[]')`,
//! - `scalar` × `one_to_one`  → the sole non-key projected value,
//! - `scalar` × `one_to_many` → `COALESCE(JSONB_AGG(value), '[]')`.
//!
//! Through tables join parent → through → child inside the subquery. The
//! same module renders the reverse query the engine uses to map a changed
//! row back to the set of affected pivot primary keys.

use std::pin::Pin;

use futures_util::TryStreamExt;
use serde_json::Value;
use tokio_postgres::types::ToSql;
use tokio_postgres::{Client, RowStream};

use crate::error::SyncError;
use crate::schema::{RelationshipKind, RelationshipVariant};
use crate::tree::{ColumnSpec, Node, NodeId, PathStep, Tree};

/// Composite primary-key values join with this delimiter to form the
/// document id, preserving reflection column order.
pub const PRIMARY_KEY_DELIMITER: &str = "|";

/// Canonical string values of a pivot row's primary key columns.
pub type DocumentKey = Vec<String>;

/// The document id a key maps to.
pub fn doc_id(key: &DocumentKey) -> String {
    key.join(PRIMARY_KEY_DELIMITER)
}

/// JSON_BUILD_OBJECT takes at most 100 arguments, so objects chunk at 50
/// key/value pairs and concatenate.
const BUILD_OBJECT_PAIR_LIMIT: usize = 50;

/// Pivot row selection for a synthesized query.
#[derive(Debug, Clone)]
pub enum Filter {
    /// Every pivot row, optionally restricted to the `(txmin, txmax]`
    /// transaction window.
    Full {
        txmin: Option<u64>,
        txmax: Option<u64>,
    },
    /// A set of pivot primary keys, canonical string form.
    Keys(Vec<DocumentKey>),
    /// A physical page range `[start_page, end_page)` over the pivot's tuple
    /// ids, for parallel backfill.
    CtidRange { start_page: u64, end_page: u64 },
}

/// A bind parameter of a synthesized query. Key values always travel as
/// text and compare against `CAST(col AS text)`.
#[derive(Debug, Clone)]
pub enum QueryParam {
    Text(String),
    TextArray(Vec<String>),
}

impl QueryParam {
    pub fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            QueryParam::Text(value) => value,
            QueryParam::TextArray(values) => values,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SqlQuery {
    pub sql: String,
    pub params: Vec<QueryParam>,
}

pub struct QueryBuilder<'a> {
    tree: &'a Tree,
}

impl<'a> QueryBuilder<'a> {
    pub fn new(tree: &'a Tree) -> Self {
        QueryBuilder { tree }
    }

    /// The document query: one row per selected pivot row, `_doc` first,
    /// then the pivot primary key columns cast to text.
    pub fn document_query(&self, filter: &Filter) -> SqlQuery {
        let root = self.tree.root();
        let alias = node_alias(root.id);
        let doc = self.object_expr(root, &alias);

        let mut sql = format!("SELECT {doc} AS _doc");
        for pk in &root.primary_keys {
            sql.push_str(&format!(", CAST({alias}.\"{pk}\" AS text)"));
        }
        sql.push_str(&format!(" FROM {} {alias}", root.table.quoted()));

        let mut params = Vec::new();
        let mut clauses = Vec::new();
        match filter {
            Filter::Full { txmin, txmax } => {
                if let Some(txmin) = txmin {
                    params.push(QueryParam::Text(txmin.to_string()));
                    clauses.push(format!(
                        "CAST(CAST({alias}.\"xmin\" AS text) AS bigint) > CAST(${} AS bigint)",
                        params.len()
                    ));
                }
                if let Some(txmax) = txmax {
                    params.push(QueryParam::Text(txmax.to_string()));
                    clauses.push(format!(
                        "CAST(CAST({alias}.\"xmin\" AS text) AS bigint) <= CAST(${} AS bigint)",
                        params.len()
                    ));
                }
            }
            Filter::Keys(keys) => {
                clauses.push(key_filter(&alias, &root.primary_keys, keys, &mut params));
            }
            Filter::CtidRange {
                start_page,
                end_page,
            } => {
                clauses.push(format!(
                    "{alias}.ctid >= '({start_page},0)'::tid AND {alias}.ctid < '({end_page},0)'::tid"
                ));
            }
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }

        SqlQuery { sql, params }
    }

    /// The reverse query: given values observed on one join step of a node's
    /// plan, select the distinct pivot primary keys whose documents contain
    /// matching rows.
    ///
    /// `plan` is the node's full join plan and `filter_step` indexes the step
    /// whose `child_columns` the values were taken from; the query joins the
    /// root down to that step's parent table and filters its `parent_columns`.
    pub fn root_keys_query(
        &self,
        node_id: NodeId,
        filter_step: usize,
        values: &[Vec<String>],
    ) -> SqlQuery {
        let plan = self.tree.join_plan(node_id);
        let root = self.tree.root();
        let root_alias = node_alias(root.id);

        let mut sql = String::from("SELECT DISTINCT ");
        let pk_selects: Vec<String> = root
            .primary_keys
            .iter()
            .map(|pk| format!("CAST({root_alias}.\"{pk}\" AS text)"))
            .collect();
        sql.push_str(&pk_selects.join(", "));
        sql.push_str(&format!(" FROM {} {root_alias}", root.table.quoted()));

        for (i, step) in plan.iter().take(filter_step).enumerate() {
            let parent_alias = step_alias(i, &root_alias);
            let child_alias = format!("a{}", i + 1);
            let conditions: Vec<String> = step
                .parent_columns
                .iter()
                .zip(&step.child_columns)
                .map(|(p, c)| format!("{child_alias}.\"{c}\" = {parent_alias}.\"{p}\""))
                .collect();
            sql.push_str(&format!(
                " JOIN {} {child_alias} ON {}",
                step.child.quoted(),
                conditions.join(" AND ")
            ));
        }

        let step = &plan[filter_step];
        let filter_alias = step_alias(filter_step, &root_alias);
        let mut params = Vec::new();
        let clause = key_filter(&filter_alias, &step.parent_columns, values, &mut params);
        sql.push_str(&format!(" WHERE {clause}"));

        SqlQuery { sql, params }
    }

    /// The projected JSON object of one node, children folded in.
    fn object_expr(&self, node: &Node, alias: &str) -> String {
        let pairs: Vec<(String, String)> = node
            .columns
            .iter()
            .map(|spec| (spec.output.clone(), column_expr(spec, alias)))
            .collect();
        let mut expr = build_object(&pairs);

        for &child_id in &node.children {
            let child = self.tree.node(child_id);
            let subquery = self.child_subquery(child, alias);
            expr.push_str(&format!(
                " || JSONB_BUILD_OBJECT('{}', ({subquery}))",
                child.label
            ));
        }
        expr
    }

    /// The correlated subquery producing one child's value for the parent
    /// row bound to `parent_alias`.
    fn child_subquery(&self, child: &Node, parent_alias: &str) -> String {
        let relationship = child
            .relationship
            .as_ref()
            .expect("non-root node carries a relationship");
        let child_alias = node_alias(child.id);

        let value = match relationship.variant {
            RelationshipVariant::Scalar => column_expr(child.scalar_column(), &child_alias),
            RelationshipVariant::Object => self.object_expr(child, &child_alias),
        };

        let (from_clause, where_clause) = match &relationship.through {
            None => {
                let step = &child.parent_steps[0];
                let conditions = join_conditions(step, parent_alias, &child_alias);
                (
                    format!("FROM {} {child_alias}", child.table.quoted()),
                    conditions,
                )
            }
            Some(through) => {
                let through_alias = through_alias_for(child.id);
                let to_through = &child.parent_steps[0];
                let to_child = &child.parent_steps[1];
                let join_on = join_conditions(to_child, &through_alias, &child_alias);
                (
                    format!(
                        "FROM {} {through_alias} JOIN {} {child_alias} ON {join_on}",
                        through.quoted(),
                        child.table.quoted()
                    ),
                    join_conditions(to_through, parent_alias, &through_alias),
                )
            }
        };

        match relationship.kind {
            RelationshipKind::OneToMany => {
                let order: Vec<String> = child
                    .primary_keys
                    .iter()
                    .map(|pk| format!("{child_alias}.\"{pk}\""))
                    .collect();
                format!(
                    "SELECT COALESCE(JSONB_AGG({value} ORDER BY {}), '[]'::jsonb) {from_clause} WHERE {where_clause}",
                    order.join(", ")
                )
            }
            RelationshipKind::OneToOne => {
                format!("SELECT {value} {from_clause} WHERE {where_clause}")
            }
        }
    }
}

fn node_alias(id: NodeId) -> String {
    format!("t{id}")
}

fn through_alias_for(id: NodeId) -> String {
    format!("j{id}")
}

/// Alias of the parent table of join step `i` in a reverse query.
fn step_alias(i: usize, root_alias: &str) -> String {
    if i == 0 {
        root_alias.to_string()
    } else {
        format!("a{i}")
    }
}

/// `parent.parent_columns = child.child_columns`, ANDed.
fn join_conditions(
    step: &crate::tree::JoinStep,
    parent_alias: &str,
    child_alias: &str,
) -> String {
    step.parent_columns
        .iter()
        .zip(&step.child_columns)
        .map(|(p, c)| format!("{child_alias}.\"{c}\" = {parent_alias}.\"{p}\""))
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Key filter over the given columns: `= ANY` for a single column, a tuple
/// IN-list for composite keys. Values compare as text.
fn key_filter(
    alias: &str,
    columns: &[String],
    values: &[Vec<String>],
    params: &mut Vec<QueryParam>,
) -> String {
    if columns.len() == 1 {
        params.push(QueryParam::TextArray(
            values.iter().map(|v| v[0].clone()).collect(),
        ));
        format!(
            "CAST({alias}.\"{}\" AS text) = ANY(${})",
            columns[0],
            params.len()
        )
    } else {
        let lhs: Vec<String> = columns
            .iter()
            .map(|c| format!("CAST({alias}.\"{c}\" AS text)"))
            .collect();
        let mut tuples = Vec::with_capacity(values.len());
        for value in values {
            let mut placeholders = Vec::with_capacity(value.len());
            for part in value {
                params.push(QueryParam::Text(part.clone()));
                placeholders.push(format!("${}", params.len()));
            }
            tuples.push(format!("({})", placeholders.join(", ")));
        }
        format!("({}) IN ({})", lhs.join(", "), tuples.join(", "))
    }
}

/// Render one projected column, applying its JSON accessors.
fn column_expr(spec: &ColumnSpec, alias: &str) -> String {
    let mut expr = format!("{alias}.\"{}\"", spec.source);
    for step in &spec.path {
        match step {
            PathStep::Key(key) => expr.push_str(&format!("->'{key}'")),
            PathStep::Index(index) => expr.push_str(&format!("->{index}")),
            PathStep::KeyText(key) => expr.push_str(&format!("->>'{key}'")),
            PathStep::IndexText(index) => expr.push_str(&format!("->>{index}")),
            PathStep::Slice(keys) => expr.push_str(&format!("#>'{{{}}}'", keys.join(","))),
            PathStep::SliceText(keys) => expr.push_str(&format!("#>>'{{{}}}'", keys.join(","))),
        }
    }
    expr
}

/// `JSONB_BUILD_OBJECT` with pair chunking around the 100-argument limit.
fn build_object(pairs: &[(String, String)]) -> String {
    if pairs.is_empty() {
        return "'{}'::jsonb".to_string();
    }
    pairs
        .chunks(BUILD_OBJECT_PAIR_LIMIT)
        .map(|chunk| {
            let args: Vec<String> = chunk
                .iter()
                .map(|(key, value)| format!("'{key}', {value}"))
                .collect();
            format!("JSONB_BUILD_OBJECT({})", args.join(", "))
        })
        .collect::<Vec<_>>()
        .join(" || ")
}

/// A streaming cursor over `(primary key, document)` rows.
pub struct DocumentStream {
    rows: Pin<Box<RowStream>>,
    pk_count: usize,
}

impl DocumentStream {
    pub async fn try_next(&mut self) -> Result<Option<(DocumentKey, Value)>, SyncError> {
        let row = match self
            .rows
            .try_next()
            .await
            .map_err(SyncError::DatabaseConnectionLost)?
        {
            Some(row) => row,
            None => return Ok(None),
        };
        let doc: Value = row
            .try_get(0)
            .map_err(SyncError::DatabaseConnectionLost)?;
        let mut key = Vec::with_capacity(self.pk_count);
        for i in 0..self.pk_count {
            key.push(
                row.try_get::<_, String>(i + 1)
                    .map_err(SyncError::DatabaseConnectionLost)?,
            );
        }
        Ok(Some((key, doc)))
    }
}

/// Execute a synthesized document query and stream its rows without
/// buffering the whole result.
pub async fn fetch_documents(
    client: &Client,
    query: &SqlQuery,
    pk_count: usize,
) -> Result<DocumentStream, SyncError> {
    let params: Vec<&(dyn ToSql + Sync)> = query.params.iter().map(QueryParam::as_sql).collect();
    let rows = client
        .query_raw(query.sql.as_str(), params)
        .await
        .map_err(SyncError::DatabaseConnectionLost)?;
    Ok(DocumentStream {
        rows: Box::pin(rows),
        pk_count,
    })
}

/// Execute a reverse query and collect the distinct pivot keys.
pub async fn fetch_keys(client: &Client, query: &SqlQuery) -> Result<Vec<DocumentKey>, SyncError> {
    let params: Vec<&(dyn ToSql + Sync)> = query.params.iter().map(QueryParam::as_sql).collect();
    let rows = client
        .query_raw(query.sql.as_str(), params)
        .await
        .map_err(SyncError::DatabaseConnectionLost)?;
    futures_util::pin_mut!(rows);

    let mut keys = Vec::new();
    while let Some(row) = rows
        .try_next()
        .await
        .map_err(SyncError::DatabaseConnectionLost)?
    {
        let mut key = Vec::with_capacity(row.len());
        for i in 0..row.len() {
            key.push(
                row.try_get::<_, String>(i)
                    .map_err(SyncError::DatabaseConnectionLost)?,
            );
        }
        keys.push(key);
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::{fixtures, TableRef};
    use crate::schema::SyncConfig;
    use crate::tree::Tree;

    fn book_tree() -> Tree {
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
        Tree::build(&configs[0].nodes, &fixtures::bookstore()).unwrap()
    }

    #[test]
    fn test_document_query_shape() {
        let tree = book_tree();
        let builder = QueryBuilder::new(&tree);
        let query = builder.document_query(&Filter::Full {
            txmin: None,
            txmax: None,
        });

        assert_eq!(
            query.sql,
            "SELECT JSONB_BUILD_OBJECT('isbn', t0.\"isbn\", 'title', t0.\"title\", \
             'description', t0.\"description\") || JSONB_BUILD_OBJECT('authors', \
             (SELECT COALESCE(JSONB_AGG(t1.\"name\" ORDER BY t1.\"id\"), '[]'::jsonb) \
             FROM \"public\".\"book_author\" j1 JOIN \"public\".\"author\" t1 \
             ON t1.\"id\" = j1.\"author_id\" WHERE j1.\"book_isbn\" = t0.\"isbn\")) AS _doc, \
             CAST(t0.\"isbn\" AS text) FROM \"public\".\"book\" t0"
        );
        assert!(query.params.is_empty());
    }

    #[test]
    fn test_txid_window_filter() {
        let tree = book_tree();
        let builder = QueryBuilder::new(&tree);
        let query = builder.document_query(&Filter::Full {
            txmin: Some(100),
            txmax: Some(250),
        });
        assert!(query
            .sql
            .contains("CAST(CAST(t0.\"xmin\" AS text) AS bigint) > CAST($1 AS bigint)"));
        assert!(query
            .sql
            .contains("CAST(CAST(t0.\"xmin\" AS text) AS bigint) <= CAST($2 AS bigint)"));
        assert_eq!(query.params.len(), 2);
    }

    #[test]
    fn test_pointed_sync_filter() {
        let tree = book_tree();
        let builder = QueryBuilder::new(&tree);
        let query = builder.document_query(&Filter::Keys(vec![
            vec!["9788374950978".to_string()],
            vec!["9781471331435".to_string()],
        ]));
        assert!(query
            .sql
            .ends_with("WHERE CAST(t0.\"isbn\" AS text) = ANY($1)"));
        match &query.params[0] {
            QueryParam::TextArray(values) => assert_eq!(values.len(), 2),
            other => panic!("expected text array, got {other:?}"),
        }
    }

    #[test]
    fn test_ctid_range_filter() {
        let tree = book_tree();
        let builder = QueryBuilder::new(&tree);
        let query = builder.document_query(&Filter::CtidRange {
            start_page: 0,
            end_page: 128,
        });
        assert!(query
            .sql
            .contains("t0.ctid >= '(0,0)'::tid AND t0.ctid < '(128,0)'::tid"));
    }

    #[test]
    fn test_root_keys_query_from_through_table() {
        let tree = book_tree();
        let builder = QueryBuilder::new(&tree);
        let author_id = tree
            .lookup(&TableRef::new("public", "author"))
            .unwrap();

        // a book_author row changed: filter on step 0, the book side
        let query = builder.root_keys_query(
            author_id,
            0,
            &[vec!["9788374950978".to_string()]],
        );
        assert_eq!(
            query.sql,
            "SELECT DISTINCT CAST(t0.\"isbn\" AS text) FROM \"public\".\"book\" t0 \
             WHERE CAST(t0.\"isbn\" AS text) = ANY($1)"
        );

        // an author row changed: join down to book_author, filter its author_id
        let query = builder.root_keys_query(author_id, 1, &[vec!["2".to_string()]]);
        assert_eq!(
            query.sql,
            "SELECT DISTINCT CAST(t0.\"isbn\" AS text) FROM \"public\".\"book\" t0 \
             JOIN \"public\".\"book_author\" a1 ON a1.\"book_isbn\" = t0.\"isbn\" \
             WHERE CAST(a1.\"author_id\" AS text) = ANY($1)"
        );
    }

    #[test]
    fn test_composite_key_filter_uses_tuples() {
        let mut params = Vec::new();
        let clause = key_filter(
            "t0",
            &["a".to_string(), "b".to_string()],
            &[
                vec!["1".to_string(), "x".to_string()],
                vec!["2".to_string(), "y".to_string()],
            ],
            &mut params,
        );
        assert_eq!(
            clause,
            "(CAST(t0.\"a\" AS text), CAST(t0.\"b\" AS text)) IN (($1, $2), ($3, $4))"
        );
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_json_path_column_rendering() {
        let spec = crate::tree::parse_column("meta#>{a,b}->1").unwrap();
        assert_eq!(column_expr(&spec, "t0"), "t0.\"meta\"#>'{a,b}'->1");
        let spec = crate::tree::parse_column("meta->keywords->>0").unwrap();
        assert_eq!(column_expr(&spec, "t0"), "t0.\"meta\"->'keywords'->>0");
    }

    #[test]
    fn test_build_object_chunks_past_arg_limit() {
        let pairs: Vec<(String, String)> = (0..60)
            .map(|i| (format!("k{i}"), format!("t0.\"c{i}\"")))
            .collect();
        let expr = build_object(&pairs);
        assert_eq!(expr.matches("JSONB_BUILD_OBJECT").count(), 2);
        assert!(expr.contains(" || "));
    }
}
