//! Database reflection.
//!
//! The database catalog is the source of truth for columns, primary keys and
//! foreign keys; nothing here is re-derived from the schema file. A
//! [`Reflection`] is loaded once per sync from a live connection, or built
//! offline from [`TableMeta`] values in tests.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tokio_postgres::Client;

use crate::error::SyncError;

/// Fully qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TableRef {
    pub schema: String,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        TableRef {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `"schema"."table"`, safe for interpolation into SQL.
    pub fn quoted(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.table)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub data_type: String,
}

/// One foreign key constraint, as declared in the catalog.
#[derive(Debug, Clone)]
pub struct ForeignKeyMeta {
    /// Table carrying the constraint.
    pub referring: TableRef,
    pub referring_columns: Vec<String>,
    /// Table the constraint points at.
    pub referred: TableRef,
    pub referred_columns: Vec<String>,
}

impl ForeignKeyMeta {
    /// Whether this constraint links the two given tables, in either direction.
    pub fn links(&self, a: &TableRef, b: &TableRef) -> bool {
        (&self.referring == a && &self.referred == b)
            || (&self.referring == b && &self.referred == a)
    }
}

#[derive(Debug, Clone)]
pub struct TableMeta {
    pub table: TableRef,
    pub columns: Vec<ColumnMeta>,
    /// Primary key columns in constraint order.
    pub primary_keys: Vec<String>,
    /// Outgoing foreign keys.
    pub foreign_keys: Vec<ForeignKeyMeta>,
}

impl TableMeta {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// Reflected view of the source database.
#[derive(Debug, Clone, Default)]
pub struct Reflection {
    tables: HashMap<TableRef, TableMeta>,
    schemas: HashSet<String>,
}

impl Reflection {
    /// Build a reflection from pre-collected table metadata. Used by tests
    /// and by anything that already holds a catalog snapshot.
    pub fn from_tables(tables: Vec<TableMeta>) -> Self {
        let mut reflection = Reflection::default();
        for meta in tables {
            reflection.schemas.insert(meta.table.schema.clone());
            reflection.tables.insert(meta.table.clone(), meta);
        }
        reflection
    }

    /// Reflect every user table in the given schemas from a live connection.
    pub async fn load(client: &Client, schemas: &[String]) -> Result<Self, SyncError> {
        let mut tables: HashMap<TableRef, TableMeta> = HashMap::new();

        let column_rows = client
            .query(
                "SELECT table_schema, table_name, column_name, data_type
                 FROM information_schema.columns
                 WHERE table_schema = ANY($1)
                 ORDER BY table_schema, table_name, ordinal_position",
                &[&schemas],
            )
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;

        for row in column_rows {
            let table = TableRef::new(row.get::<_, String>(0), row.get::<_, String>(1));
            let entry = tables.entry(table.clone()).or_insert_with(|| TableMeta {
                table,
                columns: Vec::new(),
                primary_keys: Vec::new(),
                foreign_keys: Vec::new(),
            });
            entry.columns.push(ColumnMeta {
                name: row.get(2),
                data_type: row.get(3),
            });
        }

        let pk_rows = client
            .query(
                "SELECT sn.nspname, st.relname,
                        (SELECT ARRAY_AGG(a.attname ORDER BY x.ord)
                         FROM UNNEST(c.conkey) WITH ORDINALITY AS x(attnum, ord)
                         JOIN pg_attribute a
                           ON a.attrelid = c.conrelid AND a.attnum = x.attnum)
                 FROM pg_constraint c
                 JOIN pg_class st ON st.oid = c.conrelid
                 JOIN pg_namespace sn ON sn.oid = st.relnamespace
                 WHERE c.contype = 'p' AND sn.nspname = ANY($1)",
                &[&schemas],
            )
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;

        for row in pk_rows {
            let table = TableRef::new(row.get::<_, String>(0), row.get::<_, String>(1));
            if let Some(meta) = tables.get_mut(&table) {
                meta.primary_keys = row.get::<_, Vec<String>>(2);
            }
        }

        let fk_rows = client
            .query(
                "SELECT sn.nspname, st.relname,
                        (SELECT ARRAY_AGG(a.attname ORDER BY x.ord)
                         FROM UNNEST(c.conkey) WITH ORDINALITY AS x(attnum, ord)
                         JOIN pg_attribute a
                           ON a.attrelid = c.conrelid AND a.attnum = x.attnum),
                        tn.nspname, tt.relname,
                        (SELECT ARRAY_AGG(a.attname ORDER BY x.ord)
                         FROM UNNEST(c.confkey) WITH ORDINALITY AS x(attnum, ord)
                         JOIN pg_attribute a
                           ON a.attrelid = c.confrelid AND a.attnum = x.attnum)
                 FROM pg_constraint c
                 JOIN pg_class st ON st.oid = c.conrelid
                 JOIN pg_namespace sn ON sn.oid = st.relnamespace
                 JOIN pg_class tt ON tt.oid = c.confrelid
                 JOIN pg_namespace tn ON tn.oid = tt.relnamespace
                 WHERE c.contype = 'f' AND sn.nspname = ANY($1)",
                &[&schemas],
            )
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;

        for row in fk_rows {
            let referring = TableRef::new(row.get::<_, String>(0), row.get::<_, String>(1));
            let fk = ForeignKeyMeta {
                referring: referring.clone(),
                referring_columns: row.get::<_, Vec<String>>(2),
                referred: TableRef::new(row.get::<_, String>(3), row.get::<_, String>(4)),
                referred_columns: row.get::<_, Vec<String>>(5),
            };
            if let Some(meta) = tables.get_mut(&referring) {
                meta.foreign_keys.push(fk);
            }
        }

        Ok(Reflection::from_tables(tables.into_values().collect()))
    }

    pub fn table(&self, table: &TableRef) -> Option<&TableMeta> {
        self.tables.get(table)
    }

    pub fn has_schema(&self, schema: &str) -> bool {
        self.schemas.contains(schema)
    }

    /// Every foreign key constraint connecting the two tables, regardless of
    /// which side carries it.
    pub fn foreign_keys_between(&self, a: &TableRef, b: &TableRef) -> Vec<&ForeignKeyMeta> {
        let mut found = Vec::new();
        for table in [a, b] {
            if let Some(meta) = self.tables.get(table) {
                for fk in &meta.foreign_keys {
                    if fk.links(a, b) {
                        found.push(fk);
                    }
                }
            }
        }
        found
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    //! Reflected metadata for the bookstore example, shared across tests.

    use super::*;

    pub fn bookstore() -> Reflection {
        let book = TableRef::new("public", "book");
        let author = TableRef::new("public", "author");
        let book_author = TableRef::new("public", "book_author");
        let publisher = TableRef::new("public", "publisher");

        Reflection::from_tables(vec![
            TableMeta {
                table: book.clone(),
                columns: vec![
                    column("isbn", "character varying"),
                    column("title", "character varying"),
                    column("description", "text"),
                    column("publisher_id", "integer"),
                ],
                primary_keys: vec!["isbn".to_string()],
                foreign_keys: vec![ForeignKeyMeta {
                    referring: book.clone(),
                    referring_columns: vec!["publisher_id".to_string()],
                    referred: publisher.clone(),
                    referred_columns: vec!["id".to_string()],
                }],
            },
            TableMeta {
                table: author.clone(),
                columns: vec![column("id", "integer"), column("name", "character varying")],
                primary_keys: vec!["id".to_string()],
                foreign_keys: vec![],
            },
            TableMeta {
                table: book_author.clone(),
                columns: vec![
                    column("book_isbn", "character varying"),
                    column("author_id", "integer"),
                ],
                primary_keys: vec!["book_isbn".to_string(), "author_id".to_string()],
                foreign_keys: vec![
                    ForeignKeyMeta {
                        referring: book_author.clone(),
                        referring_columns: vec!["book_isbn".to_string()],
                        referred: book.clone(),
                        referred_columns: vec!["isbn".to_string()],
                    },
                    ForeignKeyMeta {
                        referring: book_author.clone(),
                        referring_columns: vec!["author_id".to_string()],
                        referred: author.clone(),
                        referred_columns: vec!["id".to_string()],
                    },
                ],
            },
            TableMeta {
                table: publisher.clone(),
                columns: vec![column("id", "integer"), column("name", "character varying")],
                primary_keys: vec!["id".to_string()],
                foreign_keys: vec![],
            },
        ])
    }

    fn column(name: &str, data_type: &str) -> ColumnMeta {
        ColumnMeta {
            name: name.to_string(),
            data_type: data_type.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_foreign_keys_between() {
        let reflection = fixtures::bookstore();
        let book = TableRef::new("public", "book");
        let book_author = TableRef::new("public", "book_author");
        let author = TableRef::new("public", "author");

        let fks = reflection.foreign_keys_between(&book, &book_author);
        assert_eq!(fks.len(), 1);
        assert_eq!(fks[0].referring_columns, vec!["book_isbn"]);
        assert_eq!(fks[0].referred_columns, vec!["isbn"]);

        let fks = reflection.foreign_keys_between(&book_author, &author);
        assert_eq!(fks.len(), 1);

        // no direct link between book and author
        assert!(reflection.foreign_keys_between(&book, &author).is_empty());
    }

    #[test]
    fn test_table_lookup() {
        let reflection = fixtures::bookstore();
        let book = reflection.table(&TableRef::new("public", "book")).unwrap();
        assert_eq!(book.primary_keys, vec!["isbn"]);
        assert!(book.has_column("title"));
        assert!(!book.has_column("missing"));
        assert!(reflection.has_schema("public"));
        assert!(!reflection.has_schema("audit"));
    }

    #[test]
    fn test_quoted_table_ref() {
        assert_eq!(TableRef::new("public", "book").quoted(), "\"public\".\"book\"");
        assert_eq!(TableRef::new("public", "book").to_string(), "public.book");
    }
}
