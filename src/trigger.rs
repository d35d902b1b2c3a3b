//! DDL templates for the database artifacts.
//!
//! Bootstrap installs, per schema, one notification function and one helper
//! view exposing key metadata, plus a notify and a truncate trigger per
//! table. The notification function projects the changed row down to its
//! primary and foreign key columns and publishes the payload on a channel
//! named after the database, so notification payloads stay small no matter
//! how wide the row is.

/// Name of the per-schema notification trigger function.
pub const TRIGGER_FUNCTION: &str = "search_sync_notify";

/// Name of the per-schema key metadata view the function reads.
pub const KEY_VIEW: &str = "_search_sync_keys";

/// The logical decoding output plugin.
pub const PLUGIN: &str = "wal2json";

/// One row of the key metadata view.
#[derive(Debug, Clone)]
pub struct KeyViewRow {
    pub table: String,
    pub primary_keys: Vec<String>,
    pub foreign_keys: Vec<String>,
    pub indices: Vec<String>,
}

/// The notification trigger function for one schema.
///
/// The channel is the database name. The payload carries tg_op, table,
/// schema, the key columns of OLD/NEW, the row's xmin and the target
/// indices, matching [`crate::event::ChangeEvent`].
pub fn create_notify_function(schema: &str) -> String {
    format!(
        r#"CREATE OR REPLACE FUNCTION "{schema}".{TRIGGER_FUNCTION}() RETURNS TRIGGER AS $$
DECLARE
  channel TEXT;
  old_row JSON;
  new_row JSON;
  notification JSON;
  xmin BIGINT;
  _indices TEXT [];
  _primary_keys TEXT [];
  _foreign_keys TEXT [];
BEGIN
    channel := CURRENT_DATABASE();

    IF TG_OP = 'DELETE' THEN
        SELECT primary_keys, indices
        INTO _primary_keys, _indices
        FROM "{schema}".{KEY_VIEW}
        WHERE table_name = TG_TABLE_NAME;

        old_row = ROW_TO_JSON(OLD);
        old_row := (
            SELECT JSONB_OBJECT_AGG(key, value)
            FROM JSON_EACH(old_row)
            WHERE key = ANY(_primary_keys)
        );
        xmin := OLD.xmin;
    ELSE
        IF TG_OP <> 'TRUNCATE' THEN
            SELECT primary_keys, foreign_keys, indices
            INTO _primary_keys, _foreign_keys, _indices
            FROM "{schema}".{KEY_VIEW}
            WHERE table_name = TG_TABLE_NAME;

            new_row = ROW_TO_JSON(NEW);
            new_row := (
                SELECT JSONB_OBJECT_AGG(key, value)
                FROM JSON_EACH(new_row)
                WHERE key = ANY(_primary_keys || _foreign_keys)
            );
            IF TG_OP = 'UPDATE' THEN
                old_row = ROW_TO_JSON(OLD);
                old_row := (
                    SELECT JSONB_OBJECT_AGG(key, value)
                    FROM JSON_EACH(old_row)
                    WHERE key = ANY(_primary_keys || _foreign_keys)
                );
            END IF;
            xmin := NEW.xmin;
        ELSE
            SELECT indices INTO _indices
            FROM "{schema}".{KEY_VIEW}
            WHERE table_name = TG_TABLE_NAME;
        END IF;
    END IF;

    notification = JSON_BUILD_OBJECT(
        'xmin', xmin,
        'new', new_row,
        'old', old_row,
        'indices', _indices,
        'tg_op', TG_OP,
        'table', TG_TABLE_NAME,
        'schema', TG_TABLE_SCHEMA
    );

    PERFORM PG_NOTIFY(channel, notification::TEXT);

  RETURN NEW;
END;
$$ LANGUAGE plpgsql"#
    )
}

pub fn drop_notify_function(schema: &str) -> String {
    format!("DROP FUNCTION IF EXISTS \"{schema}\".{TRIGGER_FUNCTION}() CASCADE")
}

/// Row trigger for INSERT/UPDATE/DELETE; named `<table>_notify`.
pub fn create_notify_trigger(schema: &str, table: &str) -> (String, String) {
    let name = format!("{table}_notify");
    let sql = format!(
        "CREATE TRIGGER \"{name}\" \
         AFTER INSERT OR UPDATE OR DELETE ON \"{schema}\".\"{table}\" \
         FOR EACH ROW EXECUTE PROCEDURE \"{schema}\".{TRIGGER_FUNCTION}()"
    );
    (name, sql)
}

/// Statement trigger for TRUNCATE; named `<table>_truncate`.
pub fn create_truncate_trigger(schema: &str, table: &str) -> (String, String) {
    let name = format!("{table}_truncate");
    let sql = format!(
        "CREATE TRIGGER \"{name}\" \
         AFTER TRUNCATE ON \"{schema}\".\"{table}\" \
         FOR EACH STATEMENT EXECUTE PROCEDURE \"{schema}\".{TRIGGER_FUNCTION}()"
    );
    (name, sql)
}

pub fn drop_trigger(schema: &str, table: &str, name: &str) -> String {
    format!("DROP TRIGGER IF EXISTS \"{name}\" ON \"{schema}\".\"{table}\"")
}

/// The key metadata view: one row per table with its primary keys, the
/// foreign key columns participating in any join plan, and the target
/// indices whose trees contain it.
pub fn create_key_view(schema: &str, rows: &[KeyViewRow]) -> String {
    let values: Vec<String> = rows
        .iter()
        .map(|row| {
            format!(
                "('{}', {}, {}, {})",
                row.table,
                text_array(&row.primary_keys),
                text_array(&row.foreign_keys),
                text_array(&row.indices)
            )
        })
        .collect();
    format!(
        "CREATE VIEW \"{schema}\".{KEY_VIEW} AS SELECT * FROM (VALUES {}) AS v(table_name, primary_keys, foreign_keys, indices)",
        values.join(", ")
    )
}

pub fn drop_key_view(schema: &str) -> String {
    format!("DROP VIEW IF EXISTS \"{schema}\".{KEY_VIEW} CASCADE")
}

fn text_array(items: &[String]) -> String {
    if items.is_empty() {
        return "ARRAY[]::text[]".to_string();
    }
    let quoted: Vec<String> = items.iter().map(|item| format!("'{item}'")).collect();
    format!("ARRAY[{}]::text[]", quoted.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_function_projects_key_columns() {
        let sql = create_notify_function("public");
        assert!(sql.contains("CREATE OR REPLACE FUNCTION \"public\".search_sync_notify()"));
        assert!(sql.contains("channel := CURRENT_DATABASE()"));
        assert!(sql.contains("WHERE key = ANY(_primary_keys || _foreign_keys)"));
        assert!(sql.contains("PERFORM PG_NOTIFY(channel, notification::TEXT)"));
        // DELETE payloads carry only primary keys
        assert!(sql.contains("WHERE key = ANY(_primary_keys)"));
    }

    #[test]
    fn test_trigger_names() {
        let (name, sql) = create_notify_trigger("public", "book");
        assert_eq!(name, "book_notify");
        assert!(sql.contains("AFTER INSERT OR UPDATE OR DELETE ON \"public\".\"book\""));
        assert!(sql.contains("FOR EACH ROW"));

        let (name, sql) = create_truncate_trigger("public", "book");
        assert_eq!(name, "book_truncate");
        assert!(sql.contains("AFTER TRUNCATE"));
        assert!(sql.contains("FOR EACH STATEMENT"));
    }

    #[test]
    fn test_key_view_values() {
        let sql = create_key_view(
            "public",
            &[KeyViewRow {
                table: "book".to_string(),
                primary_keys: vec!["isbn".to_string()],
                foreign_keys: vec!["publisher_id".to_string()],
                indices: vec!["bookstore".to_string()],
            }],
        );
        assert!(sql.contains("CREATE VIEW \"public\"._search_sync_keys"));
        assert!(sql.contains("('book', ARRAY['isbn']::text[], ARRAY['publisher_id']::text[], ARRAY['bookstore']::text[])"));
        assert!(sql.ends_with("AS v(table_name, primary_keys, foreign_keys, indices)"));
    }

    #[test]
    fn test_empty_foreign_keys_render_typed_empty_array() {
        let sql = create_key_view(
            "public",
            &[KeyViewRow {
                table: "author".to_string(),
                primary_keys: vec!["id".to_string()],
                foreign_keys: vec![],
                indices: vec!["bookstore".to_string()],
            }],
        );
        assert!(sql.contains("ARRAY[]::text[]"));
    }
}
