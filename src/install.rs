//! Trigger and slot installation.
//!
//! `setup` and `teardown` are idempotent: every statement either replaces
//! its object or checks for it first, so re-running is a no-op. Triggers are
//! installed only for tables referenced by the active tree. Teardown drops
//! the slot last and never fails on a slot another consumer still holds.

use std::collections::{BTreeMap, BTreeSet};

use tokio_postgres::error::SqlState;
use tokio_postgres::Client;
use tracing::{debug, info, warn};

use crate::checkpoint::sync_name;
use crate::connect;
use crate::error::SyncError;
use crate::reflect::{Reflection, TableRef};
use crate::trigger::{self, KeyViewRow, KEY_VIEW, PLUGIN};
use crate::tree::Tree;

pub struct Installer<'a> {
    client: &'a Client,
    tree: &'a Tree,
    reflection: &'a Reflection,
    database: String,
    index: String,
}

impl<'a> Installer<'a> {
    pub fn new(
        client: &'a Client,
        tree: &'a Tree,
        reflection: &'a Reflection,
        database: &str,
        index: &str,
    ) -> Self {
        Installer {
            client,
            tree,
            reflection,
            database: database.to_string(),
            index: index.to_string(),
        }
    }

    fn slot(&self) -> String {
        sync_name(&self.database, &self.index)
    }

    /// Install the notification function, key view, per-table triggers and
    /// the replication slot. With `no_create`, only objects that do not
    /// exist yet are created.
    pub async fn setup(&self, no_create: bool) -> Result<(), SyncError> {
        if !connect::has_replication_privilege(self.client).await? {
            let user = connect::current_user(self.client).await?;
            return Err(SyncError::InsufficientPrivilege(user));
        }

        for schema in self.tree.schemas() {
            if !no_create || !self.function_exists(&schema).await? {
                self.execute(&trigger::create_notify_function(&schema)).await?;
                info!("created notification function in schema {schema}");
            }

            if !no_create || !self.view_exists(&schema).await? {
                self.create_key_view(&schema).await?;
            }

            for table in self.tables_in(&schema) {
                for (name, sql) in [
                    trigger::create_notify_trigger(&schema, &table.table),
                    trigger::create_truncate_trigger(&schema, &table.table),
                ] {
                    if no_create && self.trigger_exists(&schema, &table.table, &name).await? {
                        continue;
                    }
                    self.execute(&trigger::drop_trigger(&schema, &table.table, &name))
                        .await?;
                    self.execute(&sql).await?;
                    debug!("created trigger {name} on {table}");
                }
            }
        }

        let slot = self.slot();
        if !crate::capture::ReplicationReader::slot_exists(self.client, &slot).await? {
            self.client
                .query(
                    "SELECT * FROM PG_CREATE_LOGICAL_REPLICATION_SLOT($1, $2)",
                    &[&slot, &PLUGIN],
                )
                .await
                .map_err(SyncError::DatabaseConnectionLost)?;
            info!("created replication slot {slot}");
        } else {
            info!("replication slot {slot} already exists");
        }
        Ok(())
    }

    /// Drop the triggers, view, function, and finally the slot. A slot in
    /// use by another consumer is reported and skipped, never fatal.
    pub async fn teardown(&self) -> Result<(), SyncError> {
        for schema in self.tree.schemas() {
            for table in self.tables_in(&schema) {
                for name in [
                    format!("{}_notify", table.table),
                    format!("{}_truncate", table.table),
                ] {
                    self.execute(&trigger::drop_trigger(&schema, &table.table, &name))
                        .await?;
                }
            }
            self.execute(&trigger::drop_key_view(&schema)).await?;
            self.execute(&trigger::drop_notify_function(&schema)).await?;
        }

        let slot = self.slot();
        if crate::capture::ReplicationReader::slot_exists(self.client, &slot).await? {
            match self
                .client
                .query("SELECT PG_DROP_REPLICATION_SLOT($1)", &[&slot])
                .await
            {
                Ok(_) => info!("dropped replication slot {slot}"),
                Err(e) if e.code() == Some(&SqlState::OBJECT_IN_USE) => {
                    warn!("replication slot {slot} is in use by another consumer; skipping drop");
                }
                Err(e) => return Err(SyncError::DatabaseConnectionLost(e)),
            }
        }
        Ok(())
    }

    /// Build the key metadata view for one schema, merging rows from other
    /// syncs sharing the schema so their triggers keep firing.
    async fn create_key_view(&self, schema: &str) -> Result<(), SyncError> {
        let mut rows: BTreeMap<String, KeyViewRow> = BTreeMap::new();
        if self.view_exists(schema).await? {
            for row in self
                .client
                .query(
                    &format!(
                        "SELECT table_name, primary_keys, foreign_keys, indices \
                         FROM \"{schema}\".{KEY_VIEW}"
                    ),
                    &[],
                )
                .await
                .map_err(SyncError::DatabaseConnectionLost)?
            {
                let table: String = row.get(0);
                rows.insert(
                    table.clone(),
                    KeyViewRow {
                        table,
                        primary_keys: row.get(1),
                        foreign_keys: row.get(2),
                        indices: row.get(3),
                    },
                );
            }
        }

        for row in self.key_rows(schema) {
            match rows.get_mut(&row.table) {
                Some(existing) => {
                    existing.primary_keys = row.primary_keys;
                    existing.foreign_keys = row.foreign_keys;
                    for index in row.indices {
                        if !existing.indices.contains(&index) {
                            existing.indices.push(index);
                        }
                    }
                }
                None => {
                    rows.insert(row.table.clone(), row);
                }
            }
        }

        let rows: Vec<KeyViewRow> = rows.into_values().collect();
        self.execute(&trigger::drop_key_view(schema)).await?;
        self.execute(&trigger::create_key_view(schema, &rows)).await?;
        info!("created key metadata view in schema {schema}");
        Ok(())
    }

    /// The view rows this sync contributes: per table, its primary keys and
    /// every column participating in a join step.
    fn key_rows(&self, schema: &str) -> Vec<KeyViewRow> {
        let mut foreign_keys: BTreeMap<TableRef, BTreeSet<String>> = BTreeMap::new();
        for node in self.tree.nodes() {
            for step in &node.parent_steps {
                foreign_keys
                    .entry(step.parent.clone())
                    .or_default()
                    .extend(step.parent_columns.iter().cloned());
                foreign_keys
                    .entry(step.child.clone())
                    .or_default()
                    .extend(step.child_columns.iter().cloned());
            }
        }

        self.tables_in(schema)
            .into_iter()
            .map(|table| {
                let primary_keys = self
                    .reflection
                    .table(&table)
                    .map(|meta| meta.primary_keys.clone())
                    .unwrap_or_default();
                KeyViewRow {
                    table: table.table.clone(),
                    primary_keys,
                    foreign_keys: foreign_keys
                        .get(&table)
                        .map(|columns| columns.iter().cloned().collect())
                        .unwrap_or_default(),
                    indices: vec![self.index.clone()],
                }
            })
            .collect()
    }

    fn tables_in(&self, schema: &str) -> Vec<TableRef> {
        self.tree
            .tables()
            .into_iter()
            .filter(|table| table.schema == schema)
            .collect()
    }

    async fn function_exists(&self, schema: &str) -> Result<bool, SyncError> {
        let rows = self
            .client
            .query(
                "SELECT 1 FROM pg_proc p JOIN pg_namespace n ON n.oid = p.pronamespace \
                 WHERE p.proname = $1 AND n.nspname = $2",
                &[&trigger::TRIGGER_FUNCTION, &schema],
            )
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;
        Ok(!rows.is_empty())
    }

    async fn view_exists(&self, schema: &str) -> Result<bool, SyncError> {
        let rows = self
            .client
            .query(
                "SELECT 1 FROM pg_views WHERE schemaname = $1 AND viewname = $2",
                &[&schema, &KEY_VIEW],
            )
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;
        Ok(!rows.is_empty())
    }

    async fn trigger_exists(
        &self,
        schema: &str,
        table: &str,
        name: &str,
    ) -> Result<bool, SyncError> {
        let rows = self
            .client
            .query(
                "SELECT 1 FROM pg_trigger t \
                 JOIN pg_class c ON c.oid = t.tgrelid \
                 JOIN pg_namespace n ON n.oid = c.relnamespace \
                 WHERE t.tgname = $1 AND c.relname = $2 AND n.nspname = $3",
                &[&name, &table, &schema],
            )
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;
        Ok(!rows.is_empty())
    }

    async fn execute(&self, sql: &str) -> Result<(), SyncError> {
        self.client
            .simple_query(sql)
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;
        Ok(())
    }
}
