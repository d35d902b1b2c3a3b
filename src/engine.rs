//! The sync engine.
//!
//! One engine per sync definition. It is the sole consumer of the event
//! queue and the sole writer of the checkpoint. The main loop steps through
//! `Idle → Draining → Querying → Indexing → Checkpointing → Idle`, with a
//! self-loop on `Draining` while the queue is empty.
//!
//! Events map to affected pivot primary keys database-side: a change on a
//! node table (or a through table) joins back to the root along the stored
//! join plan, filtering on the key values the event payload carries. The
//! deduplicated key set then runs through the synthesizer in pointed-sync
//! mode and the resulting documents go to the bulk indexer. The checkpoint
//! advances to the batch's highest transaction id only after the indexer
//! acknowledged the whole batch.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio_postgres::Client;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, CtidCheckpointFile};
use crate::connect;
use crate::error::{ErrorKind, SyncError};
use crate::event::{ChangeEvent, TgOp};
use crate::indexer::{BulkIndexer, DocAction};
use crate::query::{fetch_documents, fetch_keys, DocumentKey, Filter, QueryBuilder};
use crate::queue::EventQueue;
use crate::reflect::TableRef;
use crate::settings::Settings;
use crate::transform;
use crate::tree::{NodeId, Tree};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Draining,
    Querying,
    Indexing,
    Checkpointing,
}

/// Read-only snapshot of the engine's run state.
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub state: EngineState,
    pub txmin_committed: u64,
    pub events_processed: u64,
    pub docs_indexed: u64,
}

pub struct SyncEngine {
    database: String,
    index: String,
    conn_str: String,
    tree: Arc<Tree>,
    settings: Settings,
    client: Client,
    queue: Arc<dyn EventQueue>,
    indexer: Arc<dyn BulkIndexer>,
    store: Box<dyn CheckpointStore>,
    checkpoint: Checkpoint,
    status: Arc<StdMutex<EngineStatus>>,
    indexed_tx: watch::Sender<u64>,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        database: &str,
        index: &str,
        conn_str: &str,
        tree: Arc<Tree>,
        settings: Settings,
        client: Client,
        queue: Arc<dyn EventQueue>,
        indexer: Arc<dyn BulkIndexer>,
        store: Box<dyn CheckpointStore>,
    ) -> Result<Self, SyncError> {
        let checkpoint = store
            .load()
            .await?
            .unwrap_or_else(|| Checkpoint::new(0));
        let status = Arc::new(StdMutex::new(EngineStatus {
            state: EngineState::Idle,
            txmin_committed: checkpoint.txmin_committed,
            events_processed: 0,
            docs_indexed: 0,
        }));
        let (indexed_tx, _) = watch::channel(checkpoint.txmin_committed);
        Ok(SyncEngine {
            database: database.to_string(),
            index: index.to_string(),
            conn_str: conn_str.to_string(),
            tree,
            settings,
            client,
            queue,
            indexer,
            store,
            checkpoint,
            status,
            indexed_tx,
        })
    }

    pub fn status(&self) -> EngineStatus {
        self.status.lock().expect("status lock").clone()
    }

    /// Shared handle for observability; readers see state transitions live.
    pub fn status_handle(&self) -> Arc<StdMutex<EngineStatus>> {
        Arc::clone(&self.status)
    }

    /// Watch of the highest durably indexed transaction id; the replication
    /// reader gates slot advancement on it.
    pub fn indexed_watch(&self) -> watch::Receiver<u64> {
        self.indexed_tx.subscribe()
    }

    pub fn txmin_committed(&self) -> u64 {
        self.checkpoint.txmin_committed
    }

    fn set_state(&self, state: EngineState) {
        let mut status = self.status.lock().expect("status lock");
        status.state = state;
        status.txmin_committed = self.checkpoint.txmin_committed;
    }

    fn count(&self, events: u64, docs: u64) {
        let mut status = self.status.lock().expect("status lock");
        status.events_processed += events;
        status.docs_indexed += docs;
    }

    /// Start-up validation that cannot wait for the first batch.
    pub async fn preflight(&self) -> Result<(), SyncError> {
        let wal_level = connect::pg_setting(&self.client, "wal_level").await?;
        if wal_level.as_deref() != Some("logical") {
            return Err(SyncError::InvalidSchema(
                "enable logical decoding by setting wal_level = logical".to_string(),
            ));
        }
        let max_slots = connect::pg_setting(&self.client, "max_replication_slots").await?;
        if max_slots.and_then(|raw| raw.parse::<i64>().ok()).unwrap_or(0) < 1 {
            return Err(SyncError::InvalidSchema(
                "set max_replication_slots to at least 1".to_string(),
            ));
        }
        let slot = crate::checkpoint::sync_name(&self.database, &self.index);
        if !crate::capture::ReplicationReader::slot_exists(&self.client, &slot).await? {
            return Err(SyncError::ReplicationSlotGone(slot));
        }
        if !self.settings.redis_checkpoint {
            let dir = &self.settings.checkpoint_path;
            if !dir.exists() {
                return Err(SyncError::InvalidSchema(format!(
                    "checkpoint directory {} does not exist",
                    dir.display()
                )));
            }
        }
        Ok(())
    }

    /// Forward-pass sync: every pivot row in the `(txmin, txmax]` window,
    /// streamed, transformed and bulk-indexed. Returns documents indexed.
    pub async fn full_sync(
        &mut self,
        txmin: Option<u64>,
        txmax: Option<u64>,
    ) -> Result<u64, SyncError> {
        self.set_state(EngineState::Querying);
        let builder = QueryBuilder::new(&self.tree);
        let query = builder.document_query(&Filter::Full { txmin, txmax });
        let pk_count = self.tree.root().primary_keys.len();
        let mut stream = fetch_documents(&self.client, &query, pk_count).await?;

        let mut indexed = 0u64;
        let mut batch: Vec<DocAction> = Vec::new();
        while let Some((key, doc)) = stream.try_next().await? {
            if let Some(action) = self.doc_action(&key, doc) {
                batch.push(action);
            }
            if batch.len() >= self.settings.elasticsearch_chunk_size {
                self.set_state(EngineState::Indexing);
                indexed += self.bulk_with_retry(std::mem::take(&mut batch)).await? as u64;
                self.set_state(EngineState::Querying);
            }
        }
        if !batch.is_empty() {
            self.set_state(EngineState::Indexing);
            indexed += self.bulk_with_retry(batch).await? as u64;
        }
        self.count(0, indexed);
        Ok(indexed)
    }

    /// Sync up to the current transaction id and move the checkpoint there.
    /// Run at startup so changes missed while down are recovered before the
    /// live event stream takes over.
    pub async fn pull(&mut self) -> Result<(), SyncError> {
        let txmax = connect::txid_current(&self.client).await?;
        let txmin = match self.checkpoint.txmin_committed {
            0 => None,
            committed => Some(committed),
        };
        debug!("pull txmin: {txmin:?} txmax: {txmax}");
        let indexed = self.full_sync(txmin, Some(txmax)).await?;
        info!(
            "pulled {indexed} documents for {}:{} up to txid {txmax}",
            self.database, self.index
        );
        self.advance_checkpoint(txmax).await?;
        self.set_state(EngineState::Idle);
        Ok(())
    }

    /// One engine step: drain a batch from the queue and process it.
    /// Returns whether any events were seen.
    pub async fn run_once(&mut self) -> Result<bool, SyncError> {
        self.set_state(EngineState::Draining);
        let events = self.queue.pop(self.settings.redis_read_chunk_size).await?;
        if events.is_empty() {
            self.set_state(EngineState::Idle);
            return Ok(false);
        }
        self.process_batch(events).await?;
        Ok(true)
    }

    /// Drain-poll loop until shutdown. The current batch always completes
    /// and the checkpoint persists before exit.
    pub async fn run(&mut self, mut shutdown: broadcast::Receiver<()>) -> Result<(), SyncError> {
        loop {
            if shutdown.try_recv().is_ok() {
                break;
            }
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.settings.poll_timeout) => {}
                    }
                }
                Err(e) => match e.kind() {
                    ErrorKind::Broker => {
                        warn!("broker unavailable, engine stalled: {e}");
                        tokio::time::sleep(self.settings.redis_socket_timeout).await;
                    }
                    ErrorKind::TransientSource => {
                        self.reconnect().await?;
                    }
                    _ => return Err(e),
                },
            }
        }
        self.store.save(&self.checkpoint).await?;
        self.set_state(EngineState::Idle);
        info!("engine for {}:{} stopped", self.database, self.index);
        Ok(())
    }

    /// Bounded-backoff reconnect; escalates after exhaustion.
    async fn reconnect(&mut self) -> Result<(), SyncError> {
        let mut backoff = Duration::from_secs(1);
        for attempt in 1..=5u32 {
            warn!("reconnecting to source database (attempt {attempt})");
            match connect::connect(&self.conn_str).await {
                Ok(client) => {
                    self.client = client;
                    return Ok(());
                }
                Err(e) if attempt == 5 => return Err(e),
                Err(e) => {
                    warn!("reconnect failed: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_secs(60));
                }
            }
        }
        unreachable!("reconnect loop returns")
    }

    /// Process one drained batch: group consecutive events by operation and
    /// table, resolve and index each group, then advance the checkpoint.
    async fn process_batch(&mut self, events: Vec<ChangeEvent>) -> Result<(), SyncError> {
        let total = events.len() as u64;
        let mut max_xmin = 0u64;
        for event in &events {
            if let Some(xmin) = event.xmin {
                max_xmin = max_xmin.max(xmin);
            }
        }

        let mut quarantined = false;
        for group in consecutive_groups(events) {
            quarantined |= self.process_group(group).await?;
        }

        self.set_state(EngineState::Checkpointing);
        if quarantined {
            warn!("batch contained quarantined groups; checkpoint not advanced");
        } else if max_xmin > 0 {
            self.advance_checkpoint(max_xmin).await?;
        }
        self.count(total, 0);
        self.set_state(EngineState::Idle);
        Ok(())
    }

    async fn advance_checkpoint(&mut self, txid: u64) -> Result<(), SyncError> {
        if self.checkpoint.advance_to(txid) {
            self.store.save(&self.checkpoint).await?;
            let _ = self.indexed_tx.send(self.checkpoint.txmin_committed);
            debug!("checkpoint advanced to {txid}");
        }
        Ok(())
    }

    /// Handle one `(tg_op, table)` run of events. Returns whether the group
    /// was quarantined on a fatal indexer failure.
    async fn process_group(&mut self, events: Vec<ChangeEvent>) -> Result<bool, SyncError> {
        let first = &events[0];
        let table = TableRef::new(first.schema.clone(), first.table.clone());
        let tg_op = first.tg_op;

        let result = if self.tree.lookup(&table) == Some(self.tree.root().id) {
            self.process_root_group(tg_op, &events).await
        } else if let Some(node_id) = self.tree.lookup(&table) {
            self.process_child_group(node_id, None, tg_op, &events).await
        } else if let Some(node_id) = self.tree.lookup_through(&table) {
            self.process_child_group(node_id, Some(&table), tg_op, &events)
                .await
        } else {
            // not part of this tree
            return Ok(false);
        };

        match result {
            Ok(()) => Ok(false),
            Err(e) if e.kind() == ErrorKind::IndexerFatal => {
                error!(
                    "fatal indexer failure, quarantining {} {} events on {}: {e}",
                    events.len(),
                    tg_op,
                    table
                );
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Events on the pivot table itself.
    async fn process_root_group(
        &mut self,
        tg_op: TgOp,
        events: &[ChangeEvent],
    ) -> Result<(), SyncError> {
        let root = self.tree.root();
        let primary_keys = root.primary_keys.clone();

        match tg_op {
            TgOp::Truncate => {
                self.set_state(EngineState::Indexing);
                self.indexer.delete_by_query_all(&self.index).await?;
                Ok(())
            }
            TgOp::Delete => {
                let actions = root_delete_actions(events, &primary_keys);
                self.set_state(EngineState::Indexing);
                self.bulk_with_retry(actions).await?;
                Ok(())
            }
            TgOp::Insert | TgOp::Update => {
                let (keys, stale_deletes) = root_upsert_plan(tg_op, events, &primary_keys);
                if !stale_deletes.is_empty() {
                    self.set_state(EngineState::Indexing);
                    self.bulk_with_retry(stale_deletes).await?;
                }
                self.sync_keys(keys).await
            }
        }
    }

    /// Events on a non-root node table, or on a through table when
    /// `through` is set.
    async fn process_child_group(
        &mut self,
        node_id: NodeId,
        through: Option<&TableRef>,
        tg_op: TgOp,
        events: &[ChangeEvent],
    ) -> Result<(), SyncError> {
        if tg_op == TgOp::Truncate {
            // the truncated rows are gone; refresh every document so their
            // nested content empties out
            let indexed = self.full_sync(None, None).await?;
            debug!("refreshed {indexed} documents after truncate");
            return Ok(());
        }

        let plan = self.tree.join_plan(node_id);
        let filter_step = match through {
            Some(table) => plan
                .iter()
                .position(|step| &step.child == table)
                .ok_or_else(|| SyncError::UnknownTable(table.to_string()))?,
            None => plan.len() - 1,
        };
        let filter_columns = plan[filter_step].child_columns.clone();

        let mut values = BTreeSet::new();
        for event in events {
            for source in [&event.old, &event.new] {
                if let Some(value) = ChangeEvent::key_values(source, &filter_columns) {
                    values.insert(value);
                }
            }
        }
        if values.is_empty() {
            return Ok(());
        }

        self.set_state(EngineState::Querying);
        let builder = QueryBuilder::new(&self.tree);
        let mut keys = BTreeSet::new();
        let value_list: Vec<Vec<String>> = values.into_iter().collect();
        for chunk in value_list.chunks(self.settings.filter_chunk_size) {
            let query = builder.root_keys_query(node_id, filter_step, chunk);
            for key in fetch_keys(&self.client, &query).await? {
                keys.insert(key);
            }
        }
        self.sync_keys(keys).await
    }

    /// Pointed sync: re-synthesize the documents for the given pivot keys
    /// and upsert them, chunking the key filter.
    async fn sync_keys(&mut self, keys: BTreeSet<DocumentKey>) -> Result<(), SyncError> {
        if keys.is_empty() {
            return Ok(());
        }
        let builder = QueryBuilder::new(&self.tree);
        let pk_count = self.tree.root().primary_keys.len();
        let key_list: Vec<DocumentKey> = keys.into_iter().collect();

        for chunk in key_list.chunks(self.settings.filter_chunk_size) {
            self.set_state(EngineState::Querying);
            let query = builder.document_query(&Filter::Keys(chunk.to_vec()));
            let mut stream = fetch_documents(&self.client, &query, pk_count).await?;
            let mut actions = Vec::new();
            while let Some((key, doc)) = stream.try_next().await? {
                if let Some(action) = self.doc_action(&key, doc) {
                    actions.push(action);
                }
            }
            drop(stream);
            self.set_state(EngineState::Indexing);
            let indexed = self.bulk_with_retry(actions).await?;
            self.count(0, indexed as u64);
        }
        Ok(())
    }

    /// Transform one synthesized document into its upsert action. Data
    /// errors are reported and skip the document; the checkpoint still
    /// advances past the offending event.
    fn doc_action(&self, key: &DocumentKey, mut doc: serde_json::Value) -> Option<DocAction> {
        match transform::apply(&self.tree, &mut doc) {
            Ok(()) => Some(DocAction::upsert(key, doc)),
            Err(e) => {
                error!(
                    "skipping document {} on {}: {e}",
                    crate::query::doc_id(key),
                    self.index
                );
                None
            }
        }
    }

    /// Submit a batch, retrying retryable failures with exponential backoff
    /// bounded by `ELASTICSEARCH_MAX_BACKOFF`. Fatal failures propagate to
    /// the caller for quarantine.
    async fn bulk_with_retry(&self, actions: Vec<DocAction>) -> Result<usize, SyncError> {
        if actions.is_empty() {
            return Ok(0);
        }
        let mut backoff = self.settings.elasticsearch_initial_backoff;
        loop {
            match self.indexer.bulk(&self.index, actions.clone()).await {
                Ok(acked) => return Ok(acked),
                Err(e) if e.kind() == ErrorKind::IndexerRetryable => {
                    warn!("bulk submit failed, retrying in {backoff:?}: {e}");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.settings.elasticsearch_max_backoff);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Split a drained batch into runs of consecutive events sharing the same
/// operation and table, preserving order.
fn consecutive_groups(events: Vec<ChangeEvent>) -> Vec<Vec<ChangeEvent>> {
    let mut groups: Vec<Vec<ChangeEvent>> = Vec::new();
    for event in events {
        match groups.last_mut() {
            Some(group)
                if group[0].tg_op == event.tg_op && group[0].table == event.table =>
            {
                group.push(event);
            }
            _ => groups.push(vec![event]),
        }
    }
    groups
}

/// Delete actions for a run of pivot DELETE events.
fn root_delete_actions(events: &[ChangeEvent], primary_keys: &[String]) -> Vec<DocAction> {
    events
        .iter()
        .filter_map(|event| ChangeEvent::key_values(&event.old, primary_keys))
        .map(|key| DocAction::delete(&key))
        .collect()
}

/// Keys to re-synthesize for a run of pivot INSERT/UPDATE events, plus
/// deletes for documents orphaned by a primary key change.
fn root_upsert_plan(
    tg_op: TgOp,
    events: &[ChangeEvent],
    primary_keys: &[String],
) -> (BTreeSet<DocumentKey>, Vec<DocAction>) {
    let mut keys = BTreeSet::new();
    let mut stale_deletes = Vec::new();
    for event in events {
        let new_key = ChangeEvent::key_values(&event.new, primary_keys);
        if let Some(key) = &new_key {
            keys.insert(key.clone());
        }
        // a primary key update leaves the old document behind
        if tg_op == TgOp::Update {
            if let Some(old_key) = ChangeEvent::key_values(&event.old, primary_keys) {
                if new_key.as_ref() != Some(&old_key) {
                    stale_deletes.push(DocAction::delete(&old_key));
                }
            }
        }
    }
    (keys, stale_deletes)
}

/// Full backfill over the pivot's physical pages with `nprocs` workers
/// pulling page-range work units from a shared queue. Each worker writes its
/// own ctid checkpoint file and upserts are idempotent, so reruns converge.
pub async fn parallel_sync(
    conn_str: &str,
    database: &str,
    index: &str,
    tree: Arc<Tree>,
    settings: Settings,
    indexer: Arc<dyn BulkIndexer>,
    nprocs: usize,
) -> Result<u64, SyncError> {
    let client = connect::connect(conn_str).await?;
    let root_table = tree.root().table.clone();

    let row = client
        .query_one(
            "SELECT relpages::bigint, GREATEST(reltuples, 0)::bigint \
             FROM pg_class WHERE oid = CAST(CAST($1 AS text) AS regclass)",
            &[&root_table.quoted()],
        )
        .await
        .map_err(SyncError::DatabaseConnectionLost)?;
    let relpages: i64 = row.get(0);
    let reltuples: i64 = row.get(1);

    let total_pages = relpages.max(0) as u64 + 1;
    let rows_per_page = ((reltuples.max(1) as u64) / total_pages).max(1);
    let pages_per_unit = (settings.block_size / rows_per_page).max(1);

    let mut units = std::collections::VecDeque::new();
    let mut page = 0u64;
    while page < total_pages {
        let end = (page + pages_per_unit).min(total_pages);
        units.push_back((page, end));
        page = end;
    }
    info!(
        "parallel sync of {database}:{index}: {total_pages} pages in {} units across {nprocs} workers",
        units.len()
    );

    let units = Arc::new(StdMutex::new(units));
    let name = crate::checkpoint::sync_name(database, index);
    let mut workers = Vec::new();

    for worker_id in 0..nprocs.max(1) {
        let units = Arc::clone(&units);
        let tree = Arc::clone(&tree);
        let indexer = Arc::clone(&indexer);
        let settings = settings.clone();
        let conn_str = conn_str.to_string();
        let index = index.to_string();
        let checkpoint =
            CtidCheckpointFile::new(&settings.checkpoint_path, &name, worker_id);

        workers.push(tokio::spawn(async move {
            let client = connect::connect(&conn_str).await?;
            let builder = QueryBuilder::new(&tree);
            let pk_count = tree.root().primary_keys.len();
            let mut indexed = 0u64;

            loop {
                let unit = {
                    let mut queue = units.lock().expect("unit queue lock");
                    queue.pop_front()
                };
                let (start_page, end_page) = match unit {
                    Some(unit) => unit,
                    None => break,
                };

                let query = builder.document_query(&Filter::CtidRange {
                    start_page,
                    end_page,
                });
                let mut stream = fetch_documents(&client, &query, pk_count).await?;
                let mut actions = Vec::new();
                while let Some((key, mut doc)) = stream.try_next().await? {
                    match transform::apply(&tree, &mut doc) {
                        Ok(()) => actions.push(DocAction::upsert(&key, doc)),
                        Err(e) => error!("skipping document {}: {e}", crate::query::doc_id(&key)),
                    }
                }
                for chunk in actions.chunks(settings.elasticsearch_chunk_size) {
                    indexed += indexer.bulk(&index, chunk.to_vec()).await? as u64;
                }
                checkpoint.save(end_page)?;
            }
            Ok::<u64, SyncError>(indexed)
        }));
    }

    let mut total = 0u64;
    for worker in workers {
        total += worker.await.map_err(|e| {
            SyncError::Io(std::io::Error::other(format!("backfill worker panicked: {e}")))
        })??;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::change_event;
    use serde_json::json;

    #[test]
    fn test_consecutive_groups_split_on_op_and_table() {
        let events = vec![
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("1"))], Some(1)),
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("2"))], Some(2)),
            change_event(TgOp::Delete, "book", &[("isbn", json!("2"))], &[], Some(3)),
            change_event(TgOp::Insert, "author", &[], &[("id", json!(1))], Some(4)),
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("3"))], Some(5)),
        ];
        let groups = consecutive_groups(events);
        assert_eq!(groups.len(), 4);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1][0].tg_op, TgOp::Delete);
        assert_eq!(groups[2][0].table, "author");
        assert_eq!(groups[3][0].table, "book");
    }

    #[test]
    fn test_root_delete_actions() {
        let primary_keys = vec!["isbn".to_string()];
        let events = vec![
            change_event(
                TgOp::Delete,
                "book",
                &[("isbn", json!("9781471331435"))],
                &[],
                Some(10),
            ),
            // a delete without key columns resolves to nothing
            change_event(TgOp::Delete, "book", &[], &[], Some(11)),
        ];
        let actions = root_delete_actions(&events, &primary_keys);
        assert_eq!(
            actions,
            vec![DocAction::Delete {
                id: "9781471331435".to_string()
            }]
        );
    }

    #[test]
    fn test_root_upsert_plan_collects_keys() {
        let primary_keys = vec!["isbn".to_string()];
        let events = vec![
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("1"))], Some(1)),
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("2"))], Some(2)),
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("1"))], Some(3)),
        ];
        let (keys, stale) = root_upsert_plan(TgOp::Insert, &events, &primary_keys);
        assert_eq!(keys.len(), 2);
        assert!(stale.is_empty());
    }

    #[test]
    fn test_root_upsert_plan_deletes_old_doc_on_pk_change() {
        let primary_keys = vec!["isbn".to_string()];
        let events = vec![change_event(
            TgOp::Update,
            "book",
            &[("isbn", json!("old-isbn"))],
            &[("isbn", json!("new-isbn"))],
            Some(5),
        )];
        let (keys, stale) = root_upsert_plan(TgOp::Update, &events, &primary_keys);
        assert!(keys.contains(&vec!["new-isbn".to_string()]));
        assert_eq!(
            stale,
            vec![DocAction::Delete {
                id: "old-isbn".to_string()
            }]
        );
    }

    #[test]
    fn test_root_upsert_plan_keeps_doc_when_pk_unchanged() {
        let primary_keys = vec!["isbn".to_string()];
        let events = vec![change_event(
            TgOp::Update,
            "book",
            &[("isbn", json!("same"))],
            &[("isbn", json!("same"))],
            Some(5),
        )];
        let (keys, stale) = root_upsert_plan(TgOp::Update, &events, &primary_keys);
        assert_eq!(keys.len(), 1);
        assert!(stale.is_empty());
    }

    #[test]
    fn test_engine_states() {
        assert_ne!(EngineState::Idle, EngineState::Indexing);
        assert_eq!(EngineState::Draining, EngineState::Draining);
    }
}
