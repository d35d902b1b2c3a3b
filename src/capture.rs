//! Change capture.
//!
//! Two producers feed the event queue. The notification listener blocks on
//! the database's notification channel and appends trigger payloads. The
//! replication reader polls the logical slot: it peeks wal2json pages,
//! normalizes them into change events, enqueues them, and consumes the slot
//! only after the engine reports the corresponding transactions indexed, so
//! a crash between enqueue and indexing redelivers rather than loses.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{stream, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_postgres::error::SqlState;
use tokio_postgres::{AsyncMessage, Client, NoTls};
use tracing::{debug, error, info, warn};

use crate::error::SyncError;
use crate::event::ChangeEvent;
use crate::queue::EventQueue;
use crate::reflect::TableRef;

/// Transient failures tolerated before a capture worker escalates.
const MAX_CONSECUTIVE_FAILURES: usize = 5;

/// Consumer of the trigger path: LISTEN on the channel named after the
/// database, filter payloads for this sync, append to the queue in batches.
pub struct NotificationListener {
    /// Channel name; the trigger function notifies on CURRENT_DATABASE().
    channel: String,
    index: String,
    schemas: BTreeSet<String>,
    queue: Arc<dyn EventQueue>,
    write_chunk_size: usize,
    flush_interval: Duration,
}

impl NotificationListener {
    pub fn new(
        database: &str,
        index: &str,
        schemas: BTreeSet<String>,
        queue: Arc<dyn EventQueue>,
        write_chunk_size: usize,
        flush_interval: Duration,
    ) -> Self {
        NotificationListener {
            channel: database.to_string(),
            index: index.to_string(),
            schemas,
            queue,
            write_chunk_size,
            flush_interval,
        }
    }

    /// Block on the notification channel until shutdown. The listener holds
    /// its own connection; no timeout applies to the channel receive.
    pub async fn run(
        &self,
        uri: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), SyncError> {
        let (client, mut connection) = tokio_postgres::connect(uri, NoTls)
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let driver = tokio::spawn(async move {
            let mut messages = stream::poll_fn(move |cx| connection.poll_message(cx));
            while let Some(message) = messages.next().await {
                match message {
                    Ok(AsyncMessage::Notification(notification)) => {
                        if tx.send(notification).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("notification connection error: {e}");
                        break;
                    }
                }
            }
        });

        client
            .batch_execute(&format!("LISTEN \"{}\"", self.channel))
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;
        info!("listening for notifications on channel \"{}\"", self.channel);

        let mut buffer: Vec<ChangeEvent> = Vec::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.flush(&mut buffer).await?;
                    break;
                }
                notification = rx.recv() => {
                    match notification {
                        Some(notification) => {
                            if notification.channel() != self.channel {
                                continue;
                            }
                            match ChangeEvent::from_notification(notification.payload()) {
                                Ok(event) if self.wanted(&event) => {
                                    debug!("queued payload: {} {}.{}", event.tg_op, event.schema, event.table);
                                    buffer.push(event);
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    warn!("invalid JSON in notification, skipping: {e}");
                                }
                            }
                            if buffer.len() >= self.write_chunk_size {
                                self.flush(&mut buffer).await?;
                            }
                        }
                        None => {
                            self.flush(&mut buffer).await?;
                            driver.abort();
                            return Err(std::io::Error::new(
                                std::io::ErrorKind::ConnectionAborted,
                                "notification stream ended",
                            )
                            .into());
                        }
                    }
                }
                _ = tokio::time::sleep(self.flush_interval) => {
                    self.flush(&mut buffer).await?;
                }
            }
        }

        driver.abort();
        Ok(())
    }

    fn wanted(&self, event: &ChangeEvent) -> bool {
        event.indices.iter().any(|index| index == &self.index)
            && self.schemas.contains(&event.schema)
    }

    /// Push the buffer to the queue. Broker outages stall the listener
    /// rather than dropping events.
    async fn flush(&self, buffer: &mut Vec<ChangeEvent>) -> Result<(), SyncError> {
        if buffer.is_empty() {
            return Ok(());
        }
        loop {
            match self.queue.push(buffer).await {
                Ok(()) => {
                    buffer.clear();
                    return Ok(());
                }
                Err(SyncError::BrokerUnavailable(reason)) => {
                    warn!("broker unavailable, holding {} events: {reason}", buffer.len());
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Consumer of the replication path. Exclusive owner of the slot for the
/// lifetime of the sync.
pub struct ReplicationReader {
    slot: String,
    tables: BTreeSet<TableRef>,
    chunk_size: i64,
    poll_interval: Duration,
    /// Highest transaction id already enqueued.
    watermark: u64,
}

/// One page peeked from the slot.
pub struct SlotPage {
    pub events: Vec<ChangeEvent>,
    /// Raw slot rows the page spans, including frames that normalized away.
    pub raw_rows: usize,
    /// Highest transaction id among the kept events; 0 when the page held
    /// nothing for this tree.
    pub max_xid: u64,
}

impl ReplicationReader {
    pub fn new(
        slot: &str,
        tables: BTreeSet<TableRef>,
        chunk_size: i64,
        poll_interval: Duration,
        start_from: u64,
    ) -> Self {
        ReplicationReader {
            slot: slot.to_string(),
            tables,
            chunk_size,
            poll_interval,
            watermark: start_from,
        }
    }

    pub async fn slot_exists(client: &Client, slot: &str) -> Result<bool, SyncError> {
        let rows = client
            .query(
                "SELECT 1 FROM pg_replication_slots WHERE slot_name = $1",
                &[&slot],
            )
            .await
            .map_err(SyncError::DatabaseConnectionLost)?;
        Ok(!rows.is_empty())
    }

    /// Peek one page of WAL records without consuming them.
    pub async fn peek(
        &self,
        client: &Client,
        txmin: Option<u64>,
        txmax: Option<u64>,
    ) -> Result<SlotPage, SyncError> {
        let rows = client
            .query(
                "SELECT data FROM PG_LOGICAL_SLOT_PEEK_CHANGES($1, NULL, $2, \
                 'format-version', '2', 'include-xids', 'true', 'include-pk', 'true')",
                &[&self.slot, &(self.chunk_size as i32)],
            )
            .await
            .map_err(|e| self.classify(e))?;

        let raw_rows = rows.len();
        let mut events = Vec::new();
        let mut max_xid = 0u64;
        for row in rows {
            let data: String = row.get(0);
            let record: serde_json::Value = match serde_json::from_str(&data) {
                Ok(record) => record,
                Err(e) => {
                    warn!("failed to parse wal2json data, skipping: {e}");
                    continue;
                }
            };
            let event = match ChangeEvent::from_wal2json(&record)? {
                Some(event) => event,
                None => continue,
            };
            let xid = event.xmin.unwrap_or(0);
            if let Some(txmin) = txmin {
                if xid <= txmin {
                    continue;
                }
            }
            if let Some(txmax) = txmax {
                if xid > txmax {
                    continue;
                }
            }
            let table = TableRef::new(event.schema.clone(), event.table.clone());
            if !self.tables.contains(&table) {
                debug!("skipping change for untracked table {table}");
                continue;
            }
            max_xid = max_xid.max(xid);
            events.push(event);
        }

        Ok(SlotPage {
            events,
            raw_rows,
            max_xid,
        })
    }

    /// Consume the first `rows` records of the slot, advancing it past the
    /// page most recently peeked.
    pub async fn consume(&self, client: &Client, rows: usize) -> Result<(), SyncError> {
        client
            .query(
                "SELECT 1 FROM PG_LOGICAL_SLOT_GET_CHANGES($1, NULL, $2, \
                 'format-version', '2', 'include-xids', 'true', 'include-pk', 'true')",
                &[&self.slot, &(rows as i32)],
            )
            .await
            .map_err(|e| self.classify(e))?;
        Ok(())
    }

    /// Poll the slot until shutdown: peek, enqueue, wait for the engine's
    /// indexed watermark to pass the page, then consume.
    pub async fn run(
        mut self,
        client: Client,
        queue: Arc<dyn EventQueue>,
        mut indexed: watch::Receiver<u64>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), SyncError> {
        let mut failures = 0usize;
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            let page = match self.peek(&client, Some(self.watermark), None).await {
                Ok(page) => {
                    failures = 0;
                    page
                }
                Err(e) if matches!(e, SyncError::DatabaseConnectionLost(_)) => {
                    failures += 1;
                    warn!("replication poll failed ({failures}/{MAX_CONSECUTIVE_FAILURES}): {e}");
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_secs(failures as u64)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if page.raw_rows == 0 {
                continue;
            }
            if !page.events.is_empty() {
                loop {
                    match queue.push(&page.events).await {
                        Ok(()) => break,
                        Err(SyncError::BrokerUnavailable(reason)) => {
                            warn!("broker unavailable, slot page held: {reason}");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        Err(e) => return Err(e),
                    }
                }
                self.watermark = self.watermark.max(page.max_xid);
            }

            // hold slot advancement until the engine has indexed the page
            while page.max_xid > 0 && *indexed.borrow() < page.max_xid {
                tokio::select! {
                    _ = shutdown.recv() => return Ok(()),
                    changed = indexed.changed() => {
                        if changed.is_err() {
                            return Ok(());
                        }
                    }
                }
            }
            self.consume(&client, page.raw_rows).await?;
        }
        Ok(())
    }

    fn classify(&self, e: tokio_postgres::Error) -> SyncError {
        match e.code() {
            Some(&SqlState::UNDEFINED_OBJECT) | Some(&SqlState::UNDEFINED_FUNCTION) => {
                SyncError::ReplicationSlotGone(self.slot.clone())
            }
            Some(&SqlState::OBJECT_IN_USE) => SyncError::SlotInUse(self.slot.clone()),
            _ => SyncError::DatabaseConnectionLost(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TgOp;
    use crate::queue::MemoryQueue;
    use crate::testing::change_event;
    use serde_json::json;

    fn listener(queue: Arc<dyn EventQueue>) -> NotificationListener {
        NotificationListener::new(
            "bookstore",
            "bookstore",
            ["public".to_string()].into_iter().collect(),
            queue,
            1000,
            Duration::from_millis(100),
        )
    }

    #[test]
    fn test_listener_filters_by_index_and_schema() {
        let queue: Arc<dyn EventQueue> = Arc::new(MemoryQueue::new());
        let listener = listener(queue);

        let mut event = change_event(TgOp::Insert, "book", &[], &[("isbn", json!("1"))], Some(1));
        event.indices = vec!["bookstore".to_string()];
        assert!(listener.wanted(&event));

        let mut other_index = event.clone();
        other_index.indices = vec!["other".to_string()];
        assert!(!listener.wanted(&other_index));

        let mut other_schema = event.clone();
        other_schema.schema = "audit".to_string();
        assert!(!listener.wanted(&other_schema));
    }

    #[tokio::test]
    async fn test_listener_flush_batches() {
        let queue = Arc::new(MemoryQueue::new());
        let listener = listener(queue.clone());
        let mut buffer = vec![
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("1"))], Some(1)),
            change_event(TgOp::Insert, "book", &[], &[("isbn", json!("2"))], Some(2)),
        ];
        listener.flush(&mut buffer).await.unwrap();
        assert!(buffer.is_empty());
        assert_eq!(queue.len().await.unwrap(), 2);
    }
}
