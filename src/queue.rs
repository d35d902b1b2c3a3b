//! The event queue.
//!
//! Change capture appends events; the engine is the sole consumer. The
//! production implementation is a broker-backed list so events survive an
//! engine restart; tests run against the in-memory implementation.

use std::collections::VecDeque;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::event::ChangeEvent;

#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append events in order.
    async fn push(&self, events: &[ChangeEvent]) -> Result<(), SyncError>;
    /// Pop up to `max` events from the head.
    async fn pop(&self, max: usize) -> Result<Vec<ChangeEvent>, SyncError>;
    async fn len(&self) -> Result<usize, SyncError>;
    /// Drop all queued events.
    async fn clear(&self) -> Result<(), SyncError>;
}

/// Redis-backed queue under `queue:<name>`.
pub struct RedisQueue {
    conn: redis::aio::MultiplexedConnection,
    key: String,
}

impl RedisQueue {
    pub async fn connect(url: &str, name: &str) -> Result<Self, SyncError> {
        let client =
            redis::Client::open(url).map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        Ok(RedisQueue {
            conn,
            key: format!("queue:{name}"),
        })
    }

    pub fn from_connection(conn: redis::aio::MultiplexedConnection, name: &str) -> Self {
        RedisQueue {
            conn,
            key: format!("queue:{name}"),
        }
    }
}

#[async_trait]
impl EventQueue for RedisQueue {
    async fn push(&self, events: &[ChangeEvent]) -> Result<(), SyncError> {
        if events.is_empty() {
            return Ok(());
        }
        let mut serialized = Vec::with_capacity(events.len());
        for event in events {
            serialized.push(serde_json::to_string(event)?);
        }
        let mut conn = self.conn.clone();
        conn.rpush::<_, _, ()>(&self.key, serialized)
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn pop(&self, max: usize) -> Result<Vec<ChangeEvent>, SyncError> {
        let count = match NonZeroUsize::new(max) {
            Some(count) => count,
            None => return Ok(Vec::new()),
        };
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lpop(&self.key, Some(count))
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        let mut events = Vec::with_capacity(raw.len());
        for item in raw {
            events.push(serde_json::from_str(&item)?);
        }
        Ok(events)
    }

    async fn len(&self) -> Result<usize, SyncError> {
        let mut conn = self.conn.clone();
        conn.llen(&self.key)
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))
    }

    async fn clear(&self) -> Result<(), SyncError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(&self.key)
            .await
            .map_err(|e| SyncError::BrokerUnavailable(e.to_string()))?;
        Ok(())
    }
}

/// In-memory queue for tests and single-process runs.
#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<VecDeque<ChangeEvent>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        MemoryQueue::default()
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn push(&self, events: &[ChangeEvent]) -> Result<(), SyncError> {
        let mut inner = self.inner.lock().await;
        inner.extend(events.iter().cloned());
        Ok(())
    }

    async fn pop(&self, max: usize) -> Result<Vec<ChangeEvent>, SyncError> {
        let mut inner = self.inner.lock().await;
        let take = max.min(inner.len());
        Ok(inner.drain(..take).collect())
    }

    async fn len(&self) -> Result<usize, SyncError> {
        Ok(self.inner.lock().await.len())
    }

    async fn clear(&self) -> Result<(), SyncError> {
        self.inner.lock().await.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TgOp;
    use serde_json::Map;

    fn event(table: &str, xmin: u64) -> ChangeEvent {
        ChangeEvent {
            tg_op: TgOp::Insert,
            schema: "public".to_string(),
            table: table.to_string(),
            old: Map::new(),
            new: Map::new(),
            xmin: Some(xmin),
            indices: vec![],
        }
    }

    #[tokio::test]
    async fn test_memory_queue_fifo() {
        let queue = MemoryQueue::new();
        queue
            .push(&[event("book", 1), event("author", 2), event("book", 3)])
            .await
            .unwrap();
        assert_eq!(queue.len().await.unwrap(), 3);

        let popped = queue.pop(2).await.unwrap();
        assert_eq!(popped.len(), 2);
        assert_eq!(popped[0].xmin, Some(1));
        assert_eq!(popped[1].xmin, Some(2));

        let rest = queue.pop(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].xmin, Some(3));
        assert!(queue.pop(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_queue_clear() {
        let queue = MemoryQueue::new();
        queue.push(&[event("book", 1)]).await.unwrap();
        queue.clear().await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pop_zero_is_empty() {
        let queue = MemoryQueue::new();
        queue.push(&[event("book", 1)]).await.unwrap();
        assert!(queue.pop(0).await.unwrap().is_empty());
        assert_eq!(queue.len().await.unwrap(), 1);
    }
}
