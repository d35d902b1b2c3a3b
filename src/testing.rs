//! Test doubles for the external collaborators.
//!
//! The engine is exercised in tests against these fakes instead of live
//! Elasticsearch/Redis instances: the recording indexer keeps the "index"
//! in a map and can inject classified failures.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::error::SyncError;
use crate::event::{ChangeEvent, TgOp};
use crate::indexer::{BulkIndexer, DocAction};

/// An in-memory index that records every action.
#[derive(Default)]
pub struct RecordingIndexer {
    /// Current index state by document id.
    pub docs: Mutex<BTreeMap<String, Value>>,
    /// Every action ever applied, in order.
    pub history: Mutex<Vec<DocAction>>,
    /// Count of delete-by-query calls.
    pub wipes: AtomicUsize,
    /// Inject this many retryable failures before succeeding.
    pub retryable_failures: AtomicUsize,
    /// Inject this many fatal failures before succeeding.
    pub fatal_failures: AtomicUsize,
}

impl RecordingIndexer {
    pub fn new() -> Self {
        RecordingIndexer::default()
    }

    pub fn fail_retryable(&self, times: usize) {
        self.retryable_failures.store(times, Ordering::SeqCst);
    }

    pub fn fail_fatal(&self, times: usize) {
        self.fatal_failures.store(times, Ordering::SeqCst);
    }

    pub async fn doc(&self, id: &str) -> Option<Value> {
        self.docs.lock().await.get(id).cloned()
    }

    pub async fn doc_count(&self) -> usize {
        self.docs.lock().await.len()
    }
}

#[async_trait]
impl BulkIndexer for RecordingIndexer {
    async fn bulk(&self, _index: &str, actions: Vec<DocAction>) -> Result<usize, SyncError> {
        if self
            .fatal_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::IndexerFatal("injected 400".to_string()));
        }
        if self
            .retryable_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::IndexerRetryable("injected 429".to_string()));
        }

        let mut docs = self.docs.lock().await;
        let mut history = self.history.lock().await;
        let count = actions.len();
        for action in actions {
            match &action {
                DocAction::Index { id, source } => {
                    docs.insert(id.clone(), source.clone());
                }
                DocAction::Delete { id } => {
                    docs.remove(id);
                }
            }
            history.push(action);
        }
        Ok(count)
    }

    async fn delete_by_query_all(&self, _index: &str) -> Result<(), SyncError> {
        self.wipes.fetch_add(1, Ordering::SeqCst);
        self.docs.lock().await.clear();
        Ok(())
    }
}

/// Build a change event with key columns, the way the trigger emits them.
pub fn change_event(
    tg_op: TgOp,
    table: &str,
    old: &[(&str, Value)],
    new: &[(&str, Value)],
    xmin: Option<u64>,
) -> ChangeEvent {
    let to_map = |pairs: &[(&str, Value)]| {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<Map<String, Value>>()
    };
    ChangeEvent {
        tg_op,
        schema: "public".to_string(),
        table: table.to_string(),
        old: to_map(old),
        new: to_map(new),
        xmin,
        indices: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_recording_indexer_applies_actions() {
        let indexer = RecordingIndexer::new();
        indexer
            .bulk(
                "idx",
                vec![
                    DocAction::Index {
                        id: "1".to_string(),
                        source: json!({"a": 1}),
                    },
                    DocAction::Index {
                        id: "2".to_string(),
                        source: json!({"a": 2}),
                    },
                    DocAction::Delete {
                        id: "1".to_string(),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(indexer.doc_count().await, 1);
        assert_eq!(indexer.doc("2").await, Some(json!({"a": 2})));
    }

    #[tokio::test]
    async fn test_injected_failures_drain() {
        let indexer = RecordingIndexer::new();
        indexer.fail_retryable(1);
        let err = indexer.bulk("idx", vec![]).await.unwrap_err();
        assert!(matches!(err, SyncError::IndexerRetryable(_)));
        assert!(indexer.bulk("idx", vec![]).await.is_ok());
    }
}
