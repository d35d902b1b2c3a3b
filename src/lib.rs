//! search-sync library
//!
//! A change-data-capture middleware that keeps an Elasticsearch/OpenSearch
//! index continuously consistent with PostgreSQL, with PostgreSQL remaining
//! the system of record.
//!
//! # Features
//!
//! - Document trees: a JSON schema declares a tree of tables rooted at a
//!   pivot; one denormalized document per pivot row
//! - Query synthesis: one SQL statement per tree producing pre-aggregated
//!   JSON documents
//! - Change capture: trigger-driven notifications plus logical replication
//!   through a `wal2json` slot, merged into one at-least-once event queue
//! - Durable checkpoints: a monotonic low-water-mark transaction id per
//!   sync, stored on disk or in the broker
//! - Parallel backfill: tuple-id paged full sync across workers
//!
//! # CLI Usage
//!
//! ```bash
//! # Install triggers, helper view and the replication slot
//! search-sync bootstrap --config schema.json
//!
//! # One-shot sync up to the current transaction
//! search-sync sync --config schema.json
//!
//! # Continuous sync
//! search-sync sync --config schema.json --daemon
//!
//! # Parallel full backfill
//! search-sync parallel-sync --config schema.json --nprocs 4
//! ```

pub mod capture;
pub mod checkpoint;
pub mod connect;
pub mod engine;
pub mod error;
pub mod event;
pub mod indexer;
pub mod install;
pub mod query;
pub mod queue;
pub mod reflect;
pub mod schema;
pub mod settings;
pub mod testing;
pub mod transform;
pub mod tree;
pub mod trigger;

pub use capture::{NotificationListener, ReplicationReader};
pub use checkpoint::{sync_name, BrokerStore, Checkpoint, CheckpointStore, FileStore};
pub use connect::PgOpts;
pub use engine::{parallel_sync, EngineState, EngineStatus, SyncEngine};
pub use error::{ErrorKind, SyncError};
pub use event::{ChangeEvent, TgOp};
pub use indexer::{BulkIndexer, DocAction, HttpIndexer};
pub use install::Installer;
pub use query::{doc_id, DocumentKey, Filter, QueryBuilder, PRIMARY_KEY_DELIMITER};
pub use queue::{EventQueue, MemoryQueue, RedisQueue};
pub use reflect::{Reflection, TableRef};
pub use schema::SyncConfig;
pub use settings::Settings;
pub use tree::Tree;
