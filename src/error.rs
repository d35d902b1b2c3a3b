//! Error types for search-sync.
//!
//! One enum carries the whole taxonomy; [`SyncError::kind`] collapses it into
//! the classes the engine's retry policy and the CLI exit-code mapping care
//! about.

use thiserror::Error;

/// Error type for all sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    // Configuration errors. Surfaced at bootstrap/start, always fatal.
    /// The schema document is malformed or carries unknown keys.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A node references a table not present in the database.
    #[error("table {0} not found in database")]
    UnknownTable(String),

    /// A node selects a column the table does not have.
    #[error("column \"{column}\" not present on table {table}")]
    UnknownColumn { table: String, column: String },

    /// A node references a schema not present in the database.
    #[error("unknown schema name: {0}")]
    UnknownSchema(String),

    /// A non-root node lacks relationship type or variant.
    #[error("relationship not present on {0}")]
    MissingRelationship(String),

    /// More than one foreign key connects two tables and no explicit
    /// `foreign_key` was given.
    #[error("ambiguous foreign key between {parent} and {child}; specify relationship.foreign_key")]
    AmbiguousForeignKey { parent: String, child: String },

    /// No foreign key path connects a parent and child node.
    #[error("no foreign key relationship between {parent} and {child}")]
    UnreachableNode { parent: String, child: String },

    /// A through-table chain loops back onto itself.
    #[error("cycle detected in through tables at {0}")]
    CycleDetected(String),

    // Privilege errors.
    /// The connecting role is neither a superuser nor a replication role.
    #[error("role \"{0}\" must be a superuser or replication role")]
    InsufficientPrivilege(String),

    /// The replication slot is held by another consumer.
    #[error("replication slot \"{0}\" is currently in use")]
    SlotInUse(String),

    // Transient source errors. Retried with bounded backoff.
    /// The database connection dropped mid-operation.
    #[error("database connection lost: {0}")]
    DatabaseConnectionLost(#[source] tokio_postgres::Error),

    /// The replication slot no longer exists.
    #[error("replication slot \"{0}\" does not exist; run the bootstrap command")]
    ReplicationSlotGone(String),

    // Indexer errors.
    /// 429/503 or a network failure from the bulk indexer.
    #[error("indexer retryable failure: {0}")]
    IndexerRetryable(String),

    /// Any other 4xx from the bulk indexer.
    #[error("indexer fatal failure: {0}")]
    IndexerFatal(String),

    // Broker errors. Retried indefinitely; the engine stalls.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    // Per-document data errors. Reported, document skipped.
    /// A JSON-path column expression cannot be rendered.
    #[error("unsupported JSON path expression: {0}")]
    UnsupportedJsonPath(String),

    /// A transform rule references a key the document does not carry.
    #[error("transform rule references missing key \"{column}\" under {table}")]
    TransformRuleMissingColumn { table: String, column: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Coarse classification used by the retry policy and the CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Privilege,
    TransientSource,
    IndexerRetryable,
    IndexerFatal,
    Broker,
    Data,
    Other,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::InvalidSchema(_)
            | SyncError::UnknownTable(_)
            | SyncError::UnknownColumn { .. }
            | SyncError::UnknownSchema(_)
            | SyncError::MissingRelationship(_)
            | SyncError::AmbiguousForeignKey { .. }
            | SyncError::UnreachableNode { .. }
            | SyncError::CycleDetected(_) => ErrorKind::Configuration,
            SyncError::InsufficientPrivilege(_) | SyncError::SlotInUse(_) => ErrorKind::Privilege,
            SyncError::DatabaseConnectionLost(_) | SyncError::ReplicationSlotGone(_) => {
                ErrorKind::TransientSource
            }
            SyncError::IndexerRetryable(_) => ErrorKind::IndexerRetryable,
            SyncError::IndexerFatal(_) => ErrorKind::IndexerFatal,
            SyncError::BrokerUnavailable(_) => ErrorKind::Broker,
            SyncError::UnsupportedJsonPath(_) | SyncError::TransformRuleMissingColumn { .. } => {
                ErrorKind::Data
            }
            SyncError::Io(_) | SyncError::Serde(_) => ErrorKind::Other,
        }
    }

    /// Process exit code for this error: 2 for configuration errors,
    /// 3 for privilege errors, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            ErrorKind::Configuration => 2,
            ErrorKind::Privilege => 3,
            _ => 1,
        }
    }
}
