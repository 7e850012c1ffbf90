//! Error types for the call ledger.

/// Top-level error type.
///
/// Batch operations never return `PartialItem` to their caller; they count it
/// in their report and keep going. `TransientStore` aborts the current run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid call event: {0}")]
    Validation(#[from] ValidationError),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Concurrent write conflict: {0}")]
    Conflict(String),

    #[error("Store unavailable: {0}")]
    TransientStore(DatabaseError),

    /// Store answered, but the request or the stored data was bad.
    #[error("Store error: {0}")]
    Store(DatabaseError),

    #[error("Item {id} failed: {reason}")]
    PartialItem { id: String, reason: String },
}

impl Error {
    /// Process exit code for the CLI.
    ///
    /// 75 is `EX_TEMPFAIL`, so an external scheduler can tell "retry later"
    /// apart from a bad invocation.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Validation(_) => 2,
            Self::NotFound { .. } => 3,
            Self::TransientStore(_) => 75,
            Self::Conflict(_) | Self::Store(_) | Self::PartialItem { .. } => 1,
        }
    }

    /// Whether the current run must stop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TransientStore(_) | Self::Config(_))
    }
}

impl From<DatabaseError> for Error {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::NotFound { entity, id } => Self::NotFound { entity, id },
            DatabaseError::Constraint(msg) => Self::Conflict(msg),
            other if other.is_transient() => Self::TransientStore(other),
            other => Self::Store(other),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    /// Connectivity-class failure: the store itself is unusable, not just one row.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Pool(_) => true,
            Self::Query(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("database is locked")
                    || msg.contains("busy")
                    || msg.contains("unable to open")
                    || msg.contains("disk i/o")
            }
            _ => false,
        }
    }
}

/// Malformed raw call event. Raised before anything touches the store.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("leg {0} names itself as its parent")]
    SelfParent(String),

    #[error("negative duration {0}")]
    NegativeDuration(i64),
}

/// Result type alias for the ledger.
pub type Result<T> = std::result::Result<T, Error>;
