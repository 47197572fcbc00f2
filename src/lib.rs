//! # Typewriter - type-safe persistence over heterogeneous engines
//!
//! One query/update API for SQL dialects (H2, SQLite, MariaDB, PostgreSQL,
//! DuckDB) and MongoDB-style document stores.
//!
//! Typewriter provides:
//! - Per-dialect type tables and statement builders
//! - Typed property specifiers and predicate constraints
//! - A query executor per (entity type, backend) with lazy cursors and aggregates
//! - A lifecycle coordinator with debounced saves and an opt-in error hook

pub mod value;
pub mod model;
pub mod specifier;
pub mod dialect;
pub mod constraint;
pub mod expression;
pub mod query;
pub mod backend;
pub mod executor;
pub mod scheduler;
pub mod backended;
pub mod config;

// Re-exports for convenient access
pub use value::{Field, ScalarKind, Value};
pub use model::{Entity, Model, Property};
pub use specifier::{PropertyRef, Specifier};
pub use dialect::Dialect;
pub use constraint::{Constraint, Filter, Fragment, Op};
pub use expression::Expression;
pub use query::{AvgOption, Direction, Query};
pub use executor::{Cursor, ExecutorStats, QueryExecutor, release};
pub use backended::{Backended, ErrorHook, Lifecycle, NoopHook, Operation};
pub use config::{BackendConfig, TypewriterConfig};

/// Result type alias for Typewriter operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Typewriter operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{dialect} does not support {feature}")]
    CapabilityUnsupported { dialect: Dialect, feature: String },

    #[error("Malformed configuration: {0}")]
    MalformedConfiguration(String),

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Backend already released: {0}")]
    ClosedBackend(String),

    #[error("Unknown property `{property}` on {model}")]
    UnknownProperty { model: String, property: String },

    #[error("Entity has no identity; persist it first")]
    MissingIdentity,

    #[error("Cannot decode {found} as {expected}")]
    Decode { expected: ScalarKind, found: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn unsupported(dialect: Dialect, feature: impl Into<String>) -> Self {
        Error::CapabilityUnsupported { dialect, feature: feature.into() }
    }

    /// True for failures raised by the underlying engine while connecting or executing
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Backend(_) | Error::Io(_))
    }
}
