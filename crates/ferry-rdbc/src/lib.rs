//! # ferry-rdbc
//!
//! Relational sink for the ferry replicator.
//!
//! The replicator never talks SQL directly. It builds [`TableSchema`]s and
//! [`TableRow`]s and hands them to a [`TableEmitter`], which decides how they
//! are persisted.
//!
//! ## Features
//!
//! - **Typed Values**: a small set of semantic column types with lossless coercion
//! - **Schema Model**: ordered columns, primary key, indexes, distribution column
//! - **SQL Dialect**: PostgreSQL statement generation using sea-query
//! - **Bulk Loads**: `COPY ... FROM STDIN` text encoding
//! - **Emitters**: PostgreSQL/Citus, SQL script on stdout, in-memory
//!
//! ## Emitters
//!
//! ```text
//! ┌──────────────┐      ┌─────────────────┐
//! │  TableRow    │─────▶│  TableEmitter   │
//! │  TableSchema │      └────────┬────────┘
//! └──────────────┘               │
//!            ┌───────────────────┼───────────────────┐
//!            ▼                   ▼                   ▼
//!   ┌────────────────┐  ┌────────────────┐  ┌────────────────┐
//!   │ PgTableEmitter │  │ StdoutEmitter  │  │ MemoryEmitter  │
//!   │ tokio-postgres │  │  psql script   │  │ tests/dry runs │
//!   └────────────────┘  └────────────────┘  └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use ferry_rdbc::prelude::*;
//! use std::sync::Arc;
//!
//! let emitter = PgTableEmitter::connect(&ConnectionConfig::new("postgres://localhost/db")).await?;
//!
//! let schema = Arc::new(
//!     TableSchema::new("public", "orders")
//!         .with_column(TableColumn::new("id", ColumnType::Text))
//!         .with_column(TableColumn::new("total", ColumnType::Float))
//!         .with_primary_key(["id"]),
//! );
//! emitter.create_table(&schema).await?;
//! ```
//!
//! ## Feature Flags
//!
//! - `postgres` - PostgreSQL support via tokio-postgres (default)

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod copy;
pub mod dialect;
pub mod emitter;
pub mod error;
pub mod memory;
pub mod schema;
pub mod security;
pub mod stdout;
pub mod types;

#[cfg(feature = "postgres")]
pub mod connection;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{Error, ErrorCategory, Result};

    pub use crate::types::{ColumnType, Numeric, Value};

    pub use crate::schema::{PrimaryKeyValue, TableColumn, TableIndex, TableRow, TableSchema};

    pub use crate::dialect::{PostgresDialect, SqlDialect};

    pub use crate::emitter::{BoxedEmitter, TableEmitter};
    pub use crate::memory::{JournalEntry, MemoryDatabase, MemoryEmitter, Operation};
    pub use crate::stdout::StdoutEmitter;

    #[cfg(feature = "postgres")]
    pub use crate::connection::ConnectionConfig;
    #[cfg(feature = "postgres")]
    pub use crate::postgres::PgTableEmitter;
}

pub use emitter::TableEmitter;
pub use error::{Error, Result};
pub use schema::{PrimaryKeyValue, TableColumn, TableRow, TableSchema};
pub use types::{ColumnType, Numeric, Value};
