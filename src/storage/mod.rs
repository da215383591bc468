//! Local storage module for Questboard
//!
//! Provides the SQLite bootstrap: a compiled-in schema catalog, live schema
//! introspection, reconciliation planning, shadow-table rebuilds, and the
//! runner that applies them on every open.

pub mod catalog;
mod database;
mod error;
pub mod introspect;
mod migrations;
pub mod rebuild;
pub mod reconcile;

pub use catalog::{Catalog, ColumnSpec, TableSpec};
pub use database::Database;
pub use error::{FailureKind, StorageError};
pub use introspect::{IntrospectedColumn, TableSnapshot};
pub use migrations::{
    LegacyOutcome, MigrationReport, MigrationRunner, StepFailure, TableOutcome, TablePlan,
    TableState, BUSY_TIMEOUT,
};
pub use reconcile::{reconcile, MigrationStep, ReconciliationPlan};
