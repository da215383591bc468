//! SQLite database connection management
//!
//! Opening a [`Database`] is the storage bootstrap: the file is created if
//! needed, runtime settings are applied and the schema is converged before
//! the handle is returned.

use std::fs;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use super::catalog::Catalog;
use super::error::StorageError;
use super::introspect::{describe_table, IntrospectedColumn};
use super::migrations::{MigrationReport, MigrationRunner, TablePlan};

/// Database wrapper for SQLite connection management
pub struct Database {
    conn: Connection,
    report: MigrationReport,
}

impl Database {
    /// Open the database at `path` and converge it to the production catalog
    ///
    /// # Arguments
    /// * `path` - Path to the SQLite database file, created if missing
    ///
    /// # Returns
    /// A ready handle, or an error when the file is unusable
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::open_with_catalog(path, &Catalog::target()?)
    }

    /// Open the database at `path` and converge it to `catalog`
    pub fn open_with_catalog(path: &Path, catalog: &Catalog) -> Result<Self, StorageError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        info!(path = %path.display(), "opening database");
        let conn = Connection::open(path)?;
        let report = MigrationRunner::new(&conn, catalog).run()?;

        Ok(Self { conn, report })
    }

    /// Steps the next open of `path` would apply, computed read-only
    pub fn plan(path: &Path) -> Result<Vec<TablePlan>, StorageError> {
        let catalog = Catalog::target()?;
        let conn = if path.exists() {
            Connection::open_with_flags(
                path,
                OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        } else {
            Connection::open_in_memory()?
        };

        MigrationRunner::new(&conn, &catalog).plan()
    }

    /// Create an in-memory database (for testing)
    #[cfg(test)]
    pub fn new_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let report = MigrationRunner::new(&conn, &Catalog::target()?).run()?;
        Ok(Self { conn, report })
    }

    /// Get a reference to the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Report of the migration run performed by `open`
    pub fn migration_report(&self) -> &MigrationReport {
        &self.report
    }

    /// Live columns of `table`, empty when it does not exist
    pub fn describe(&self, table: &str) -> Result<Vec<IntrospectedColumn>, StorageError> {
        describe_table(&self.conn, table)
    }
}
