//! Table rebuilds through a shadow table
//!
//! SQLite cannot drop columns with constraints, change a column's type or
//! add table constraints in place. Those changes go through `<name>_new`:
//! create it with the target DDL, copy the rows over, drop the live table
//! and rename the shadow into place. The whole sequence runs in one
//! `BEGIN IMMEDIATE` transaction with foreign key enforcement suspended.

use std::fmt;

use rusqlite::{params, Connection, Transaction, TransactionBehavior};
use tracing::{debug, info, warn};

use super::catalog::{quote_ident, TableSpec};
use super::error::StorageError;
use super::introspect::{row_count, snapshot, table_exists};
use super::reconcile::{reconcile, ColumnMapping};

/// Phase of a table rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildPhase {
    /// Shadow table is being created
    Creating,
    /// Rows are being copied into the shadow
    Copying,
    /// Live table dropped, shadow being renamed into place
    Swapping,
    /// Swap finished; constraints checked and indexes recreated
    Done,
}

impl fmt::Display for RebuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Creating => "creating",
            Self::Copying => "copying",
            Self::Swapping => "swapping",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// Result of a rebuild attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildOutcome {
    Rebuilt { rows: usize },
    /// Another instance converged the table first
    AlreadyCurrent,
}

/// Turns foreign key enforcement off until dropped
///
/// `PRAGMA foreign_keys` is a no-op inside a transaction, so the guard must
/// be taken before `BEGIN` and released after `COMMIT`/`ROLLBACK`.
pub(crate) struct ForeignKeysSuspended<'c> {
    conn: &'c Connection,
    restore: bool,
}

impl<'c> ForeignKeysSuspended<'c> {
    pub(crate) fn new(conn: &'c Connection) -> rusqlite::Result<Self> {
        let enabled: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if enabled {
            conn.execute_batch("PRAGMA foreign_keys = OFF")?;
        }
        Ok(Self {
            conn,
            restore: enabled,
        })
    }
}

impl Drop for ForeignKeysSuspended<'_> {
    fn drop(&mut self) {
        if self.restore {
            if let Err(e) = self.conn.execute_batch("PRAGMA foreign_keys = ON") {
                warn!(error = %e, "failed to re-enable foreign keys");
            }
        }
    }
}

fn enter(table: &str, phase: RebuildPhase) {
    debug!(table, %phase, "rebuild phase");
}

/// Rebuild `spec.name` to the target shape, copying rows per `mapping`
///
/// The live table is re-read after the lock is taken. A table that no
/// longer needs a rebuild is left alone, and a mapping that no longer fits
/// the live columns is recomputed.
pub fn rebuild(
    conn: &Connection,
    spec: &TableSpec,
    mapping: &ColumnMapping,
) -> Result<RebuildOutcome, StorageError> {
    let _fk = ForeignKeysSuspended::new(conn)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    let live = snapshot(&tx, spec.name)?;
    if !reconcile(spec, &live).requires_rebuild() {
        debug!(table = spec.name, "table already current, skipping rebuild");
        return Ok(RebuildOutcome::AlreadyCurrent);
    }

    let mapping = if mapping.is_valid_for(&live.columns) {
        mapping.clone()
    } else {
        debug!(table = spec.name, "column mapping is stale, recomputing");
        ColumnMapping::plan(spec, &live.columns, &[])
    };

    let shadow = spec.shadow_name();

    enter(spec.name, RebuildPhase::Creating);
    tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&shadow)))?;
    tx.execute_batch(&spec.create_sql_named(&shadow))?;

    enter(spec.name, RebuildPhase::Copying);
    let rows = tx.execute(&mapping.copy_sql(spec, spec.name, &shadow, false), [])?;

    enter(spec.name, RebuildPhase::Swapping);
    tx.execute_batch(&format!("DROP TABLE {}", quote_ident(spec.name)))?;
    tx.execute_batch(&format!(
        "ALTER TABLE {} RENAME TO {}",
        quote_ident(&shadow),
        quote_ident(spec.name)
    ))?;

    enter(spec.name, RebuildPhase::Done);
    report_violations(&tx, spec.name)?;
    for index in spec.indexes {
        tx.execute_batch(&index.create_sql(spec.name))?;
    }

    tx.commit()?;
    info!(table = spec.name, rows, "table rebuilt");
    Ok(RebuildOutcome::Rebuilt { rows })
}

/// Copy a superseded table's rows into its successor and drop it
///
/// Rows whose primary key already exists in the successor are skipped.
/// Returns the number of rows copied, or `None` when the table was gone.
pub fn absorb(
    conn: &Connection,
    legacy: &str,
    into: &TableSpec,
    mapping: &ColumnMapping,
) -> Result<Option<usize>, StorageError> {
    let _fk = ForeignKeysSuspended::new(conn)?;
    let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;

    if !table_exists(&tx, legacy)? {
        return Ok(None);
    }

    let source = row_count(&tx, legacy)?;
    let copied = tx.execute(&mapping.copy_sql(into, legacy, into.name, true), [])?;
    if (copied as i64) < source {
        warn!(
            legacy,
            into = into.name,
            skipped = source - copied as i64,
            "rows already present in successor were skipped"
        );
    }

    tx.execute_batch(&format!("DROP TABLE {}", quote_ident(legacy)))?;
    report_violations(&tx, into.name)?;
    tx.commit()?;

    info!(legacy, into = into.name, rows = copied, "legacy table absorbed");
    Ok(Some(copied))
}

/// Log rows of `table` that violate a foreign key
fn report_violations(conn: &Connection, table: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_check({})", quote_ident(table)))?;
    let violations = stmt
        .query_map([], |row| row.get::<_, String>(2))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    if !violations.is_empty() {
        warn!(
            table,
            count = violations.len(),
            parent = %violations[0],
            "rows reference missing parents"
        );
    }
    Ok(())
}

/// Leftover shadow table from a rebuild that never finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptedRebuild {
    /// Live and shadow both exist; the copy was never swapped in
    StaleShadow { table: String, shadow: String },
    /// Only the shadow exists; the live table was dropped before the rename
    UnswappedShadow { table: String, shadow: String },
}

impl InterruptedRebuild {
    /// Look for a leftover `<name>_new` next to `spec.name`
    pub fn detect(conn: &Connection, spec: &TableSpec) -> Result<Option<Self>, StorageError> {
        let shadow = spec.shadow_name();
        if !table_exists(conn, &shadow)? {
            return Ok(None);
        }

        let table = spec.name.to_string();
        Ok(Some(if table_exists(conn, spec.name)? {
            Self::StaleShadow { table, shadow }
        } else {
            Self::UnswappedShadow { table, shadow }
        }))
    }

    /// Phase the rebuild was in when it stopped
    pub fn phase(&self) -> RebuildPhase {
        match self {
            Self::StaleShadow { .. } => RebuildPhase::Copying,
            Self::UnswappedShadow { .. } => RebuildPhase::Swapping,
        }
    }

    /// Finish or discard the rebuild
    ///
    /// A stale shadow may hold a partial copy, so the live table wins. An
    /// unswapped shadow holds the only copy and is renamed into place.
    pub fn resume(&self, conn: &Connection) -> rusqlite::Result<()> {
        match self {
            Self::StaleShadow { table, shadow } => {
                warn!(table = %table, shadow = %shadow, "dropping shadow table of interrupted rebuild");
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(shadow)))
            }
            Self::UnswappedShadow { table, shadow } => {
                warn!(table = %table, shadow = %shadow, "completing swap of interrupted rebuild");
                conn.execute(
                    &format!(
                        "ALTER TABLE {} RENAME TO {}",
                        quote_ident(shadow),
                        quote_ident(table)
                    ),
                    params![],
                )
                .map(|_| ())
            }
        }
    }
}
