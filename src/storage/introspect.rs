//! Live schema introspection
//!
//! Reads table structure straight from SQLite's catalog pragmas. Nothing is
//! cached: every call reflects the file as it is at call time, which is what
//! lets concurrent instances observe each other's changes.

use rusqlite::{params, Connection};
use serde::Serialize;

use super::catalog::OnDelete;
use super::error::StorageError;

/// Column as it currently exists in the database
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntrospectedColumn {
    pub name: String,
    /// Declared type exactly as written in the table's DDL
    pub column_type: String,
    pub not_null: bool,
    /// Default expression as SQL text, `None` when there is none
    pub default_value: Option<String>,
    pub primary_key: bool,
}

/// Foreign key as it currently exists in the database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntrospectedForeignKey {
    pub column: String,
    pub references_table: String,
    /// `None` when the constraint references the parent's primary key implicitly
    pub references_column: Option<String>,
    pub on_delete: Option<OnDelete>,
}

/// Everything the reconciler needs to know about one live table
#[derive(Debug, Clone, Default)]
pub struct TableSnapshot {
    pub columns: Vec<IntrospectedColumn>,
    pub foreign_keys: Vec<IntrospectedForeignKey>,
    pub indexes: Vec<String>,
}

impl TableSnapshot {
    /// A table without columns does not exist
    pub fn exists(&self) -> bool {
        !self.columns.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&IntrospectedColumn> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.indexes.iter().any(|i| i.eq_ignore_ascii_case(name))
    }
}

/// Describe the columns of `table`; empty when the table does not exist
pub fn describe_table(
    conn: &Connection,
    table: &str,
) -> Result<Vec<IntrospectedColumn>, StorageError> {
    let read = || -> rusqlite::Result<Vec<IntrospectedColumn>> {
        let mut stmt = conn.prepare(
            r#"SELECT name, type, "notnull", dflt_value, pk FROM pragma_table_info(?1) ORDER BY cid"#,
        )?;
        let rows = stmt.query_map(params![table], |row| {
            Ok(IntrospectedColumn {
                name: row.get(0)?,
                column_type: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                not_null: row.get(2)?,
                default_value: row.get(3)?,
                primary_key: row.get::<_, i64>(4)? > 0,
            })
        })?;
        rows.collect()
    };

    read().map_err(|e| StorageError::introspection(table, e))
}

/// Foreign keys declared on `table`
pub fn foreign_keys(
    conn: &Connection,
    table: &str,
) -> Result<Vec<IntrospectedForeignKey>, StorageError> {
    let read = || -> rusqlite::Result<Vec<IntrospectedForeignKey>> {
        let mut stmt = conn.prepare(
            r#"SELECT "from", "table", "to", on_delete FROM pragma_foreign_key_list(?1) ORDER BY id, seq"#,
        )?;
        let rows = stmt.query_map(params![table], |row| {
            Ok(IntrospectedForeignKey {
                column: row.get(0)?,
                references_table: row.get(1)?,
                references_column: row.get(2)?,
                on_delete: row
                    .get::<_, Option<String>>(3)?
                    .as_deref()
                    .and_then(OnDelete::parse),
            })
        })?;
        rows.collect()
    };

    read().map_err(|e| StorageError::introspection(table, e))
}

/// Names of the explicitly created indexes on `table`
///
/// Automatic indexes backing `UNIQUE`/`PRIMARY KEY` constraints are skipped.
pub fn index_names(conn: &Connection, table: &str) -> Result<Vec<String>, StorageError> {
    let read = || -> rusqlite::Result<Vec<String>> {
        let mut stmt =
            conn.prepare("SELECT name FROM pragma_index_list(?1) WHERE origin = 'c' ORDER BY name")?;
        let rows = stmt.query_map(params![table], |row| row.get::<_, String>(0))?;
        rows.collect()
    };

    read().map_err(|e| StorageError::introspection(table, e))
}

/// Whether a table (not a view) named `table` exists
pub fn table_exists(conn: &Connection, table: &str) -> Result<bool, StorageError> {
    conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1 COLLATE NOCASE",
        params![table],
        |row| row.get::<_, i64>(0).map(|c| c > 0),
    )
    .map_err(|e| StorageError::introspection(table, e))
}

/// Read columns, foreign keys and indexes of `table` in one go
pub fn snapshot(conn: &Connection, table: &str) -> Result<TableSnapshot, StorageError> {
    let columns = describe_table(conn, table)?;
    if columns.is_empty() {
        return Ok(TableSnapshot::default());
    }

    Ok(TableSnapshot {
        columns,
        foreign_keys: foreign_keys(conn, table)?,
        indexes: index_names(conn, table)?,
    })
}

/// Number of rows in `table`
pub fn row_count(conn: &Connection, table: &str) -> Result<i64, StorageError> {
    conn.query_row(
        &format!("SELECT COUNT(*) FROM {}", super::catalog::quote_ident(table)),
        [],
        |row| row.get(0),
    )
    .map_err(|e| StorageError::introspection(table, e))
}
