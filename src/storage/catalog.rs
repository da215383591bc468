//! Target schema catalog
//!
//! Compiled-in declaration of what every table should look like. The
//! reconciler diffs live tables against these specs on every boot; nothing
//! here is configurable at runtime.

use std::fmt;

use super::error::StorageError;

/// Suffix of the shadow table used while rebuilding a table
pub const SHADOW_SUFFIX: &str = "_new";

/// Quote an identifier for use in generated SQL
pub(crate) fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Declared SQL type of a target column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Integer,
    Text,
    Real,
    Blob,
    Datetime,
}

impl SqlType {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Real => "REAL",
            Self::Blob => "BLOB",
            Self::Datetime => "DATETIME",
        }
    }

    pub fn affinity(self) -> Affinity {
        Affinity::of(self.as_sql())
    }

    /// Value written into a `NOT NULL` column that has no default
    fn fill_literal(self) -> &'static str {
        match self {
            Self::Integer | Self::Real => "0",
            Self::Text => "''",
            Self::Blob => "X''",
            Self::Datetime => "CURRENT_TIMESTAMP",
        }
    }
}

/// SQLite column affinity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affinity {
    Integer,
    Text,
    Blob,
    Real,
    Numeric,
}

impl Affinity {
    /// Affinity SQLite derives from a declared type name
    ///
    /// Rules are applied in SQLite's order, so `CHARINT` is INTEGER and
    /// `FLOATING POINT` is INTEGER as well.
    pub fn of(declared_type: &str) -> Self {
        let upper = declared_type.to_ascii_uppercase();
        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.contains("BLOB") || upper.trim().is_empty() {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Numeric
        }
    }
}

impl fmt::Display for Affinity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Integer => "INTEGER",
            Self::Text => "TEXT",
            Self::Blob => "BLOB",
            Self::Real => "REAL",
            Self::Numeric => "NUMERIC",
        };
        f.write_str(s)
    }
}

/// Default value of a target column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DefaultExpr {
    Null,
    Integer(i64),
    Text(&'static str),
    CurrentTimestamp,
}

impl DefaultExpr {
    pub fn to_sql(self) -> String {
        match self {
            Self::Null => "NULL".to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Text(value) => format!("'{}'", value.replace('\'', "''")),
            Self::CurrentTimestamp => "CURRENT_TIMESTAMP".to_string(),
        }
    }

    /// `ALTER TABLE ... ADD COLUMN` only accepts constant defaults
    pub fn is_constant(self) -> bool {
        !matches!(self, Self::CurrentTimestamp)
    }

    pub fn is_null(self) -> bool {
        matches!(self, Self::Null)
    }
}

/// Role a column plays in its table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    PrimaryKey { autoincrement: bool },
    Regular,
}

/// Target shape of one column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub declared_type: SqlType,
    pub nullable: bool,
    pub default: Option<DefaultExpr>,
    pub role: ColumnRole,
    /// Names this column carried in earlier schema generations
    pub aliases: &'static [&'static str],
}

impl ColumnSpec {
    pub const fn new(name: &'static str, declared_type: SqlType) -> Self {
        Self {
            name,
            declared_type,
            nullable: true,
            default: None,
            role: ColumnRole::Regular,
            aliases: &[],
        }
    }

    /// `INTEGER PRIMARY KEY AUTOINCREMENT`, the rowid alias
    pub const fn primary_key(name: &'static str) -> Self {
        Self {
            name,
            declared_type: SqlType::Integer,
            nullable: true,
            default: None,
            role: ColumnRole::PrimaryKey {
                autoincrement: true,
            },
            aliases: &[],
        }
    }

    pub const fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub const fn default(mut self, default: DefaultExpr) -> Self {
        self.default = Some(default);
        self
    }

    pub const fn aliases(mut self, aliases: &'static [&'static str]) -> Self {
        self.aliases = aliases;
        self
    }

    pub fn is_primary_key(&self) -> bool {
        matches!(self.role, ColumnRole::PrimaryKey { .. })
    }

    pub fn matches_name(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }

    /// Default with `DEFAULT NULL` folded into "no default"
    pub fn effective_default(&self) -> Option<DefaultExpr> {
        self.default.filter(|d| !d.is_null())
    }

    /// Column definition as used inside `CREATE TABLE`
    pub fn column_def(&self) -> String {
        let mut def = format!("{} {}", quote_ident(self.name), self.declared_type.as_sql());
        if let ColumnRole::PrimaryKey { autoincrement } = self.role {
            def.push_str(" PRIMARY KEY");
            if autoincrement {
                def.push_str(" AUTOINCREMENT");
            }
        }
        if !self.nullable && !self.is_primary_key() {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = self.default {
            def.push_str(" DEFAULT ");
            def.push_str(&default.to_sql());
        }
        def
    }

    /// Column definition for `ALTER TABLE ... ADD COLUMN`
    ///
    /// Non-constant defaults are left out; the caller backfills instead.
    pub fn add_column_def(&self) -> String {
        let mut def = format!("{} {}", quote_ident(self.name), self.declared_type.as_sql());
        match self.default {
            Some(default) if default.is_constant() => {
                if !self.nullable {
                    def.push_str(" NOT NULL");
                }
                def.push_str(" DEFAULT ");
                def.push_str(&default.to_sql());
            }
            _ => {}
        }
        def
    }

    /// Why this column cannot be added with `ALTER TABLE ... ADD COLUMN`
    pub fn not_addable_reason(&self) -> Option<&'static str> {
        if self.is_primary_key() {
            return Some("primary key");
        }
        match self.effective_default() {
            Some(default) if !default.is_constant() => Some("non-constant default"),
            None if !self.nullable => Some("NOT NULL without default"),
            _ => None,
        }
    }

    /// Literal substituted for missing or NULL source values, if any
    pub fn fill_literal(&self) -> Option<String> {
        if let Some(default) = self.effective_default() {
            return Some(default.to_sql());
        }
        if self.nullable {
            None
        } else {
            Some(self.declared_type.fill_literal().to_string())
        }
    }
}

/// `ON DELETE` action of a foreign key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnDelete {
    Cascade,
    SetNull,
    SetDefault,
    Restrict,
    NoAction,
}

impl OnDelete {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Cascade => "CASCADE",
            Self::SetNull => "SET NULL",
            Self::SetDefault => "SET DEFAULT",
            Self::Restrict => "RESTRICT",
            Self::NoAction => "NO ACTION",
        }
    }

    /// Parse the `on_delete` column of `pragma_foreign_key_list`
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "CASCADE" => Some(Self::Cascade),
            "SET NULL" => Some(Self::SetNull),
            "SET DEFAULT" => Some(Self::SetDefault),
            "RESTRICT" => Some(Self::Restrict),
            "NO ACTION" | "" => Some(Self::NoAction),
            _ => None,
        }
    }
}

/// Foreign key from one column to a column of an earlier table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForeignKey {
    pub column: &'static str,
    pub references_table: &'static str,
    pub references_column: &'static str,
    pub on_delete: OnDelete,
}

impl ForeignKey {
    pub const fn new(
        column: &'static str,
        references_table: &'static str,
        on_delete: OnDelete,
    ) -> Self {
        Self {
            column,
            references_table,
            references_column: "id",
            on_delete,
        }
    }

    fn constraint_sql(&self) -> String {
        format!(
            "FOREIGN KEY ({}) REFERENCES {}({}) ON DELETE {}",
            quote_ident(self.column),
            quote_ident(self.references_table),
            quote_ident(self.references_column),
            self.on_delete.as_sql()
        )
    }
}

/// Secondary index declared on a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
}

impl IndexSpec {
    pub const fn new(name: &'static str, columns: &'static [&'static str]) -> Self {
        Self { name, columns }
    }

    pub fn create_sql(&self, table: &str) -> String {
        let columns: Vec<String> = self.columns.iter().map(|c| quote_ident(c)).collect();
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            quote_ident(self.name),
            quote_ident(table),
            columns.join(", ")
        )
    }
}

/// Target shape of one table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [ColumnSpec],
    pub foreign_keys: &'static [ForeignKey],
    pub indexes: &'static [IndexSpec],
}

impl TableSpec {
    pub const fn new(name: &'static str, columns: &'static [ColumnSpec]) -> Self {
        Self {
            name,
            columns,
            foreign_keys: &[],
            indexes: &[],
        }
    }

    pub const fn foreign_keys(mut self, foreign_keys: &'static [ForeignKey]) -> Self {
        self.foreign_keys = foreign_keys;
        self
    }

    pub const fn indexes(mut self, indexes: &'static [IndexSpec]) -> Self {
        self.indexes = indexes;
        self
    }

    pub fn column(&self, name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.matches_name(name))
    }

    pub fn foreign_key_for(&self, column: &str) -> Option<&ForeignKey> {
        self.foreign_keys
            .iter()
            .find(|fk| fk.column.eq_ignore_ascii_case(column))
    }

    pub fn shadow_name(&self) -> String {
        format!("{}{}", self.name, SHADOW_SUFFIX)
    }

    /// Tables this one references, excluding itself
    pub fn dependencies(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.foreign_keys
            .iter()
            .map(|fk| fk.references_table)
            .filter(|t| !t.eq_ignore_ascii_case(self.name))
    }

    /// `CREATE TABLE IF NOT EXISTS` with the full target DDL
    pub fn create_sql(&self) -> String {
        self.render_create(self.name, true)
    }

    /// Target DDL under another name, used for the shadow table
    pub fn create_sql_named(&self, name: &str) -> String {
        self.render_create(name, false)
    }

    fn render_create(&self, name: &str, if_not_exists: bool) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnSpec::column_def).collect();
        parts.extend(self.foreign_keys.iter().map(ForeignKey::constraint_sql));
        format!(
            "CREATE TABLE {}{} (\n    {}\n)",
            if if_not_exists { "IF NOT EXISTS " } else { "" },
            quote_ident(name),
            parts.join(",\n    ")
        )
    }
}

/// What happens to a table from an earlier schema generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyFate {
    /// Rows are copied into a successor table, then the table is dropped
    Absorb {
        into: &'static str,
        /// `(legacy column, successor column)` pairs
        column_renames: &'static [(&'static str, &'static str)],
    },
    /// Dropped without copying
    Discard,
}

/// Table superseded by the current catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyTable {
    pub name: &'static str,
    pub fate: LegacyFate,
}

impl LegacyTable {
    pub const fn absorb(
        name: &'static str,
        into: &'static str,
        column_renames: &'static [(&'static str, &'static str)],
    ) -> Self {
        Self {
            name,
            fate: LegacyFate::Absorb {
                into,
                column_renames,
            },
        }
    }

    pub const fn discard(name: &'static str) -> Self {
        Self {
            name,
            fate: LegacyFate::Discard,
        }
    }
}

/// Validated set of table specs in dependency order
#[derive(Debug, Clone)]
pub struct Catalog {
    tables: Vec<TableSpec>,
    legacy: Vec<LegacyTable>,
}

impl Catalog {
    /// Validate the specs and order them so referenced tables come first
    ///
    /// Declaration order is kept wherever dependencies allow it.
    pub fn new(tables: &[TableSpec], legacy: &[LegacyTable]) -> Result<Self, StorageError> {
        for (i, table) in tables.iter().enumerate() {
            if tables[..i]
                .iter()
                .any(|t| t.name.eq_ignore_ascii_case(table.name))
            {
                return Err(invalid(format!("table `{}` declared twice", table.name)));
            }
            validate_table(table, tables)?;
        }

        for entry in legacy {
            validate_legacy(entry, tables)?;
        }

        Ok(Self {
            tables: dependency_order(tables)?,
            legacy: legacy.to_vec(),
        })
    }

    /// The compiled-in production catalog
    pub fn target() -> Result<Self, StorageError> {
        Self::new(TARGET_TABLES, TARGET_LEGACY)
    }

    /// Tables in dependency order
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    pub fn legacy_tables(&self) -> &[LegacyTable] {
        &self.legacy
    }

    pub fn table(&self, name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }
}

fn invalid(message: String) -> StorageError {
    StorageError::InvalidCatalog(message)
}

fn validate_table(table: &TableSpec, all: &[TableSpec]) -> Result<(), StorageError> {
    if table.name.ends_with(SHADOW_SUFFIX) {
        return Err(invalid(format!(
            "table `{}` collides with the shadow table naming scheme",
            table.name
        )));
    }
    if table.columns.is_empty() {
        return Err(invalid(format!("table `{}` has no columns", table.name)));
    }

    for (i, column) in table.columns.iter().enumerate() {
        let known = &table.columns[..i];
        if known.iter().any(|c| c.matches_name(column.name)) {
            return Err(invalid(format!(
                "column `{}.{}` declared twice",
                table.name, column.name
            )));
        }
        for alias in column.aliases {
            if table.column(alias).is_some() {
                return Err(invalid(format!(
                    "alias `{alias}` of `{}.{}` is also a current column",
                    table.name, column.name
                )));
            }
        }
    }

    for fk in table.foreign_keys {
        if table.column(fk.column).is_none() {
            return Err(invalid(format!(
                "foreign key on unknown column `{}.{}`",
                table.name, fk.column
            )));
        }
        if !all
            .iter()
            .any(|t| t.name.eq_ignore_ascii_case(fk.references_table))
        {
            return Err(invalid(format!(
                "`{}.{}` references unknown table `{}`",
                table.name, fk.column, fk.references_table
            )));
        }
    }

    for index in table.indexes {
        if let Some(missing) = index.columns.iter().find(|c| table.column(c).is_none()) {
            return Err(invalid(format!(
                "index `{}` uses unknown column `{}.{missing}`",
                index.name, table.name
            )));
        }
    }

    Ok(())
}

fn validate_legacy(entry: &LegacyTable, tables: &[TableSpec]) -> Result<(), StorageError> {
    if tables.iter().any(|t| t.name.eq_ignore_ascii_case(entry.name)) {
        return Err(invalid(format!(
            "legacy table `{}` is still a current table",
            entry.name
        )));
    }

    if let LegacyFate::Absorb {
        into,
        column_renames,
    } = entry.fate
    {
        let successor = tables
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(into))
            .ok_or_else(|| {
                invalid(format!(
                    "legacy table `{}` is absorbed into unknown table `{into}`",
                    entry.name
                ))
            })?;
        for (_, to) in column_renames {
            if successor.column(to).is_none() {
                return Err(invalid(format!(
                    "legacy table `{}` maps onto unknown column `{into}.{to}`",
                    entry.name
                )));
            }
        }
    }

    Ok(())
}

/// Stable topological sort over foreign-key references
fn dependency_order(tables: &[TableSpec]) -> Result<Vec<TableSpec>, StorageError> {
    let mut ordered: Vec<TableSpec> = Vec::with_capacity(tables.len());
    let mut pending: Vec<TableSpec> = tables.to_vec();

    while !pending.is_empty() {
        let ready = pending.iter().position(|table| {
            table.dependencies().all(|dep| {
                ordered
                    .iter()
                    .any(|placed| placed.name.eq_ignore_ascii_case(dep))
            })
        });

        match ready {
            Some(index) => ordered.push(pending.remove(index)),
            None => {
                let names: Vec<&str> = pending.iter().map(|t| t.name).collect();
                return Err(invalid(format!(
                    "foreign key cycle between tables: {}",
                    names.join(", ")
                )));
            }
        }
    }

    Ok(ordered)
}

// ============================================================================
// Production catalog
// ============================================================================

const CREATED_AT: ColumnSpec =
    ColumnSpec::new("createdAt", SqlType::Datetime).default(DefaultExpr::CurrentTimestamp);

const ITEMS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::primary_key("id"),
    ColumnSpec::new("name", SqlType::Text).not_null(),
    ColumnSpec::new("description", SqlType::Text),
    ColumnSpec::new("stair", SqlType::Integer),
    ColumnSpec::new("x", SqlType::Integer).default(DefaultExpr::Integer(0)),
    ColumnSpec::new("y", SqlType::Integer).default(DefaultExpr::Integer(0)),
    ColumnSpec::new("img1", SqlType::Text),
    ColumnSpec::new("img2", SqlType::Text),
    ColumnSpec::new("img3", SqlType::Text),
    ColumnSpec::new("interests", SqlType::Text),
    CREATED_AT.aliases(&["created_at"]),
];

const USERS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::primary_key("id"),
    ColumnSpec::new("age", SqlType::Integer),
    CREATED_AT.aliases(&["createdDate"]),
    ColumnSpec::new("interest", SqlType::Text),
    ColumnSpec::new("rewarded", SqlType::Integer).default(DefaultExpr::Integer(0)),
];

const INTERESTS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::primary_key("id"),
    ColumnSpec::new("name", SqlType::Text).not_null(),
    CREATED_AT,
];

const ITEM_LOGS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::primary_key("id"),
    ColumnSpec::new("itemId", SqlType::Integer).not_null(),
    ColumnSpec::new("userId", SqlType::Integer).not_null(),
    ColumnSpec::new("answer", SqlType::Integer),
    ColumnSpec::new("imageData", SqlType::Text),
    ColumnSpec::new("imageMimeType", SqlType::Text),
    CREATED_AT.aliases(&["createdDate"]),
];

const QUEST_LOGS_COLUMNS: &[ColumnSpec] = &[
    ColumnSpec::primary_key("id"),
    ColumnSpec::new("itemId", SqlType::Integer).not_null(),
    ColumnSpec::new("userId", SqlType::Integer).not_null(),
    ColumnSpec::new("note", SqlType::Text),
    ColumnSpec::new("done", SqlType::Integer)
        .not_null()
        .default(DefaultExpr::Integer(0)),
    CREATED_AT,
];

const LOG_FOREIGN_KEYS: &[ForeignKey] = &[
    ForeignKey::new("itemId", "items", OnDelete::Cascade),
    ForeignKey::new("userId", "users", OnDelete::Cascade),
];

const ITEM_LOGS_INDEXES: &[IndexSpec] = &[
    IndexSpec::new("idx_itemLogs_itemId", &["itemId"]),
    IndexSpec::new("idx_itemLogs_userId", &["userId"]),
];

const QUEST_LOGS_INDEXES: &[IndexSpec] = &[IndexSpec::new("idx_questLogs_userId", &["userId"])];

pub const ITEMS: TableSpec = TableSpec::new("items", ITEMS_COLUMNS);
pub const USERS: TableSpec = TableSpec::new("users", USERS_COLUMNS);
pub const INTERESTS: TableSpec = TableSpec::new("interests", INTERESTS_COLUMNS);
pub const ITEM_LOGS: TableSpec = TableSpec::new("itemLogs", ITEM_LOGS_COLUMNS)
    .foreign_keys(LOG_FOREIGN_KEYS)
    .indexes(ITEM_LOGS_INDEXES);
pub const QUEST_LOGS: TableSpec = TableSpec::new("questLogs", QUEST_LOGS_COLUMNS)
    .foreign_keys(LOG_FOREIGN_KEYS)
    .indexes(QUEST_LOGS_INDEXES);

const TARGET_TABLES: &[TableSpec] = &[ITEMS, USERS, INTERESTS, ITEM_LOGS, QUEST_LOGS];

const TARGET_LEGACY: &[LegacyTable] =
    &[LegacyTable::absorb("quizLogs", "itemLogs", &[("quizId", "itemId")])];
