//! Column reconciliation
//!
//! Diffs a live table snapshot against its target spec and produces the
//! ordered steps that close the gap. Plans are recomputed from a fresh
//! snapshot every time, which is what keeps re-running them safe.

use std::fmt;

use super::catalog::{quote_ident, Affinity, ColumnSpec, LegacyTable, TableSpec};
use super::introspect::{IntrospectedColumn, TableSnapshot};

/// Where a target column's value comes from when rows are copied
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// Same column exists in the source table
    Same(String),
    /// Value lives under an older name (legacy alias or table-level rename)
    Renamed(String),
    /// Both names are live; the target wins where it is not NULL
    Merged { column: String, alias: String },
    /// Source has no counterpart; the target default applies
    Missing,
}

/// Source of every target column for a table copy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMapping {
    entries: Vec<(&'static str, ColumnSource)>,
}

impl ColumnMapping {
    /// Map `spec` onto the columns of a live table
    ///
    /// `renames` are `(source column, target column)` pairs that take
    /// precedence over column aliases.
    pub fn plan(
        spec: &TableSpec,
        source: &[IntrospectedColumn],
        renames: &[(&str, &str)],
    ) -> Self {
        let find = |name: &str| -> Option<String> {
            source
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(name))
                .map(|c| c.name.clone())
        };

        let older = |column: &ColumnSpec| -> Option<String> {
            renames
                .iter()
                .filter(|(_, to)| column.matches_name(to))
                .find_map(|(from, _)| find(*from))
                .or_else(|| column.aliases.iter().find_map(|alias| find(*alias)))
        };

        let entries = spec
            .columns
            .iter()
            .map(|column| {
                let source = match (find(column.name), older(column)) {
                    (Some(name), Some(alias)) => ColumnSource::Merged { column: name, alias },
                    (Some(name), None) => ColumnSource::Same(name),
                    (None, Some(name)) => ColumnSource::Renamed(name),
                    (None, None) => ColumnSource::Missing,
                };
                (column.name, source)
            })
            .collect();

        Self { entries }
    }

    #[cfg(test)]
    pub(crate) fn source_of(&self, column: &str) -> Option<&ColumnSource> {
        self.entries
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, source)| source)
    }

    /// Whether every non-missing source still exists in `live`
    pub fn is_valid_for(&self, live: &[IntrospectedColumn]) -> bool {
        self.entries.iter().all(|(_, source)| match source {
            ColumnSource::Same(name) | ColumnSource::Renamed(name) => {
                live.iter().any(|c| c.name.eq_ignore_ascii_case(name))
            }
            ColumnSource::Merged { column, alias } => [column, alias]
                .iter()
                .all(|name| live.iter().any(|c| c.name.eq_ignore_ascii_case(name))),
            ColumnSource::Missing => true,
        })
    }

    /// `INSERT INTO target (...) SELECT ... FROM source` for this mapping
    pub fn copy_sql(&self, spec: &TableSpec, source: &str, target: &str, or_ignore: bool) -> String {
        let mut columns = Vec::new();
        let mut exprs = Vec::new();

        for (column, (_, mapped)) in spec.columns.iter().zip(&self.entries) {
            if let Some(expr) = select_expr(column, mapped) {
                columns.push(quote_ident(column.name));
                exprs.push(expr);
            }
        }

        if columns.is_empty() {
            columns.push("rowid".to_string());
            exprs.push("NULL".to_string());
        }

        format!(
            "INSERT {}INTO {} ({}) SELECT {} FROM {}",
            if or_ignore { "OR IGNORE " } else { "" },
            quote_ident(target),
            columns.join(", "),
            exprs.join(", "),
            quote_ident(source)
        )
    }
}

/// Expression selecting `column` from the source, `None` to leave it to the DDL default
fn select_expr(column: &ColumnSpec, source: &ColumnSource) -> Option<String> {
    match source {
        ColumnSource::Same(name) => {
            let quoted = quote_ident(name);
            match column.fill_literal() {
                Some(fill) if !column.nullable && !column.is_primary_key() => {
                    Some(format!("COALESCE({quoted}, {fill})"))
                }
                _ => Some(quoted),
            }
        }
        ColumnSource::Renamed(name) => {
            let quoted = quote_ident(name);
            match column.fill_literal() {
                Some(fill) if !column.is_primary_key() => Some(format!("COALESCE({quoted}, {fill})")),
                _ => Some(quoted),
            }
        }
        ColumnSource::Merged { column: name, alias } => {
            let mut args = vec![quote_ident(name), quote_ident(alias)];
            if !column.is_primary_key() {
                args.extend(column.fill_literal());
            }
            Some(format!("COALESCE({})", args.join(", ")))
        }
        ColumnSource::Missing => {
            if column.nullable || column.effective_default().is_some() {
                None
            } else {
                column.fill_literal()
            }
        }
    }
}

/// Why a table cannot be converged with `ALTER TABLE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebuildReason {
    /// Target column that `ADD COLUMN` cannot create
    NotAddable { column: String, why: &'static str },
    /// Legacy alias exists but renaming it would not give the target shape
    AliasShape { alias: String, column: String, drift: String },
    /// Target column and one of its older names are both live
    LeftoverAlias { alias: String, column: String },
    /// Live columns the target no longer has
    ExtraColumns(Vec<String>),
    /// Shared column whose shape differs from the target
    ShapeDrift { column: String, drift: String },
    /// Declared foreign keys differ from the live ones
    ForeignKeyDrift,
}

impl fmt::Display for RebuildReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotAddable { column, why } => write!(f, "cannot add `{column}` in place ({why})"),
            Self::AliasShape {
                alias,
                column,
                drift,
            } => write!(f, "alias `{alias}` cannot become `{column}` in place ({drift})"),
            Self::LeftoverAlias { alias, column } => {
                write!(f, "merges `{alias}` into `{column}`")
            }
            Self::ExtraColumns(columns) => write!(f, "drops columns {}", columns.join(", ")),
            Self::ShapeDrift { column, drift } => write!(f, "`{column}` drifted ({drift})"),
            Self::ForeignKeyDrift => f.write_str("foreign keys differ"),
        }
    }
}

/// One schema change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    CreateTable(TableSpec),
    AddColumn {
        table: &'static str,
        column: ColumnSpec,
    },
    RenameColumn {
        table: &'static str,
        from: String,
        to: ColumnSpec,
        /// Expression used when the native rename is unavailable
        backfill: String,
    },
    RebuildTable {
        spec: TableSpec,
        mapping: ColumnMapping,
        reasons: Vec<RebuildReason>,
    },
    CreateIndex {
        table: &'static str,
        index: super::catalog::IndexSpec,
    },
    AbsorbTable {
        legacy: &'static str,
        into: TableSpec,
        mapping: ColumnMapping,
    },
    DropTable(&'static str),
}

impl MigrationStep {
    /// Table the step writes to
    pub fn table(&self) -> &str {
        match self {
            Self::CreateTable(spec) => spec.name,
            Self::AddColumn { table, .. }
            | Self::RenameColumn { table, .. }
            | Self::CreateIndex { table, .. } => *table,
            Self::RebuildTable { spec, .. } => spec.name,
            Self::AbsorbTable { legacy, .. } => *legacy,
            Self::DropTable(name) => *name,
        }
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateTable(spec) => write!(f, "create table {}", spec.name),
            Self::AddColumn { table, column } => write!(f, "add column {table}.{}", column.name),
            Self::RenameColumn { table, from, to, .. } => {
                write!(f, "rename column {table}.{from} to {}", to.name)
            }
            Self::RebuildTable { spec, reasons, .. } => {
                let reasons: Vec<String> = reasons.iter().map(ToString::to_string).collect();
                write!(f, "rebuild table {} ({})", spec.name, reasons.join("; "))
            }
            Self::CreateIndex { table, index } => write!(f, "create index {} on {table}", index.name),
            Self::AbsorbTable { legacy, into, .. } => {
                write!(f, "absorb table {legacy} into {}", into.name)
            }
            Self::DropTable(name) => write!(f, "drop table {name}"),
        }
    }
}

/// Ordered steps for one table or for the legacy cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationPlan {
    steps: Vec<MigrationStep>,
}

impl ReconciliationPlan {
    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    #[cfg(test)]
    pub(crate) fn into_steps(self) -> Vec<MigrationStep> {
        self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn creates_table(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, MigrationStep::CreateTable(_)))
    }

    pub fn requires_rebuild(&self) -> bool {
        self.steps
            .iter()
            .any(|s| matches!(s, MigrationStep::RebuildTable { .. }))
    }
}

/// Plan the steps that bring `live` to the shape of `spec`
pub fn reconcile(spec: &TableSpec, live: &TableSnapshot) -> ReconciliationPlan {
    if !live.exists() {
        let mut steps = vec![MigrationStep::CreateTable(*spec)];
        steps.extend(index_steps(spec, live));
        return ReconciliationPlan { steps };
    }

    let mut additive = Vec::new();
    let mut reasons = Vec::new();
    let mut renamed_from: Vec<&str> = Vec::new();

    for column in spec.columns {
        if let Some(existing) = live.column(column.name) {
            if let Some(drift) = shape_drift(column, existing) {
                reasons.push(RebuildReason::ShapeDrift {
                    column: column.name.to_string(),
                    drift,
                });
            }
            if let Some(alias) = column.aliases.iter().find_map(|a| live.column(a)) {
                renamed_from.push(alias.name.as_str());
                reasons.push(RebuildReason::LeftoverAlias {
                    alias: alias.name.clone(),
                    column: column.name.to_string(),
                });
            }
            continue;
        }

        if let Some(alias) = column.aliases.iter().find_map(|a| live.column(a)) {
            renamed_from.push(alias.name.as_str());
            match shape_drift(column, alias) {
                None => additive.push(MigrationStep::RenameColumn {
                    table: spec.name,
                    from: alias.name.clone(),
                    to: *column,
                    backfill: rename_backfill(column, &alias.name),
                }),
                Some(drift) => reasons.push(RebuildReason::AliasShape {
                    alias: alias.name.clone(),
                    column: column.name.to_string(),
                    drift,
                }),
            }
            continue;
        }

        let why = column.not_addable_reason().or_else(|| {
            spec.foreign_key_for(column.name)
                .map(|_| "foreign key constraint")
        });
        match why {
            Some(why) => reasons.push(RebuildReason::NotAddable {
                column: column.name.to_string(),
                why,
            }),
            None => additive.push(MigrationStep::AddColumn {
                table: spec.name,
                column: *column,
            }),
        }
    }

    let extra: Vec<String> = live
        .columns
        .iter()
        .filter(|c| spec.column(&c.name).is_none())
        .filter(|c| !renamed_from.iter().any(|r| r.eq_ignore_ascii_case(&c.name)))
        .map(|c| c.name.clone())
        .collect();
    if !extra.is_empty() {
        reasons.push(RebuildReason::ExtraColumns(extra));
    }

    if foreign_keys_drifted(spec, live) {
        reasons.push(RebuildReason::ForeignKeyDrift);
    }

    let mut steps = if reasons.is_empty() {
        additive
    } else {
        vec![MigrationStep::RebuildTable {
            spec: *spec,
            mapping: ColumnMapping::plan(spec, &live.columns, &[]),
            reasons,
        }]
    };

    // A rebuild drops every index of the old table, so they are all due again.
    let rebuilt = TableSnapshot::default();
    let indexed = if steps
        .iter()
        .any(|s| matches!(s, MigrationStep::RebuildTable { .. }))
    {
        &rebuilt
    } else {
        live
    };
    steps.extend(index_steps(spec, indexed));

    ReconciliationPlan { steps }
}

/// Plan the legacy-cleanup pass given which legacy tables are present
pub fn reconcile_legacy(
    legacy: &LegacyTable,
    successor: Option<&TableSpec>,
    live: &TableSnapshot,
) -> ReconciliationPlan {
    use super::catalog::LegacyFate;

    if !live.exists() {
        return ReconciliationPlan::default();
    }

    let step = match (legacy.fate, successor) {
        (LegacyFate::Absorb { column_renames, .. }, Some(into)) => MigrationStep::AbsorbTable {
            legacy: legacy.name,
            into: *into,
            mapping: ColumnMapping::plan(into, &live.columns, column_renames),
        },
        (LegacyFate::Absorb { .. }, None) => return ReconciliationPlan::default(),
        (LegacyFate::Discard, _) => MigrationStep::DropTable(legacy.name),
    };

    ReconciliationPlan { steps: vec![step] }
}

/// Value for the target column when a rename has to fall back to add-and-copy
fn rename_backfill(column: &ColumnSpec, from: &str) -> String {
    let mut args = vec![quote_ident(column.name), quote_ident(from)];
    args.extend(column.fill_literal());
    format!("COALESCE({})", args.join(", "))
}

fn index_steps<'a>(
    spec: &'a TableSpec,
    live: &'a TableSnapshot,
) -> impl Iterator<Item = MigrationStep> + 'a {
    spec.indexes
        .iter()
        .filter(|index| !live.has_index(index.name))
        .map(|index| MigrationStep::CreateIndex {
            table: spec.name,
            index: *index,
        })
}

/// Describe how a live column differs from its target shape
pub fn shape_drift(target: &ColumnSpec, live: &IntrospectedColumn) -> Option<String> {
    let mut drift = Vec::new();

    let live_affinity = Affinity::of(&live.column_type);
    if live_affinity != target.declared_type.affinity() {
        drift.push(format!(
            "type {} has affinity {live_affinity}, expected {}",
            live.column_type,
            target.declared_type.affinity()
        ));
    }

    if live.primary_key != target.is_primary_key() {
        drift.push(if target.is_primary_key() {
            "not a primary key".to_string()
        } else {
            "unexpected primary key".to_string()
        });
    }

    if !target.is_primary_key() {
        if live.not_null == target.nullable {
            drift.push(if target.nullable {
                "unexpected NOT NULL".to_string()
            } else {
                "missing NOT NULL".to_string()
            });
        }

        let expected = target.effective_default().map(|d| normalize_default(&d.to_sql()));
        let actual = live
            .default_value
            .as_deref()
            .map(normalize_default)
            .filter(|d| d != "NULL");
        if expected != actual {
            drift.push(format!(
                "default {} instead of {}",
                actual.as_deref().unwrap_or("none"),
                expected.as_deref().unwrap_or("none")
            ));
        }
    }

    if drift.is_empty() {
        None
    } else {
        Some(drift.join(", "))
    }
}

/// Uppercase keywords and numbers, leave quoted strings untouched
fn normalize_default(value: &str) -> String {
    let trimmed = value.trim();
    if trimmed.starts_with('\'') {
        trimmed.to_string()
    } else {
        trimmed.to_ascii_uppercase()
    }
}

fn foreign_keys_drifted(spec: &TableSpec, live: &TableSnapshot) -> bool {
    if spec.foreign_keys.len() != live.foreign_keys.len() {
        return true;
    }

    !spec.foreign_keys.iter().all(|declared| {
        live.foreign_keys.iter().any(|fk| {
            fk.column.eq_ignore_ascii_case(declared.column)
                && fk
                    .references_table
                    .eq_ignore_ascii_case(declared.references_table)
                && fk
                    .references_column
                    .as_deref()
                    .map_or(true, |c| c.eq_ignore_ascii_case(declared.references_column))
                && fk.on_delete == Some(declared.on_delete)
        })
    })
}
