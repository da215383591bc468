//! Schema migrations for Questboard
//!
//! Converges every catalog table on each boot: runtime settings first,
//! then each table in dependency order, then the legacy cleanup pass.
//! Nothing is versioned; the live schema is the only state.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::catalog::{quote_ident, Catalog, LegacyFate, LegacyTable, TableSpec};
use super::error::{FailureKind, StorageError};
use super::introspect::snapshot;
use super::rebuild::{absorb, rebuild, ForeignKeysSuspended, InterruptedRebuild, RebuildOutcome};
use super::reconcile::{reconcile, reconcile_legacy, MigrationStep, ReconciliationPlan};

/// How long a statement waits on a lock held by another instance
pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Extra reconcile rounds after the first plan was applied
const MAX_SETTLE_PASSES: usize = 3;

/// Lifecycle of one table during a boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TableState {
    Absent,
    Created,
    Reconciled,
    RebuildPending,
    Rebuilt,
    Ready,
}

/// A step that failed without aborting the boot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step: String,
    pub kind: FailureKind,
    pub message: String,
}

/// What happened to one catalog table
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableOutcome {
    pub table: String,
    pub history: Vec<TableState>,
    /// Leftover rebuild that was recovered before reconciling
    pub recovered: Option<String>,
    pub applied: Vec<String>,
    pub failures: Vec<StepFailure>,
}

impl TableOutcome {
    fn new(table: &str) -> Self {
        Self {
            table: table.to_string(),
            history: Vec::new(),
            recovered: None,
            applied: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn enter(&mut self, state: TableState) {
        if self.history.last() != Some(&state) {
            debug!(table = %self.table, ?state, "table state");
            self.history.push(state);
        }
    }

    pub fn state(&self) -> Option<TableState> {
        self.history.last().copied()
    }
}

/// What happened to one legacy table
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOutcome {
    pub table: String,
    pub applied: Vec<String>,
    /// Rows copied into the successor, when absorbed
    pub rows: Option<usize>,
    pub failures: Vec<StepFailure>,
}

/// Summary of one migration run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Journal mode reported by SQLite after the switch to WAL
    pub journal_mode: String,
    pub settings_failures: Vec<StepFailure>,
    pub tables: Vec<TableOutcome>,
    pub legacy: Vec<LegacyOutcome>,
}

impl MigrationReport {
    pub fn table(&self, name: &str) -> Option<&TableOutcome> {
        self.tables
            .iter()
            .find(|t| t.table.eq_ignore_ascii_case(name))
    }

    /// Every non-fatal failure of the run
    pub fn failures(&self) -> impl Iterator<Item = &StepFailure> {
        self.settings_failures
            .iter()
            .chain(self.tables.iter().flat_map(|t| t.failures.iter()))
            .chain(self.legacy.iter().flat_map(|l| l.failures.iter()))
    }

    pub fn is_clean(&self) -> bool {
        self.failures().next().is_none()
    }
}

/// Steps a run would apply to one table, as computed without writing
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TablePlan {
    pub table: String,
    pub recovery: Option<String>,
    pub steps: Vec<String>,
}

enum Effect {
    Done,
    Rebuilt(usize),
    AlreadyCurrent,
    Absorbed(Option<usize>),
}

/// Applies a catalog to one connection
pub struct MigrationRunner<'a> {
    conn: &'a Connection,
    catalog: &'a Catalog,
}

impl<'a> MigrationRunner<'a> {
    pub fn new(conn: &'a Connection, catalog: &'a Catalog) -> Self {
        Self { conn, catalog }
    }

    /// Converge the database to the catalog
    ///
    /// Only fatal-class failures and failed schema reads return an error.
    /// Everything else is logged, recorded in the report, and skipped.
    pub fn run(&self) -> Result<MigrationReport, StorageError> {
        let started_at = Utc::now();
        let mut settings_failures = Vec::new();
        let journal_mode = self.apply_settings(&mut settings_failures)?;

        let mut tables = Vec::with_capacity(self.catalog.tables().len());
        for spec in self.catalog.tables() {
            tables.push(self.migrate_table(spec)?);
        }

        let mut legacy = Vec::with_capacity(self.catalog.legacy_tables().len());
        for entry in self.catalog.legacy_tables() {
            let live = snapshot(self.conn, entry.name)?;
            let plan = reconcile_legacy(entry, self.successor(entry), &live);
            if plan.is_empty() {
                continue;
            }

            let mut outcome = LegacyOutcome {
                table: entry.name.to_string(),
                applied: Vec::new(),
                rows: None,
                failures: Vec::new(),
            };
            for step in plan.steps() {
                match self.apply(step) {
                    Ok(effect) => {
                        if let Effect::Absorbed(rows) = effect {
                            outcome.rows = rows;
                        }
                        outcome.applied.push(step.to_string());
                    }
                    Err(e) => outcome.failures.push(tolerate(step, e)?),
                }
            }
            legacy.push(outcome);
        }

        let report = MigrationReport {
            started_at,
            finished_at: Utc::now(),
            journal_mode,
            settings_failures,
            tables,
            legacy,
        };

        let failures = report.failures().count();
        if failures == 0 {
            info!(tables = report.tables.len(), "schema converged");
        } else {
            warn!(
                tables = report.tables.len(),
                failures, "schema migration finished with skipped steps"
            );
        }
        Ok(report)
    }

    /// Compute what `run` would do, without writing anything
    pub fn plan(&self) -> Result<Vec<TablePlan>, StorageError> {
        let mut plans = Vec::new();

        for spec in self.catalog.tables() {
            let recovery = InterruptedRebuild::detect(self.conn, spec)?;
            let live = snapshot(self.conn, spec.name)?;
            plans.push(TablePlan {
                table: spec.name.to_string(),
                recovery: recovery.map(|r| format!("resume rebuild interrupted while {}", r.phase())),
                steps: steps_of(&reconcile(spec, &live)),
            });
        }

        for entry in self.catalog.legacy_tables() {
            let live = snapshot(self.conn, entry.name)?;
            let plan = reconcile_legacy(entry, self.successor(entry), &live);
            if !plan.is_empty() {
                plans.push(TablePlan {
                    table: entry.name.to_string(),
                    recovery: None,
                    steps: steps_of(&plan),
                });
            }
        }

        Ok(plans)
    }

    fn successor(&self, entry: &LegacyTable) -> Option<&'a TableSpec> {
        match entry.fate {
            LegacyFate::Absorb { into, .. } => self.catalog.table(into),
            LegacyFate::Discard => None,
        }
    }

    /// busy_timeout, WAL and foreign keys, in that order
    fn apply_settings(&self, failures: &mut Vec<StepFailure>) -> Result<String, StorageError> {
        if let Err(e) = self.conn.busy_timeout(BUSY_TIMEOUT) {
            failures.push(tolerate_setting("busy_timeout", e)?);
        }

        let journal_mode = match self.conn.pragma_update_and_check(
            None,
            "journal_mode",
            "WAL",
            |row| row.get::<_, String>(0),
        ) {
            Ok(mode) => mode.to_ascii_lowercase(),
            Err(e) => {
                failures.push(tolerate_setting("journal_mode", e)?);
                self.conn
                    .query_row("PRAGMA journal_mode", [], |row| row.get::<_, String>(0))
                    .map(|m| m.to_ascii_lowercase())
                    .unwrap_or_default()
            }
        };
        if journal_mode != "wal" {
            debug!(journal_mode = %journal_mode, "database is not in WAL mode");
        }

        if let Err(e) = self.conn.pragma_update(None, "foreign_keys", true) {
            failures.push(tolerate_setting("foreign_keys", e)?);
        }

        Ok(journal_mode)
    }

    fn migrate_table(&self, spec: &TableSpec) -> Result<TableOutcome, StorageError> {
        let mut outcome = TableOutcome::new(spec.name);

        if let Some(interrupted) = InterruptedRebuild::detect(self.conn, spec)? {
            let step = format!("recover {} from interrupted rebuild", spec.name);
            match interrupted.resume(self.conn) {
                Ok(()) => outcome.recovered = Some(interrupted.phase().to_string()),
                Err(e) => outcome.failures.push(tolerate_sql(&step, e)?),
            }
        }

        for pass in 0..=MAX_SETTLE_PASSES {
            let live = snapshot(self.conn, spec.name)?;
            if live.exists() {
                outcome.enter(TableState::Reconciled);
            } else {
                outcome.enter(TableState::Absent);
            }

            let plan = reconcile(spec, &live);
            if plan.is_empty() {
                break;
            }
            if pass == MAX_SETTLE_PASSES {
                warn!(
                    table = spec.name,
                    remaining = plan.steps().len(),
                    "table did not converge"
                );
                break;
            }
            if pass > 0 {
                debug!(table = spec.name, pass, "settle pass");
            }

            if !self.apply_plan(&plan, &mut outcome)? {
                break;
            }
        }

        outcome.enter(TableState::Ready);
        Ok(outcome)
    }

    /// Apply every step of `plan`; returns whether any of them took effect
    fn apply_plan(
        &self,
        plan: &ReconciliationPlan,
        outcome: &mut TableOutcome,
    ) -> Result<bool, StorageError> {
        let mut progressed = false;

        for step in plan.steps() {
            if let MigrationStep::RebuildTable { .. } = step {
                outcome.enter(TableState::RebuildPending);
            }

            match self.apply(step) {
                Ok(effect) => {
                    match effect {
                        Effect::Rebuilt(_) => outcome.enter(TableState::Rebuilt),
                        Effect::Done if matches!(step, MigrationStep::CreateTable(_)) => {
                            outcome.enter(TableState::Created)
                        }
                        _ => {}
                    }
                    if !matches!(effect, Effect::AlreadyCurrent) {
                        progressed = true;
                        outcome.applied.push(step.to_string());
                    }
                }
                Err(e) => outcome.failures.push(tolerate(step, e)?),
            }
        }

        Ok(progressed)
    }

    fn apply(&self, step: &MigrationStep) -> Result<Effect, StorageError> {
        let conn = self.conn;
        debug!(%step, "applying");

        match step {
            MigrationStep::CreateTable(spec) => {
                conn.execute_batch(&spec.create_sql())?;
                info!(table = spec.name, "table created");
            }
            MigrationStep::AddColumn { table, column } => {
                conn.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote_ident(table),
                    column.add_column_def()
                ))?;
                if let Some(default) = column.effective_default() {
                    let updated = conn.execute(
                        &format!(
                            "UPDATE {table} SET {column} = {value} WHERE {column} IS NULL",
                            table = quote_ident(table),
                            column = quote_ident(column.name),
                            value = default.to_sql()
                        ),
                        [],
                    )?;
                    debug!(table = *table, column = column.name, rows = updated, "default backfilled");
                }
                info!(table = *table, column = column.name, "column added");
            }
            MigrationStep::RenameColumn {
                table,
                from,
                to,
                backfill,
            } => {
                let renamed = conn.execute_batch(&format!(
                    "ALTER TABLE {} RENAME COLUMN {} TO {}",
                    quote_ident(table),
                    quote_ident(from),
                    quote_ident(to.name)
                ));
                match renamed {
                    Ok(()) => info!(table = *table, from = %from, to = to.name, "column renamed"),
                    Err(e) if FailureKind::classify(&e) == FailureKind::Fatal => return Err(e.into()),
                    Err(e) => {
                        warn!(
                            table = *table,
                            from = %from,
                            to = to.name,
                            error = %e,
                            "native rename failed, copying into a new column"
                        );
                        let tx = Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?;
                        tx.execute_batch(&format!(
                            "ALTER TABLE {} ADD COLUMN {}",
                            quote_ident(table),
                            to.add_column_def()
                        ))?;
                        let copied = tx.execute(
                            &format!(
                                "UPDATE {} SET {} = {}",
                                quote_ident(table),
                                quote_ident(to.name),
                                backfill
                            ),
                            [],
                        )?;
                        tx.commit()?;
                        debug!(table = *table, column = to.name, rows = copied, "renamed column backfilled");
                    }
                }
            }
            MigrationStep::RebuildTable { spec, mapping, .. } => {
                return Ok(match rebuild(conn, spec, mapping)? {
                    RebuildOutcome::Rebuilt { rows } => Effect::Rebuilt(rows),
                    RebuildOutcome::AlreadyCurrent => Effect::AlreadyCurrent,
                });
            }
            MigrationStep::CreateIndex { table, index } => {
                conn.execute_batch(&index.create_sql(table))?;
                info!(table = *table, index = index.name, "index created");
            }
            MigrationStep::AbsorbTable {
                legacy,
                into,
                mapping,
            } => {
                return Ok(Effect::Absorbed(absorb(conn, legacy, into, mapping)?));
            }
            MigrationStep::DropTable(name) => {
                let _fk = ForeignKeysSuspended::new(conn)?;
                conn.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
                info!(table = *name, "legacy table dropped");
            }
        }

        Ok(Effect::Done)
    }
}

fn steps_of(plan: &ReconciliationPlan) -> Vec<String> {
    plan.steps().iter().map(ToString::to_string).collect()
}

/// Record a failed step, or abort when the failure is fatal
fn tolerate(step: &MigrationStep, err: StorageError) -> Result<StepFailure, StorageError> {
    match err {
        StorageError::Database(e) => tolerate_sql(&step.to_string(), e),
        other => Err(other),
    }
}

fn tolerate_setting(setting: &str, err: rusqlite::Error) -> Result<StepFailure, StorageError> {
    tolerate_sql(&format!("set {setting}"), err)
}

fn tolerate_sql(step: &str, err: rusqlite::Error) -> Result<StepFailure, StorageError> {
    let kind = FailureKind::classify(&err);
    if !kind.is_tolerated() {
        error!(step, error = %err, "fatal storage failure");
        return Err(StorageError::Fatal {
            step: step.to_string(),
            source: err,
        });
    }
    match kind {
        FailureKind::AlreadyApplied => info!(step, error = %err, "step already applied"),
        FailureKind::Contended => warn!(step, error = %err, "database busy, step skipped"),
        _ => error!(step, error = %err, "step rejected, skipped"),
    }

    Ok(StepFailure {
        step: step.to_string(),
        kind,
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests;
