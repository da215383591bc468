use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use questboard_lib::error::{ErrorResponse, Result};
use questboard_lib::storage::MigrationReport;
use questboard_lib::{Database, StorageConfig};

#[derive(Parser, Debug)]
#[command(name = "questboard")]
#[command(about = "Open the Questboard database and converge its schema")]
struct Cli {
    /// SQLite database file
    #[arg(long, env = "DB_FILE")]
    db_file: Option<PathBuf>,

    /// Directory holding settings.yaml
    #[arg(long)]
    config_dir: Option<PathBuf>,

    /// Write the resolved database location to settings.yaml
    #[arg(long)]
    save_config: bool,

    /// Print the steps the next open would apply, without applying them
    #[arg(long)]
    dry_run: bool,

    /// Print the live columns of a table after migrating
    #[arg(long = "describe", value_name = "TABLE")]
    describe: Vec<String>,

    /// Print output as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> ExitCode {
    questboard_lib::logging::init_tracing("questboard");
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if cli.json {
                let response = ErrorResponse::from(&err);
                println!("{}", serde_json::to_string_pretty(&response).unwrap_or_default());
            }
            tracing::error!(error = %err, "storage bootstrap failed");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = StorageConfig::resolve(cli.db_file.clone(), cli.config_dir.as_deref());

    if cli.save_config {
        let dir = cli.config_dir.as_deref().unwrap_or(Path::new("."));
        config.save(dir)?;
        tracing::info!(
            path = %StorageConfig::config_path(dir).display(),
            db_file = %config.db_file.display(),
            "settings saved"
        );
    }

    if cli.dry_run {
        let plans = Database::plan(&config.db_file)?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&plans)?);
        } else {
            for plan in &plans {
                if let Some(recovery) = &plan.recovery {
                    println!("{}: {recovery}", plan.table);
                }
                for step in &plan.steps {
                    println!("{}: {step}", plan.table);
                }
            }
            if plans.iter().all(|p| p.steps.is_empty() && p.recovery.is_none()) {
                println!("schema is current");
            }
        }
        return Ok(());
    }

    let db = Database::open(&config.db_file)?;
    let report = db.migration_report();

    if cli.json {
        let mut output = serde_json::Map::new();
        output.insert("report".to_string(), serde_json::to_value(report)?);
        for table in &cli.describe {
            output.insert(table.clone(), serde_json::to_value(db.describe(table)?)?);
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    print_report(report);
    for table in &cli.describe {
        let columns = db.describe(table)?;
        if columns.is_empty() {
            println!("{table}: no such table");
            continue;
        }
        println!("{table}:");
        for column in columns {
            let mut line = format!("  {} {}", column.name, column.column_type);
            if column.primary_key {
                line.push_str(" PRIMARY KEY");
            }
            if column.not_null {
                line.push_str(" NOT NULL");
            }
            if let Some(default) = &column.default_value {
                line.push_str(" DEFAULT ");
                line.push_str(default);
            }
            println!("{line}");
        }
    }

    Ok(())
}

fn print_report(report: &MigrationReport) {
    println!("journal mode: {}", report.journal_mode);
    for table in &report.tables {
        for step in &table.applied {
            println!("{}: {step}", table.table);
        }
        for failure in &table.failures {
            println!("{}: skipped {} ({}: {})", table.table, failure.step, failure.kind, failure.message);
        }
    }
    for legacy in &report.legacy {
        for step in &legacy.applied {
            println!("{}: {step}", legacy.table);
        }
    }
    let failures = report.failures().count();
    if failures == 0 {
        println!("schema is current");
    } else {
        println!("{failures} step(s) skipped");
    }
}
