use super::*;
use crate::storage::catalog::{ITEMS, QUEST_LOGS, USERS};
use crate::storage::introspect::{describe_table, row_count, table_exists};
use tempfile::tempdir;

fn target() -> Catalog {
    Catalog::target().unwrap()
}

fn run_on(conn: &Connection) -> MigrationReport {
    MigrationRunner::new(conn, &target()).run().unwrap()
}

fn memory_with(ddl: &str) -> Connection {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(ddl).unwrap();
    conn
}

fn schema_of(conn: &Connection) -> Vec<(String, String, Option<String>)> {
    conn.prepare("SELECT type, name, sql FROM sqlite_master ORDER BY type, name")
        .unwrap()
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap()
}

fn assert_converged(conn: &Connection, catalog: &Catalog) {
    for spec in catalog.tables() {
        let plan = reconcile(spec, &snapshot(conn, spec.name).unwrap());
        assert!(plan.is_empty(), "{} not converged: {:?}", spec.name, plan.steps());
    }
}

#[test]
fn test_fresh_database_gets_every_table() {
    let conn = Connection::open_in_memory().unwrap();
    let report = run_on(&conn);

    for table in ["items", "users", "interests", "itemLogs", "questLogs"] {
        assert!(table_exists(&conn, table).unwrap(), "missing {table}");
    }
    assert!(report.is_clean());
    assert_eq!(report.journal_mode, "memory");
    assert_eq!(
        report.table("items").unwrap().history,
        [
            TableState::Absent,
            TableState::Created,
            TableState::Reconciled,
            TableState::Ready
        ]
    );
    assert_converged(&conn, &target());

    let fk: bool = conn
        .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
        .unwrap();
    assert!(fk);
}

#[test]
fn test_narrow_items_table_is_widened() {
    let conn = memory_with(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO items (id, name) VALUES (1, 'Lamp');",
    );
    let report = run_on(&conn);

    let (name, stair, created): (String, Option<i64>, Option<String>) = conn
        .query_row("SELECT name, stair, createdAt FROM items WHERE id = 1", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .unwrap();
    assert_eq!(name, "Lamp");
    assert_eq!(stair, None);
    assert!(created.is_some());
    assert!(describe_table(&conn, "items").unwrap().len() >= 4);

    let history = &report.table("items").unwrap().history;
    assert!(history.contains(&TableState::Rebuilt));
    assert_eq!(history.last(), Some(&TableState::Ready));
}

#[test]
fn test_four_column_items_scenario() {
    use crate::storage::catalog::{ColumnSpec, DefaultExpr, SqlType};

    const COLUMNS: &[ColumnSpec] = &[
        ColumnSpec::primary_key("id"),
        ColumnSpec::new("name", SqlType::Text),
        ColumnSpec::new("stair", SqlType::Integer).default(DefaultExpr::Null),
        ColumnSpec::new("createdAt", SqlType::Datetime).default(DefaultExpr::CurrentTimestamp),
    ];
    let catalog = Catalog::new(&[TableSpec::new("items", COLUMNS)], &[]).unwrap();
    let conn = memory_with(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
         INSERT INTO items (id, name) VALUES (1, 'x');",
    );

    MigrationRunner::new(&conn, &catalog).run().unwrap();

    assert_eq!(describe_table(&conn, "items").unwrap().len(), 4);
    let (id, name, stair, created): (i64, String, Option<i64>, Option<String>) = conn
        .query_row("SELECT id, name, stair, createdAt FROM items", [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .unwrap();
    assert_eq!((id, name.as_str(), stair), (1, "x", None));
    assert!(created.is_some());
}

#[test]
fn test_quiz_logs_are_absorbed_into_item_logs() {
    let conn = memory_with(
        "CREATE TABLE quizLogs (id INTEGER PRIMARY KEY, quizId INTEGER, userId INTEGER);
         INSERT INTO quizLogs (id, quizId, userId) VALUES (1, 10, 1), (2, 11, 1), (3, 10, 2);",
    );
    let report = run_on(&conn);

    assert!(!table_exists(&conn, "quizLogs").unwrap());
    assert_eq!(row_count(&conn, "itemLogs").unwrap(), 3);
    let item: i64 = conn
        .query_row("SELECT itemId FROM itemLogs WHERE id = 2", [], |row| row.get(0))
        .unwrap();
    assert_eq!(item, 11);

    assert_eq!(report.legacy.len(), 1);
    assert_eq!(report.legacy[0].table, "quizLogs");
    assert_eq!(report.legacy[0].rows, Some(3));
}

#[test]
fn test_second_run_changes_nothing() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("app.db");

    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, created_at DATETIME);
             CREATE TABLE users (id INTEGER PRIMARY KEY, age INTEGER, createdDate DATETIME);
             INSERT INTO items (name, created_at) VALUES ('Lamp', '2024-02-02 10:00:00');
             INSERT INTO users (age) VALUES (31);",
        )
        .unwrap();
        let first = run_on(&conn);
        assert_eq!(first.journal_mode, "wal");
    }

    let conn = Connection::open(&path).unwrap();
    let before = schema_of(&conn);
    let items_before: Vec<(i64, String)> = conn
        .prepare("SELECT id, name FROM items ORDER BY id")
        .unwrap()
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();

    let second = run_on(&conn);

    assert!(second.tables.iter().all(|t| t.applied.is_empty()));
    assert!(second.legacy.is_empty());
    assert_eq!(schema_of(&conn), before);
    let items_after: Vec<(i64, String)> = conn
        .prepare("SELECT id, name FROM items ORDER BY id")
        .unwrap()
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(items_after, items_before);
}

#[test]
fn test_added_column_default_reaches_existing_rows() {
    let conn = memory_with(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, age INTEGER,
            createdAt DATETIME DEFAULT CURRENT_TIMESTAMP, interest TEXT);
         INSERT INTO users (age) VALUES (20), (30), (40);",
    );
    let report = run_on(&conn);

    let unrewarded: i64 = conn
        .query_row("SELECT COUNT(*) FROM users WHERE rewarded = 0", [], |row| row.get(0))
        .unwrap();
    assert_eq!(unrewarded, 3);
    assert_eq!(
        report.table("users").unwrap().applied,
        ["add column users.rewarded"]
    );
}

#[test]
fn test_legacy_column_name_is_renamed() {
    let conn = memory_with(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, age INTEGER,
            createdDate DATETIME DEFAULT CURRENT_TIMESTAMP, interest TEXT,
            rewarded INTEGER DEFAULT 0);
         INSERT INTO users (age, createdDate) VALUES (25, '2023-05-05 08:00:00');",
    );
    run_on(&conn);

    let created: String = conn
        .query_row("SELECT createdAt FROM users", [], |row| row.get(0))
        .unwrap();
    assert_eq!(created, "2023-05-05 08:00:00");
    assert!(describe_table(&conn, "users")
        .unwrap()
        .iter()
        .all(|c| c.name != "createdDate"));
}

#[test]
fn test_rename_fallback_copies_into_new_column() {
    // The dangling trigger makes the native RENAME COLUMN fail.
    let conn = memory_with(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, age INTEGER,
            createdDate DATETIME DEFAULT CURRENT_TIMESTAMP, interest TEXT,
            rewarded INTEGER DEFAULT 0);
         INSERT INTO users (age, createdDate) VALUES (25, '2023-05-05 08:00:00');
         CREATE TRIGGER users_touch AFTER UPDATE OF createdDate ON users
         BEGIN SELECT nope FROM missing; END;",
    );
    let report = run_on(&conn);

    let users = report.table("users").unwrap();
    assert!(users.failures.is_empty(), "{:?}", users.failures);
    assert_eq!(users.applied[0], "rename column users.createdDate to createdAt");
    assert!(users.applied[1].starts_with("rebuild table users"));
    assert!(users.history.contains(&TableState::Rebuilt));

    let created: String = conn
        .query_row("SELECT createdAt FROM users", [], |row| row.get(0))
        .unwrap();
    assert_eq!(created, "2023-05-05 08:00:00");
    assert!(describe_table(&conn, "users")
        .unwrap()
        .iter()
        .all(|c| c.name != "createdDate"));
    assert_converged(&conn, &target());
}

#[test]
fn test_half_renamed_column_keeps_alias_values() {
    let conn = memory_with(
        "CREATE TABLE users (id INTEGER PRIMARY KEY AUTOINCREMENT, age INTEGER,
            createdDate DATETIME DEFAULT CURRENT_TIMESTAMP, interest TEXT,
            rewarded INTEGER DEFAULT 0, createdAt DATETIME);
         INSERT INTO users (id, age, createdDate) VALUES (1, 25, '2023-05-05 08:00:00');
         INSERT INTO users (id, age, createdDate, createdAt)
            VALUES (2, 30, '2020-01-01 00:00:00', '2024-02-02 09:00:00');",
    );
    let report = run_on(&conn);

    assert!(report.table("users").unwrap().history.contains(&TableState::Rebuilt));
    let created: Vec<String> = conn
        .prepare("SELECT createdAt FROM users ORDER BY id")
        .unwrap()
        .query_map([], |row| row.get(0))
        .unwrap()
        .collect::<rusqlite::Result<_>>()
        .unwrap();
    assert_eq!(created, ["2023-05-05 08:00:00", "2024-02-02 09:00:00"]);
    assert!(describe_table(&conn, "users")
        .unwrap()
        .iter()
        .all(|c| c.name != "createdDate"));
}

#[test]
fn test_referenced_tables_are_migrated_first() {
    let catalog = Catalog::new(&[QUEST_LOGS, ITEMS, USERS], &[]).unwrap();
    let conn = Connection::open_in_memory().unwrap();

    let report = MigrationRunner::new(&conn, &catalog).run().unwrap();

    let order: Vec<&str> = report.tables.iter().map(|t| t.table.as_str()).collect();
    assert_eq!(order, ["items", "users", "questLogs"]);
    assert!(report.is_clean());
    assert_converged(&conn, &catalog);
}

#[test]
fn test_interrupted_rebuild_is_recovered() {
    let conn = memory_with(
        "CREATE TABLE users_new (id INTEGER PRIMARY KEY AUTOINCREMENT, age INTEGER,
            createdAt DATETIME DEFAULT CURRENT_TIMESTAMP, interest TEXT,
            rewarded INTEGER DEFAULT 0);
         INSERT INTO users_new (age) VALUES (50), (60);",
    );
    let report = run_on(&conn);

    assert_eq!(report.table("users").unwrap().recovered.as_deref(), Some("swapping"));
    assert!(!table_exists(&conn, "users_new").unwrap());
    assert_eq!(row_count(&conn, "users").unwrap(), 2);
}

#[test]
fn test_rejected_step_does_not_abort() {
    let conn = memory_with("CREATE VIEW users AS SELECT 1 AS id;");
    let report = run_on(&conn);

    let users = report.table("users").unwrap();
    assert!(!users.failures.is_empty());
    assert!(users
        .failures
        .iter()
        .all(|f| f.kind == FailureKind::Rejected));
    assert_eq!(users.state(), Some(TableState::Ready));

    assert!(table_exists(&conn, "items").unwrap());
    assert!(table_exists(&conn, "itemLogs").unwrap());
    assert!(report.table("items").unwrap().failures.is_empty());
    assert!(!report.is_clean());
}

#[test]
fn test_garbage_file_is_fatal() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.db");
    std::fs::write(&path, "definitely not a sqlite database, just text padding it out ".repeat(40))
        .unwrap();

    let conn = Connection::open(&path).unwrap();
    let err = MigrationRunner::new(&conn, &target()).run().unwrap_err();
    assert!(matches!(err, StorageError::Fatal { .. }), "{err}");
}

#[test]
fn test_plan_does_not_write() {
    let conn = memory_with(
        "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         CREATE TABLE quizLogs (id INTEGER PRIMARY KEY, quizId INTEGER);",
    );
    let before = schema_of(&conn);

    let plans = MigrationRunner::new(&conn, &target()).plan().unwrap();

    assert_eq!(schema_of(&conn), before);
    let items = plans.iter().find(|p| p.table == "items").unwrap();
    assert_eq!(items.steps.len(), 1);
    assert!(items.steps[0].starts_with("rebuild table items"));
    let users = plans.iter().find(|p| p.table == "users").unwrap();
    assert_eq!(users.steps, ["create table users"]);
    let legacy = plans.iter().find(|p| p.table == "quizLogs").unwrap();
    assert_eq!(legacy.steps, ["absorb table quizLogs into itemLogs"]);
}

#[test]
fn test_concurrent_instances_converge() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("shared.db");
    {
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT);
             INSERT INTO items (name) VALUES ('a'), ('b'), ('c');",
        )
        .unwrap();
    }

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            std::thread::spawn(move || {
                let conn = Connection::open(&path).unwrap();
                MigrationRunner::new(&conn, &target())
                    .run()
                    .map(|report| report.failures().all(|f| f.kind != FailureKind::Rejected))
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.join().unwrap().unwrap());
    }

    let conn = Connection::open(&path).unwrap();
    assert_converged(&conn, &target());
    assert_eq!(row_count(&conn, "items").unwrap(), 3);
}

mod property_tests {
    use super::*;
    use proptest::prelude::*;

    const OPTIONAL: [&str; 6] = [
        "description TEXT",
        "stair INTEGER",
        "x INTEGER DEFAULT 0",
        "img1 TEXT",
        "interests TEXT",
        "createdAt DATETIME DEFAULT CURRENT_TIMESTAMP",
    ];

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        /// Any earlier shape of items converges and keeps its rows
        #[test]
        fn prop_items_converge(mask in proptest::collection::vec(any::<bool>(), OPTIONAL.len()), rows in 0usize..5) {
            let mut columns = vec!["id INTEGER PRIMARY KEY", "name TEXT NOT NULL"];
            columns.extend(OPTIONAL.iter().zip(&mask).filter(|(_, keep)| **keep).map(|(c, _)| *c));

            let conn = memory_with(&format!("CREATE TABLE items ({})", columns.join(", ")));
            for i in 0..rows {
                conn.execute("INSERT INTO items (name) VALUES (?1)", [format!("item {i}")]).unwrap();
            }

            let report = run_on(&conn);

            prop_assert!(report.is_clean());
            prop_assert!(reconcile(&ITEMS, &snapshot(&conn, "items").unwrap()).is_empty());
            prop_assert_eq!(row_count(&conn, "items").unwrap(), rows as i64);
        }
    }
}
