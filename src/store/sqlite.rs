use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use serde_json::Value;

use super::{
    Connector, Item, Key, KeySchema, ScanPage, TableDef, TableStore, TransactItem, WriteRequest,
};
use crate::config::StoreConfig;
use crate::error::StoreError;

/// Database schema version.
///
/// Bump this when introducing a new migration.
const SCHEMA_VERSION: i64 = 1;

/// How long a connection waits for another writer before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens a [`SqliteStore`] on the configured database file.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteConnector;

impl Connector for SqliteConnector {
    type Store = SqliteStore;

    async fn connect(&self, config: &StoreConfig) -> Result<SqliteStore, StoreError> {
        SqliteStore::open(
            &config.endpoint,
            &config.tables().definitions(),
            config.scan_page_size,
        )
    }
}

/// Table store on top of a single SQLite connection.
///
/// Each logical table is a SQLite table of `(hash_key, range_key, item)` where
/// `item` is the JSON-encoded attribute map. Tables without a range attribute
/// store an empty `range_key`.
///
/// `rusqlite::Connection` is `Send` but not `Sync`; a store is owned by exactly
/// one handle, so no locking is needed.
pub struct SqliteStore {
    conn: Option<Connection>,
    path: PathBuf,
    tables: HashMap<String, KeySchema>,
    page_size: usize,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path` and make sure every table exists.
    pub fn open(path: &Path, tables: &[TableDef], page_size: usize) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("create data dir {}: {e}", parent.display()))
            })?;
        }

        let mut conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        // WAL so that a reader in another process does not block the writer.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        // Handles opened concurrently on a fresh file serialize on this write lock.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        migrate(&tx)?;
        for def in tables {
            ensure_table(&tx, def)?;
        }
        tx.commit()?;

        log::debug!("opened sqlite store at {}", path.display());

        Ok(Self {
            conn: Some(conn),
            path: path.to_path_buf(),
            tables: tables.iter().map(|d| (d.name.clone(), d.key)).collect(),
            page_size: page_size.max(1),
        })
    }

    pub fn is_open(&self) -> bool {
        self.conn.is_some()
    }

    fn conn_mut(&mut self) -> Result<&mut Connection, StoreError> {
        self.conn.as_mut().ok_or(StoreError::Closed)
    }

    fn schema(&self, table: &str) -> Result<KeySchema, StoreError> {
        self.tables
            .get(table)
            .copied()
            .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
    }

    fn scan_page(&mut self, table: &str, start: Option<Key>) -> Result<ScanPage, StoreError> {
        self.schema(table)?;
        let limit = self.page_size;
        let ident = quote_ident(table);
        let conn = self.conn_mut()?;

        let rows: Vec<(Key, Item)> = match start {
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT hash_key, range_key, item FROM {ident}
                     ORDER BY hash_key, range_key
                     LIMIT ?1"
                ))?;
                let mapped = stmt.query_map(params![limit as i64], row_to_entry)?;
                let rows = mapped.collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
            Some(start) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT hash_key, range_key, item FROM {ident}
                     WHERE (hash_key, range_key) > (?1, ?2)
                     ORDER BY hash_key, range_key
                     LIMIT ?3"
                ))?;
                let mapped = stmt.query_map(
                    params![start.hash, range_column(&start), limit as i64],
                    row_to_entry,
                )?;
                let rows = mapped.collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            }
        };

        // A full page means there may be more; like a real scan API this can
        // hand out a key whose next page turns out to be empty.
        let last_evaluated_key = if rows.len() == limit {
            rows.last().map(|(key, _)| key.clone())
        } else {
            None
        };

        Ok(ScanPage {
            items: rows.into_iter().map(|(_, item)| item).collect(),
            last_evaluated_key,
        })
    }

    fn write_batch(&mut self, table: &str, requests: Vec<WriteRequest>) -> Result<(), StoreError> {
        let schema = self.schema(table)?;
        let ident = quote_ident(table);
        let conn = self.conn_mut()?;

        // Deliberately no enclosing transaction: entries land one by one.
        for request in requests {
            match request {
                WriteRequest::Put(item) => {
                    let key = schema.key_of(table, &item)?;
                    put_item(conn, &ident, &key, &item)?;
                }
                WriteRequest::Delete(key) => {
                    conn.execute(
                        &format!("DELETE FROM {ident} WHERE hash_key = ?1 AND range_key = ?2"),
                        params![key.hash, range_column(&key)],
                    )?;
                }
            }
        }
        Ok(())
    }

    fn write_transaction(&mut self, items: Vec<TransactItem>) -> Result<(), StoreError> {
        let schemas = self.tables.clone();
        let conn = self.conn_mut()?;
        // Take the write lock up front so a concurrent writer is waited on
        // through the busy timeout instead of failing mid-transaction.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        for entry in items {
            match entry {
                TransactItem::UpdateExisting { table, key, set } => {
                    let schema = lookup_schema(&schemas, &table)?;
                    update_existing(&tx, &table, schema, &key, set)?;
                }
                TransactItem::InsertNew { table, item } => {
                    let schema = lookup_schema(&schemas, &table)?;
                    let key = schema.key_of(&table, &item)?;
                    insert_new(&tx, &table, &key, &item)?;
                }
            }
        }

        // Dropping `tx` on any early return above rolls everything back.
        tx.commit()?;
        Ok(())
    }
}

impl TableStore for SqliteStore {
    async fn scan(
        &mut self,
        table: &str,
        exclusive_start_key: Option<Key>,
    ) -> Result<ScanPage, StoreError> {
        self.scan_page(table, exclusive_start_key)
    }

    async fn batch_write(
        &mut self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> Result<(), StoreError> {
        self.write_batch(table, requests)
    }

    async fn transact_write(&mut self, items: Vec<TransactItem>) -> Result<(), StoreError> {
        self.write_transaction(items)
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            match conn.close() {
                Ok(()) => log::debug!("closed sqlite store at {}", self.path.display()),
                Err((_, e)) => log::warn!("failed to close sqlite store cleanly: {}", e),
            }
        }
    }
}

impl Drop for SqliteStore {
    fn drop(&mut self) {
        self.close();
    }
}

fn lookup_schema(
    schemas: &HashMap<String, KeySchema>,
    table: &str,
) -> Result<KeySchema, StoreError> {
    schemas
        .get(table)
        .copied()
        .ok_or_else(|| StoreError::UnknownTable(table.to_string()))
}

fn update_existing(
    tx: &Transaction<'_>,
    table: &str,
    schema: KeySchema,
    key: &Key,
    set: Item,
) -> Result<(), StoreError> {
    let ident = quote_ident(table);
    let current: Option<String> = tx
        .query_row(
            &format!("SELECT item FROM {ident} WHERE hash_key = ?1 AND range_key = ?2"),
            params![key.hash, range_column(key)],
            |r| r.get(0),
        )
        .optional()?;

    let Some(current) = current else {
        return Err(StoreError::ConditionFailed {
            table: table.to_string(),
            key: key.to_string(),
        });
    };

    let mut item = parse_item(table, &current)?;
    for (attr, value) in set {
        if schema.is_key_attr(&attr) {
            return Err(StoreError::InvalidItem {
                table: table.to_string(),
                reason: format!("cannot update key attribute {attr}"),
            });
        }
        item.insert(attr, value);
    }

    tx.execute(
        &format!("UPDATE {ident} SET item = ?3 WHERE hash_key = ?1 AND range_key = ?2"),
        params![key.hash, range_column(key), serde_json::to_string(&item)?],
    )?;
    Ok(())
}

fn insert_new(tx: &Transaction<'_>, table: &str, key: &Key, item: &Item) -> Result<(), StoreError> {
    let ident = quote_ident(table);
    let exists: Option<i64> = tx
        .query_row(
            &format!("SELECT 1 FROM {ident} WHERE hash_key = ?1 AND range_key = ?2"),
            params![key.hash, range_column(key)],
            |r| r.get(0),
        )
        .optional()?;
    if exists.is_some() {
        return Err(StoreError::ConditionFailed {
            table: table.to_string(),
            key: key.to_string(),
        });
    }

    tx.execute(
        &format!("INSERT INTO {ident} (hash_key, range_key, item) VALUES (?1, ?2, ?3)"),
        params![key.hash, range_column(key), serde_json::to_string(item)?],
    )?;
    Ok(())
}

fn put_item(conn: &Connection, ident: &str, key: &Key, item: &Item) -> Result<(), StoreError> {
    conn.execute(
        &format!(
            "INSERT INTO {ident} (hash_key, range_key, item) VALUES (?1, ?2, ?3)
             ON CONFLICT(hash_key, range_key) DO UPDATE SET item = excluded.item"
        ),
        params![key.hash, range_column(key), serde_json::to_string(item)?],
    )?;
    Ok(())
}

fn range_column(key: &Key) -> &str {
    key.range.as_deref().unwrap_or("")
}

fn parse_item(table: &str, raw: &str) -> Result<Item, StoreError> {
    match serde_json::from_str::<Value>(raw)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::InvalidItem {
            table: table.to_string(),
            reason: format!("stored item is not an object: {other}"),
        }),
    }
}

/// Helper function to convert a table row to its key and attribute map.
fn row_to_entry(row: &Row) -> rusqlite::Result<(Key, Item)> {
    let hash: String = row.get(0)?;
    let range: String = row.get(1)?;
    let raw: String = row.get(2)?;

    let item = match serde_json::from_str::<Value>(&raw) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(rusqlite::Error::InvalidQuery),
        Err(e) => {
            return Err(rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))
        }
    };

    let key = Key {
        hash,
        range: if range.is_empty() { None } else { Some(range) },
    };
    Ok((key, item))
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Create the table for `def` if missing and check that an existing one was
/// registered with the same key layout.
fn ensure_table(conn: &Connection, def: &TableDef) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO table_registry (name, hash_attr, range_attr) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![def.name, def.key.hash_attr, def.key.range_attr],
    )?;

    let (hash_attr, range_attr): (String, Option<String>) = conn.query_row(
        "SELECT hash_attr, range_attr FROM table_registry WHERE name = ?1",
        params![def.name],
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if hash_attr != def.key.hash_attr || range_attr.as_deref() != def.key.range_attr {
        return Err(StoreError::Unavailable(format!(
            "table {} exists with key ({}, {:?}), expected ({}, {:?})",
            def.name, hash_attr, range_attr, def.key.hash_attr, def.key.range_attr
        )));
    }

    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS {} (
          hash_key TEXT NOT NULL,
          range_key TEXT NOT NULL DEFAULT '',
          item TEXT NOT NULL,
          PRIMARY KEY (hash_key, range_key)
        ) WITHOUT ROWID;
        "#,
        quote_ident(&def.name)
    ))?;
    Ok(())
}

/// Apply migrations to bring database to current schema.
fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL
        );
        "#,
    )?;

    let existing: Option<String> = conn
        .query_row(
            r#"SELECT value FROM meta WHERE key = 'schema_version'"#,
            [],
            |r| r.get(0),
        )
        .optional()?;

    let current_version: i64 = existing
        .as_deref()
        .and_then(|s| s.parse::<i64>().ok())
        .unwrap_or(0);

    if current_version > SCHEMA_VERSION {
        return Err(StoreError::Unavailable(format!(
            "db schema version {} is newer than supported {}",
            current_version, SCHEMA_VERSION
        )));
    }

    if current_version == 0 {
        migration_v1(conn)?;
        set_schema_version(conn, 1)?;
    }

    Ok(())
}

fn set_schema_version(conn: &Connection, v: i64) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO meta(key, value) VALUES('schema_version', ?1)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![v.to_string()],
    )?;
    Ok(())
}

fn migration_v1(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS table_registry (
          name TEXT PRIMARY KEY,
          hash_attr TEXT NOT NULL,
          range_attr TEXT NULL
        );
        "#,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HISTORY_KEY, PROGRAM_KEY};
    use serde_json::json;

    fn defs() -> Vec<TableDef> {
        vec![
            TableDef {
                name: "test-Program".into(),
                key: PROGRAM_KEY,
            },
            TableDef {
                name: "test-ProgramHistory".into(),
                key: HISTORY_KEY,
            },
        ]
    }

    fn setup_store(page_size: usize) -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("store.sqlite3"), &defs(), page_size).unwrap();
        (dir, store)
    }

    fn item(value: Value) -> Item {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn program(pid: &str, title: &str) -> Item {
        item(json!({"pid": pid, "title": title, "status": "Pending"}))
    }

    #[test]
    fn test_put_then_scan() {
        let (_dir, mut store) = setup_store(10);
        store
            .write_batch(
                "test-Program",
                vec![
                    WriteRequest::Put(program("b", "Second")),
                    WriteRequest::Put(program("a", "First")),
                ],
            )
            .unwrap();

        let page = store.scan_page("test-Program", None).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.last_evaluated_key.is_none());
        assert_eq!(page.items[0]["pid"], "a");
    }

    #[test]
    fn test_scan_paginates_with_trailing_empty_page() {
        let (_dir, mut store) = setup_store(2);
        let puts = ["p1", "p2", "p3", "p4"]
            .iter()
            .map(|pid| WriteRequest::Put(program(pid, "x")))
            .collect();
        store.write_batch("test-Program", puts).unwrap();

        let first = store.scan_page("test-Program", None).unwrap();
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.last_evaluated_key, Some(Key::hash("p2")));

        let second = store.scan_page("test-Program", first.last_evaluated_key).unwrap();
        assert_eq!(second.items.len(), 2);
        assert_eq!(second.last_evaluated_key, Some(Key::hash("p4")));

        let third = store.scan_page("test-Program", second.last_evaluated_key).unwrap();
        assert!(third.items.is_empty());
        assert!(third.last_evaluated_key.is_none());
    }

    #[test]
    fn test_put_overwrites_and_delete_removes() {
        let (_dir, mut store) = setup_store(10);
        store
            .write_batch("test-Program", vec![WriteRequest::Put(program("a", "Old"))])
            .unwrap();
        store
            .write_batch("test-Program", vec![WriteRequest::Put(program("a", "New"))])
            .unwrap();

        let page = store.scan_page("test-Program", None).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0]["title"], "New");

        store
            .write_batch("test-Program", vec![WriteRequest::Delete(Key::hash("a"))])
            .unwrap();
        assert!(store.scan_page("test-Program", None).unwrap().items.is_empty());
    }

    #[test]
    fn test_transaction_updates_and_inserts() {
        let (_dir, mut store) = setup_store(10);
        store
            .write_batch("test-Program", vec![WriteRequest::Put(program("a", "First"))])
            .unwrap();

        store
            .write_transaction(vec![
                TransactItem::UpdateExisting {
                    table: "test-Program".into(),
                    key: Key::hash("a"),
                    set: item(json!({"status": "Success"})),
                },
                TransactItem::InsertNew {
                    table: "test-ProgramHistory".into(),
                    item: item(json!({"pid": "a", "downloadTime": "2024-05-01T10:00:00Z", "status": "Success"})),
                },
            ])
            .unwrap();

        let programs = store.scan_page("test-Program", None).unwrap();
        assert_eq!(programs.items[0]["status"], "Success");
        assert_eq!(programs.items[0]["title"], "First");

        let history = store.scan_page("test-ProgramHistory", None).unwrap();
        assert_eq!(history.items.len(), 1);
    }

    #[test]
    fn test_transaction_is_all_or_nothing() {
        let (_dir, mut store) = setup_store(10);
        store
            .write_batch("test-Program", vec![WriteRequest::Put(program("a", "First"))])
            .unwrap();

        let err = store
            .write_transaction(vec![
                TransactItem::UpdateExisting {
                    table: "test-Program".into(),
                    key: Key::hash("a"),
                    set: item(json!({"status": "Success"})),
                },
                TransactItem::UpdateExisting {
                    table: "test-Program".into(),
                    key: Key::hash("missing"),
                    set: item(json!({"status": "Error"})),
                },
            ])
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));

        let programs = store.scan_page("test-Program", None).unwrap();
        assert_eq!(programs.items[0]["status"], "Pending");
    }

    #[test]
    fn test_insert_new_refuses_existing_item() {
        let (_dir, mut store) = setup_store(10);
        let row = item(json!({"pid": "a", "downloadTime": "2024-05-01T10:00:00Z"}));
        store
            .write_transaction(vec![TransactItem::InsertNew {
                table: "test-ProgramHistory".into(),
                item: row.clone(),
            }])
            .unwrap();

        let err = store
            .write_transaction(vec![TransactItem::InsertNew {
                table: "test-ProgramHistory".into(),
                item: row,
            }])
            .unwrap_err();
        assert!(matches!(err, StoreError::ConditionFailed { .. }));
    }

    #[test]
    fn test_update_cannot_touch_key() {
        let (_dir, mut store) = setup_store(10);
        store
            .write_batch("test-Program", vec![WriteRequest::Put(program("a", "First"))])
            .unwrap();
        let err = store
            .write_transaction(vec![TransactItem::UpdateExisting {
                table: "test-Program".into(),
                key: Key::hash("a"),
                set: item(json!({"pid": "b"})),
            }])
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidItem { .. }));
    }

    #[test]
    fn test_unknown_table_and_closed_store() {
        let (_dir, mut store) = setup_store(10);
        assert!(matches!(
            store.scan_page("nope", None),
            Err(StoreError::UnknownTable(_))
        ));

        store.close();
        store.close();
        assert!(!store.is_open());
        assert!(matches!(
            store.scan_page("test-Program", None),
            Err(StoreError::Closed)
        ));
    }

    #[test]
    fn test_reopen_keeps_data_and_checks_key_layout() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.sqlite3");
        {
            let mut store = SqliteStore::open(&path, &defs(), 10).unwrap();
            store
                .write_batch("test-Program", vec![WriteRequest::Put(program("a", "Kept"))])
                .unwrap();
        }

        let mut store = SqliteStore::open(&path, &defs(), 10).unwrap();
        assert_eq!(store.scan_page("test-Program", None).unwrap().items.len(), 1);
        store.close();

        let mismatched = vec![TableDef {
            name: "test-Program".into(),
            key: HISTORY_KEY,
        }];
        assert!(matches!(
            SqliteStore::open(&path, &mismatched, 10),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_concurrent_open_on_fresh_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.sqlite3");
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    SqliteStore::open(&path, &defs(), 10).map(|mut store| store.close())
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        let conn = Connection::open(&path).unwrap();
        let registered: i64 = conn
            .query_row("SELECT COUNT(*) FROM table_registry", [], |r| r.get(0))
            .unwrap();
        assert_eq!(registered, 2);
    }

    #[test]
    fn test_concurrent_transactions_wait_for_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("busy.sqlite3");
        {
            let mut store = SqliteStore::open(&path, &defs(), 10).unwrap();
            store
                .write_batch("test-Program", vec![WriteRequest::Put(program("a", "Shared"))])
                .unwrap();
        }
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(6));

        let workers: Vec<_> = (0..6)
            .map(|i| {
                let path = path.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let mut store = SqliteStore::open(&path, &defs(), 10)?;
                    barrier.wait();
                    store.write_transaction(vec![
                        TransactItem::UpdateExisting {
                            table: "test-Program".into(),
                            key: Key::hash("a"),
                            set: item(json!({"status": "Success"})),
                        },
                        TransactItem::InsertNew {
                            table: "test-ProgramHistory".into(),
                            item: item(json!({
                                "pid": "a",
                                "downloadTime": format!("2024-05-01T10:00:0{i}Z"),
                                "status": "Success"
                            })),
                        },
                    ])
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap().unwrap();
        }

        let mut store = SqliteStore::open(&path, &defs(), 10).unwrap();
        assert_eq!(
            store.scan_page("test-ProgramHistory", None).unwrap().items.len(),
            6
        );
    }
}
