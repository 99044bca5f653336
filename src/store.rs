use std::collections::HashSet;
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::debug;
use rusqlite::{Connection, OptionalExtension};

use crate::error::SyncError;
use crate::id::validate_id;
use crate::query::{self, Query};
use crate::schema::{SchemaRegistry, TableDefinition};
use crate::value::{ColumnType, Record, Value};

/// One entry in an [`LocalStore::execute_batch`] call: either an upsert or a
/// delete against a named table. A `null` entry (absent in this typed API)
/// is simply omitted by the caller.
#[derive(Debug, Clone)]
pub enum BatchOp {
    Upsert { table: String, data: Record },
    Delete { table: String, id: Value },
}

/// The result of `read`: the deserialized rows, plus the total count when
/// the originating query asked for one.
#[derive(Debug, Clone, Default)]
pub struct ReadResult {
    pub result: Vec<Record>,
    pub count: Option<i64>,
}

type Job = Box<dyn FnOnce(&Connection) + Send>;

struct Worker {
    sender: Option<mpsc::Sender<Job>>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(conn: Connection) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let handle = thread::Builder::new()
            .name("local-table-store".into())
            .spawn(move || {
                let conn = conn;
                while let Ok(job) = receiver.recv() {
                    job(&conn);
                }
            })
            .expect("failed to spawn local table store worker thread");
        Worker {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Enqueue `f` and block until the worker has run it. Every public
    /// store operation goes through this single-writer queue, which is
    /// what keeps transactional semantics intact under concurrent callers.
    fn submit<F, R>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&Connection) -> Result<R, SyncError> + Send + 'static,
        R: Send + 'static,
    {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| SyncError::validation("store is closed"))?;
        let (tx, rx) = mpsc::channel();
        let job: Job = Box::new(move |conn| {
            let _ = tx.send(f(conn));
        });
        sender
            .send(job)
            .map_err(|_| SyncError::validation("store is closed"))?;
        rx.recv()
            .map_err(|_| SyncError::validation("store worker terminated unexpectedly"))?
    }

    fn close(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.close();
    }
}

/// A typed, schema-evolving, transactional record store backed by SQLite.
/// Every public operation is routed through a single-writer task queue, so
/// readers and writers alike are serialized against the same connection.
pub struct LocalStore {
    worker: Worker,
    schema: Arc<Mutex<SchemaRegistry>>,
}

impl LocalStore {
    pub fn open(path: &str) -> Result<Self, SyncError> {
        debug!("opening local table store at '{path}'");
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(LocalStore {
            worker: Worker::spawn(conn),
            schema: Arc::new(Mutex::new(SchemaRegistry::new())),
        })
    }

    pub fn open_in_memory() -> Result<Self, SyncError> {
        let conn = Connection::open_in_memory()?;
        Ok(LocalStore {
            worker: Worker::spawn(conn),
            schema: Arc::new(Mutex::new(SchemaRegistry::new())),
        })
    }

    pub(crate) fn schema(&self) -> Arc<Mutex<SchemaRegistry>> {
        self.schema.clone()
    }

    /// Run `f` against the live connection inside the store's single-writer
    /// queue. Exposed to sibling modules (the operation log, the sync
    /// context) so that a data mutation and its operation-log entry can
    /// share one transaction.
    pub(crate) fn with_conn<F, R>(&self, f: F) -> Result<R, SyncError>
    where
        F: FnOnce(&Connection) -> Result<R, SyncError> + Send + 'static,
        R: Send + 'static,
    {
        self.worker.submit(f)
    }

    pub fn define_table(&self, def: TableDefinition) -> Result<(), SyncError> {
        def.validate()?;
        let schema = self.schema.clone();
        self.worker.submit(move |conn| {
            define_table_conn(conn, &def)?;
            schema.lock().unwrap().merge(def);
            Ok(())
        })
    }

    /// `None` entries in `records` are skipped, matching how a sparse array
    /// argument is handled on the public boundary.
    pub fn upsert(&self, table_name: &str, records: Vec<Option<Record>>) -> Result<(), SyncError> {
        let table = self.require_table(table_name)?;
        let records: Vec<Record> = records.into_iter().flatten().collect();
        self.worker.submit(move |conn| {
            let tx = conn.unchecked_transaction()?;
            upsert_rows(&tx, &table, &records)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn lookup(
        &self,
        table_name: &str,
        id: Value,
        suppress_not_found: bool,
    ) -> Result<Option<Record>, SyncError> {
        let table = self.require_table(table_name)?;
        self.worker.submit(move |conn| {
            let found = lookup_row(conn, &table, &id)?;
            match found {
                Some(row) => Ok(Some(row)),
                None if suppress_not_found => Ok(None),
                None => Err(SyncError::NotFound {
                    table: table.name.clone(),
                    id: id.to_string(),
                }),
            }
        })
    }

    pub fn del_ids(&self, table_name: &str, ids: Vec<Value>) -> Result<(), SyncError> {
        let table = self.require_table(table_name)?;
        self.worker.submit(move |conn| {
            let tx = conn.unchecked_transaction()?;
            delete_ids(&tx, &table, &ids)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn del_query(&self, query: Query) -> Result<(), SyncError> {
        let table = self.require_table(&query.table)?;
        self.worker.submit(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let ids = resolve_query_ids(&tx, &table, &query)?;
            delete_ids(&tx, &table, &ids)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn read(&self, query: Query) -> Result<ReadResult, SyncError> {
        let table = self.require_table(&query.table)?;
        self.worker.submit(move |conn| read_query(conn, &table, &query))
    }

    pub fn execute_batch(&self, ops: Vec<Option<BatchOp>>) -> Result<(), SyncError> {
        let schema = self.schema.clone();
        self.worker.submit(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for op in ops.into_iter().flatten() {
                match op {
                    BatchOp::Upsert { table, data } => {
                        let def = schema.lock().unwrap().require(&table)?.clone();
                        upsert_rows(&tx, &def, std::slice::from_ref(&data))?;
                    }
                    BatchOp::Delete { table, id } => {
                        let def = schema.lock().unwrap().require(&table)?.clone();
                        delete_ids(&tx, &def, std::slice::from_ref(&id))?;
                    }
                }
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn close(self) {
        // `Worker::drop` closes the channel and joins the thread.
    }

    fn require_table(&self, name: &str) -> Result<TableDefinition, SyncError> {
        self.schema.lock().unwrap().require(name).map(|t| t.clone())
    }
}

pub(crate) fn define_table_conn(conn: &Connection, def: &TableDefinition) -> Result<(), SyncError> {
    let table_exists: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name = ?1",
            rusqlite::params![def.name],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    if !table_exists {
        let id_type = def.id_type();
        let mut cols = Vec::new();
        for (name, ty) in &def.columns {
            if name == "id" {
                let collate = if id_type == ColumnType::String { " COLLATE NOCASE" } else { "" };
                cols.push(format!("\"id\" {} PRIMARY KEY{}", id_type.sql_type(), collate));
            } else {
                cols.push(format!("\"{name}\" {}", ty.sql_type()));
            }
        }
        let sql = format!("CREATE TABLE \"{}\" ({})", def.name, cols.join(", "));
        conn.execute(&sql, [])?;
    } else {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", def.name))?;
        let existing: HashSet<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<Result<_, _>>()?;
        for (name, ty) in &def.columns {
            if !existing.contains(name) {
                conn.execute(
                    &format!("ALTER TABLE \"{}\" ADD COLUMN \"{name}\" {}", def.name, ty.sql_type()),
                    [],
                )?;
            }
        }
    }
    Ok(())
}

pub(crate) fn upsert_rows(
    conn: &Connection,
    table: &TableDefinition,
    records: &[Record],
) -> Result<(), SyncError> {
    for record in records {
        let id_value = record
            .get("id")
            .ok_or_else(|| SyncError::validation("record is missing an 'id' field"))?;
        validate_id(id_value)?;

        let mut columns = Vec::with_capacity(table.columns.len());
        let mut placeholders = Vec::with_capacity(table.columns.len());
        let mut params: Vec<Value> = Vec::with_capacity(table.columns.len());
        let mut updates = Vec::with_capacity(table.columns.len());

        for (col, ty) in &table.columns {
            let raw = record.get(col).cloned().unwrap_or(Value::Null);
            let coerced = raw.coerce_to(*ty)?;
            columns.push(format!("\"{col}\""));
            placeholders.push("?".to_string());
            params.push(coerced);
            if col != "id" {
                updates.push(format!("\"{col}\" = excluded.\"{col}\""));
            }
        }

        let sql = if updates.is_empty() {
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(\"id\") DO NOTHING",
                table.name,
                columns.join(", "),
                placeholders.join(", ")
            )
        } else {
            format!(
                "INSERT INTO \"{}\" ({}) VALUES ({}) ON CONFLICT(\"id\") DO UPDATE SET {}",
                table.name,
                columns.join(", "),
                placeholders.join(", "),
                updates.join(", ")
            )
        };

        let param_refs: Vec<&dyn rusqlite::ToSql> =
            params.iter().map(|v| v as &dyn rusqlite::ToSql).collect();
        conn.execute(&sql, param_refs.as_slice())?;
    }
    Ok(())
}

pub(crate) fn delete_ids(
    conn: &Connection,
    table: &TableDefinition,
    ids: &[Value],
) -> Result<(), SyncError> {
    for id in ids.iter().filter(|v| !matches!(v, Value::Null)) {
        conn.execute(
            &format!("DELETE FROM \"{}\" WHERE \"id\" = ?1", table.name),
            rusqlite::params![id],
        )?;
    }
    Ok(())
}

pub(crate) fn lookup_row(
    conn: &Connection,
    table: &TableDefinition,
    id: &Value,
) -> Result<Option<Record>, SyncError> {
    let column_list = table
        .columns
        .keys()
        .map(|c| format!("\"{c}\""))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!("SELECT {column_list} FROM \"{}\" WHERE \"id\" = ?1", table.name);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(rusqlite::params![id])?;
    match rows.next()? {
        Some(row) => Ok(Some(row_to_record(row, table)?)),
        None => Ok(None),
    }
}

pub(crate) fn resolve_query_ids(
    conn: &Connection,
    table: &TableDefinition,
    q: &Query,
) -> Result<Vec<Value>, SyncError> {
    let statement = query::translate_ids(q, table);
    let mut stmt = conn.prepare(&statement.sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = statement
        .parameters
        .iter()
        .map(|v| v as &dyn rusqlite::ToSql)
        .collect();
    let id_type = table.id_type();
    let rows = stmt.query_map(param_refs.as_slice(), |row| Ok(row.get_ref(0)?.to_owned()))?;
    let mut ids = Vec::new();
    for row in rows {
        let raw = row?;
        ids.push(Value::decode(id_type, rusqlite::types::ValueRef::from(&raw))?);
    }
    Ok(ids)
}

pub(crate) fn read_query(
    conn: &Connection,
    table: &TableDefinition,
    q: &Query,
) -> Result<ReadResult, SyncError> {
    let statements = query::translate(q, table);
    let data_stmt = &statements[0];
    let mut stmt = conn.prepare(&data_stmt.sql)?;
    let param_refs: Vec<&dyn rusqlite::ToSql> = data_stmt
        .parameters
        .iter()
        .map(|v| v as &dyn rusqlite::ToSql)
        .collect();

    let selected_columns: Vec<String> = match &q.selection {
        Some(cols) if !cols.is_empty() => cols.clone(),
        _ => table.columns.keys().cloned().collect(),
    };

    let mut rows = stmt.query(param_refs.as_slice())?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        result.push(row_to_record_selected(row, table, &selected_columns)?);
    }

    let count = if statements.len() > 1 {
        let count_stmt = &statements[1];
        let mut cstmt = conn.prepare(&count_stmt.sql)?;
        let count_params: Vec<&dyn rusqlite::ToSql> = count_stmt
            .parameters
            .iter()
            .map(|v| v as &dyn rusqlite::ToSql)
            .collect();
        Some(cstmt.query_row(count_params.as_slice(), |r| r.get::<_, i64>(0))?)
    } else {
        None
    };

    Ok(ReadResult { result, count })
}

fn row_to_record(row: &rusqlite::Row<'_>, table: &TableDefinition) -> Result<Record, SyncError> {
    let columns: Vec<String> = table.columns.keys().cloned().collect();
    row_to_record_selected(row, table, &columns)
}

fn row_to_record_selected(
    row: &rusqlite::Row<'_>,
    table: &TableDefinition,
    columns: &[String],
) -> Result<Record, SyncError> {
    let mut record = Record::new();
    for col in columns {
        let ty = table
            .column_type(col)
            .ok_or_else(|| SyncError::validation(format!("unknown column '{col}'")))?;
        let idx = row.as_ref().column_index(col)?;
        let raw = row.get_ref(idx)?;
        record.insert(col.clone(), Value::decode(ty, raw)?);
    }
    Ok(record)
}
