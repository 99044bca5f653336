use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::error::SyncError;
use crate::id::{validate_id, value_from_id_string};
use crate::oplog::{OpAction, OperationEntry, OperationLog};
use crate::push_error::{PushError, UnhandledConflict};
use crate::query::{Filter, OrderBy, Query};
use crate::schema::TableDefinition;
use crate::store::{BatchOp, LocalStore, ReadResult};
use crate::transport::{RemoteTable, RemoteWriteOutcome};
use crate::value::{Record, Value};

/// Paging control for `pull`. `page_size` defaults to 50; pages are
/// requested until the server returns fewer records than this.
#[derive(Debug, Clone, Copy)]
pub struct PullSettings {
    pub page_size: i64,
}

impl Default for PullSettings {
    fn default() -> Self {
        PullSettings { page_size: 50 }
    }
}

/// What `push()` returns once the operation log has been fully walked:
/// every op either succeeded, was resolved by a handler, or -- for
/// conflicts the handler declined to resolve -- is reported here.
#[derive(Debug, Clone, Default)]
pub struct PushSummary {
    pub unhandled_conflicts: Vec<UnhandledConflict>,
}

/// The host-supplied resolution policy for push failures. The default
/// implementation resolves nothing, which surfaces every conflict as
/// unhandled and aborts push on the first non-conflict error -- the safe,
/// conservative default.
pub trait PushHandler: Send + Sync {
    fn on_conflict(&self, _push_error: &mut PushError) -> Result<(), SyncError> {
        Ok(())
    }

    fn on_error(&self, _push_error: &mut PushError) -> Result<(), SyncError> {
        Ok(())
    }
}

/// The default, no-op handler: every conflict is unhandled, every error
/// aborts push.
pub struct DefaultPushHandler;
impl PushHandler for DefaultPushHandler {}

enum PushStep {
    Done,
    Retry,
    UnhandledConflict(UnhandledConflict),
}

/// Orchestrates incremental pulls, push with per-item conflict/error
/// resolution, incremental sync cursors, and purge. This is the only
/// surface application code talks to for synced-table CRUD.
pub struct SyncContext {
    store: Arc<LocalStore>,
    oplog: Arc<OperationLog>,
    remote: Arc<dyn RemoteTable>,
    handler: Arc<dyn PushHandler>,
    table_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SyncContext {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteTable>,
        handler: Arc<dyn PushHandler>,
    ) -> Result<Self, SyncError> {
        let store = Arc::new(store);
        store.with_conn(|conn| OperationLog::init_schema(conn))?;
        Ok(SyncContext {
            store,
            oplog: Arc::new(OperationLog::new()),
            remote,
            handler,
            table_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn with_default_handler(store: LocalStore, remote: Arc<dyn RemoteTable>) -> Result<Self, SyncError> {
        Self::new(store, remote, Arc::new(DefaultPushHandler))
    }

    pub fn define_table(&self, def: TableDefinition) -> Result<(), SyncError> {
        self.store.define_table(def)
    }

    fn validate_table_name(&self, table: &str) -> Result<(), SyncError> {
        if table.is_empty() {
            return Err(SyncError::validation("table name must not be empty"));
        }
        Ok(())
    }

    fn table_lock(&self, table: &str) -> Arc<Mutex<()>> {
        self.table_locks
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ---- local CRUD -----------------------------------------------------

    pub fn insert(&self, table_name: &str, record: Record) -> Result<(), SyncError> {
        self.validate_table_name(table_name)?;
        let id_value = record
            .get("id")
            .cloned()
            .ok_or_else(|| SyncError::validation("record is missing an 'id' field"))?;
        let id = validate_id(&id_value)?;

        let schema = self.store.schema();
        let oplog = self.oplog.clone();
        let table = table_name.to_string();
        let id_str = id.to_string();

        self.store.with_conn(move |conn| {
            let def = schema.lock().unwrap().require(&table)?.clone();
            let tx = conn.unchecked_transaction()?;
            if crate::store::lookup_row(&tx, &def, &id_value)?.is_some() {
                return Err(SyncError::precondition(format!(
                    "'{id_str}' already exists in '{table}'"
                )));
            }
            crate::store::upsert_rows(&tx, &def, std::slice::from_ref(&record))?;
            oplog.log_mutation(&tx, &table, &id_str, OpAction::Insert)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn update(&self, table_name: &str, record: Record) -> Result<(), SyncError> {
        self.validate_table_name(table_name)?;
        let id_value = record
            .get("id")
            .cloned()
            .ok_or_else(|| SyncError::validation("record is missing an 'id' field"))?;
        let id = validate_id(&id_value)?;

        let schema = self.store.schema();
        let oplog = self.oplog.clone();
        let table = table_name.to_string();
        let id_str = id.to_string();

        self.store.with_conn(move |conn| {
            let def = schema.lock().unwrap().require(&table)?.clone();
            let tx = conn.unchecked_transaction()?;
            if crate::store::lookup_row(&tx, &def, &id_value)?.is_none() {
                return Err(SyncError::NotFound { table: table.clone(), id: id_str });
            }
            crate::store::upsert_rows(&tx, &def, std::slice::from_ref(&record))?;
            oplog.log_mutation(&tx, &table, &id_str, OpAction::Update)?;
            tx.commit()?;
            Ok(())
        })
    }

    pub fn del(&self, table_name: &str, id_value: Value) -> Result<(), SyncError> {
        self.validate_table_name(table_name)?;
        let id = validate_id(&id_value)?;

        let schema = self.store.schema();
        let oplog = self.oplog.clone();
        let table = table_name.to_string();
        let id_str = id.to_string();

        self.store.with_conn(move |conn| {
            let def = schema.lock().unwrap().require(&table)?.clone();
            let tx = conn.unchecked_transaction()?;
            crate::store::delete_ids(&tx, &def, std::slice::from_ref(&id_value))?;
            oplog.log_mutation(&tx, &table, &id_str, OpAction::Delete)?;
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
        self.store.lookup(table_name, id, suppress_not_found)
    }

    pub fn read(&self, query: Query) -> Result<ReadResult, SyncError> {
        self.store.read(query)
    }

    // ---- pull -------------------------------------------------------------

    pub fn pull(
        &self,
        query: Query,
        query_id: Option<&str>,
        settings: Option<PullSettings>,
    ) -> Result<(), SyncError> {
        let table_name = query.table.clone();
        self.validate_table_name(&table_name)?;
        let lock = self.table_lock(&table_name);
        let _guard = lock.lock().unwrap();

        debug!("pull '{table_name}' starting (queryId={query_id:?})");
        self.push_pending_before_pull(&table_name)?;

        let settings = settings.unwrap_or_default();
        let mut page_query = query;

        let mut cursor = None;
        if let Some(qid) = query_id {
            cursor = {
                let oplog = self.oplog.clone();
                let qid = qid.to_string();
                self.store.with_conn(move |conn| oplog.get_cursor(conn, &qid))?
            };
            if let Some(cursor_millis) = cursor {
                let cursor_filter = Filter::Gt("updatedAt".to_string(), Value::Integer(cursor_millis));
                page_query.filter = Some(match page_query.filter.take() {
                    Some(existing) => Filter::And(Box::new(existing), Box::new(cursor_filter)),
                    None => cursor_filter,
                });
            }
            page_query.order_by = vec![OrderBy::asc("updatedAt")];
        }

        let mut skip = page_query.skip.unwrap_or(0);
        let mut highest_seen = cursor;

        loop {
            let mut this_page = page_query.clone();
            this_page.top = Some(settings.page_size);
            this_page.skip = Some(skip);

            let page = self.remote.query(&this_page, settings.page_size)?;
            let returned = page.records.len() as i64;
            debug!("pull '{table_name}' integrating a page of {returned} record(s)");

            for pulled in &page.records {
                if pulled.deleted {
                    let id_value = pulled.record.get("id").cloned().ok_or_else(|| {
                        SyncError::validation("pulled record is missing an 'id' field")
                    })?;
                    self.store.del_ids(&table_name, vec![id_value])?;
                } else {
                    self.store.upsert(&table_name, vec![Some(pulled.record.clone())])?;
                }
                highest_seen = Some(match highest_seen {
                    Some(h) => h.max(pulled.updated_at_millis),
                    None => pulled.updated_at_millis,
                });
            }

            if let (Some(qid), Some(max_seen)) = (query_id, highest_seen) {
                let oplog = self.oplog.clone();
                let qid = qid.to_string();
                let table = table_name.clone();
                self.store
                    .with_conn(move |conn| oplog.set_cursor(conn, &qid, &table, max_seen))?;
            }

            if returned < settings.page_size {
                break;
            }
            skip += settings.page_size;
        }

        Ok(())
    }

    fn push_pending_before_pull(&self, table_name: &str) -> Result<(), SyncError> {
        let pending = {
            let oplog = self.oplog.clone();
            let table = table_name.to_string();
            self.store.with_conn(move |conn| oplog.count_for_table(conn, &table))?
        };
        if pending == 0 {
            return Ok(());
        }
        // `pull` already holds `table_name`'s lock for the duration of this call, so
        // the implicit push must not try to re-acquire it for ops on that table --
        // `std::sync::Mutex` is not reentrant and the calling thread would deadlock.
        self.push_internal(Some(table_name))?;
        let still_pending = {
            let oplog = self.oplog.clone();
            let table = table_name.to_string();
            self.store.with_conn(move |conn| oplog.count_for_table(conn, &table))?
        };
        if still_pending > 0 {
            return Err(SyncError::precondition(format!(
                "cannot pull '{table_name}': unresolved pending operations remain after push"
            )));
        }
        Ok(())
    }

    // ---- push ---------------------------------------------------------

    pub fn push(&self) -> Result<PushSummary, SyncError> {
        self.push_internal(None)
    }

    /// The shared implementation behind `push()`. `already_locked_table`, when set,
    /// names a table whose per-table lock the caller already holds (the implicit
    /// push-before-pull in `push_pending_before_pull`) -- ops against that table skip
    /// re-acquiring the lock instead of self-deadlocking on the non-reentrant mutex.
    fn push_internal(&self, already_locked_table: Option<&str>) -> Result<PushSummary, SyncError> {
        let mut unhandled_conflicts = Vec::new();

        loop {
            let entry = {
                let oplog = self.oplog.clone();
                self.store.with_conn(move |conn| oplog.peek_first(conn))?
            };
            let entry = match entry {
                Some(entry) => entry,
                None => break,
            };

            let held_by_caller = already_locked_table == Some(entry.table_name.as_str());
            let table_lock = (!held_by_caller).then(|| self.table_lock(&entry.table_name));
            let _guard = table_lock.as_ref().map(|lock| lock.lock().unwrap());

            self.oplog.lock(entry.seq)?;
            debug!(
                "pushing seq={} {}/{} action={:?}",
                entry.seq, entry.table_name, entry.record_id, entry.action
            );

            match self.push_one(&entry) {
                Ok(PushStep::Done) | Ok(PushStep::Retry) => {}
                Ok(PushStep::UnhandledConflict(conflict)) => {
                    warn!(
                        "unhandled conflict for {}/{}",
                        conflict.table_name, conflict.record_id
                    );
                    unhandled_conflicts.push(conflict);
                }
                Err(err) => {
                    self.oplog.unlock();
                    return Err(err);
                }
            }
        }

        Ok(PushSummary { unhandled_conflicts })
    }

    fn push_one(&self, entry: &OperationEntry) -> Result<PushStep, SyncError> {
        let def = self.store.schema().lock().unwrap().require(&entry.table_name)?.clone();
        let id_value = value_from_id_string(&entry.record_id, def.id_type())?;

        let client_record = if entry.action != OpAction::Delete {
            self.store.lookup(&entry.table_name, id_value.clone(), true)?
        } else {
            None
        };

        let version = client_record
            .as_ref()
            .and_then(|r| r.get("version"))
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let call_result = match entry.action {
            OpAction::Insert => {
                let record = client_record.clone().ok_or_else(|| {
                    SyncError::validation("pending insert has no corresponding local record")
                })?;
                self.remote.insert(&entry.table_name, &record)
            }
            OpAction::Update => {
                let record = client_record.clone().ok_or_else(|| {
                    SyncError::validation("pending update has no corresponding local record")
                })?;
                self.remote
                    .update(&entry.table_name, &entry.record_id, &record, version.as_deref())
            }
            OpAction::Delete => self.remote.delete(&entry.table_name, &entry.record_id, version.as_deref()),
        };

        match call_result {
            Ok(RemoteWriteOutcome::Applied { record, version }) => {
                if entry.action != OpAction::Delete {
                    if let Some(mut updated) = record.or_else(|| client_record.clone()) {
                        if let Some(v) = version {
                            updated.insert("version".to_string(), Value::String(v));
                        }
                        let table = entry.table_name.clone();
                        self.store
                            .execute_batch(vec![Some(BatchOp::Upsert { table, data: updated })])?;
                    }
                }
                let oplog = self.oplog.clone();
                self.store.with_conn(move |conn| oplog.remove_locked_op(conn))?;
                Ok(PushStep::Done)
            }
            Ok(RemoteWriteOutcome::Conflict { server_record }) => {
                let mut push_error = PushError::new(
                    self.store.clone(),
                    self.oplog.clone(),
                    self.store.schema(),
                    entry.clone(),
                    client_record,
                    server_record,
                    SyncError::Conflict {
                        table: entry.table_name.clone(),
                        id: entry.record_id.clone(),
                        server_record: None,
                    },
                );
                self.handler.on_conflict(&mut push_error)?;
                self.finish_push_error(push_error, true)
            }
            Err(err) => {
                let mut push_error = PushError::new(
                    self.store.clone(),
                    self.oplog.clone(),
                    self.store.schema(),
                    entry.clone(),
                    client_record,
                    None,
                    err,
                );
                self.handler.on_error(&mut push_error)?;
                self.finish_push_error(push_error, false)
            }
        }
    }

    fn finish_push_error(&self, push_error: PushError, is_conflict: bool) -> Result<PushStep, SyncError> {
        if !push_error.is_handled() {
            self.oplog.unlock();
            return if is_conflict {
                Ok(PushStep::UnhandledConflict(UnhandledConflict {
                    table_name: push_error.table_name().to_string(),
                    record_id: push_error.record_id().to_string(),
                    server_record: push_error.server_record().cloned(),
                }))
            } else {
                Err(push_error.into_underlying())
            };
        }

        if push_error.should_retry() {
            self.oplog.unlock();
            return Ok(PushStep::Retry);
        }
        if !push_error.is_resolved() {
            self.oplog.unlock();
        }
        Ok(PushStep::Done)
    }

    // ---- purge ----------------------------------------------------------

    pub fn purge(&self, query: Query, force: bool) -> Result<(), SyncError> {
        let table_name = query.table.clone();
        let def = self.store.schema().lock().unwrap().require(&table_name)?.clone();

        let pending = {
            let oplog = self.oplog.clone();
            let table = table_name.clone();
            self.store.with_conn(move |conn| oplog.count_for_table(conn, &table))?
        };
        if pending > 0 && !force {
            return Err(SyncError::precondition(format!(
                "'{table_name}' has pending operations; pass force to purge anyway"
            )));
        }

        let whole_table = query.targets_whole_table();
        let oplog = self.oplog.clone();
        let table = table_name.clone();

        self.store.with_conn(move |conn| {
            let tx = conn.unchecked_transaction()?;
            if force {
                oplog.remove_for_table(&tx, &table)?;
            }
            let ids = crate::store::resolve_query_ids(&tx, &def, &query)?;
            crate::store::delete_ids(&tx, &def, &ids)?;
            if whole_table {
                oplog.remove_cursors_for_table(&tx, &table)?;
            }
            tx.commit()?;
            Ok(())
        })
    }
}
