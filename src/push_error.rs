use std::sync::{Arc, Mutex};

use crate::error::SyncError;
use crate::id::value_from_id_string;
use crate::oplog::{OpAction, OperationEntry, OperationLog};
use crate::schema::SchemaRegistry;
use crate::store::{BatchOp, LocalStore};
use crate::value::Record;

/// Encapsulates a single failed push attempt. Offers resolution verbs that
/// each perform one transactional action against the store; calling a verb
/// more than once on the same instance is a programming error.
pub struct PushError {
    store: Arc<LocalStore>,
    oplog: Arc<OperationLog>,
    schema: Arc<Mutex<SchemaRegistry>>,
    op: OperationEntry,
    client_record: Option<Record>,
    server_record: Option<Record>,
    underlying: SyncError,
    is_handled: bool,
    resolved: bool,
    retry: bool,
}

impl PushError {
    pub(crate) fn new(
        store: Arc<LocalStore>,
        oplog: Arc<OperationLog>,
        schema: Arc<Mutex<SchemaRegistry>>,
        op: OperationEntry,
        client_record: Option<Record>,
        server_record: Option<Record>,
        underlying: SyncError,
    ) -> Self {
        PushError {
            store,
            oplog,
            schema,
            op,
            client_record,
            server_record,
            underlying,
            is_handled: false,
            resolved: false,
            retry: false,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.op.table_name
    }

    pub fn record_id(&self) -> &str {
        &self.op.record_id
    }

    pub fn action(&self) -> OpAction {
        self.op.action
    }

    pub fn client_record(&self) -> Option<&Record> {
        self.client_record.as_ref()
    }

    pub fn server_record(&self) -> Option<&Record> {
        self.server_record.as_ref()
    }

    pub fn error(&self) -> &SyncError {
        &self.underlying
    }

    pub(crate) fn into_underlying(self) -> SyncError {
        self.underlying
    }

    pub fn is_handled(&self) -> bool {
        self.is_handled
    }

    pub fn set_handled(&mut self, handled: bool) {
        self.is_handled = handled;
    }

    pub(crate) fn should_retry(&self) -> bool {
        self.resolved && self.retry
    }

    pub(crate) fn is_resolved(&self) -> bool {
        self.resolved
    }

    fn ensure_unresolved(&self) -> Result<(), SyncError> {
        if self.resolved {
            return Err(SyncError::AlreadyResolved {
                table: self.op.table_name.clone(),
                id: self.op.record_id.clone(),
            });
        }
        Ok(())
    }

    fn id_value(&self) -> Result<crate::value::Value, SyncError> {
        let schema = self.schema.lock().unwrap();
        let table = schema.require(&self.op.table_name)?;
        value_from_id_string(&self.op.record_id, table.id_type())
    }

    /// Discard the pending op and upsert `record` into the data table,
    /// then proceed to the next op. Both writes land in one transaction.
    pub fn cancel_and_update(&mut self, record: Record) -> Result<(), SyncError> {
        self.ensure_unresolved()?;
        let table = self.op.table_name.clone();
        let schema = self.schema.clone();
        let oplog = self.oplog.clone();
        self.store.with_conn(move |conn| {
            let def = schema.lock().unwrap().require(&table)?.clone();
            let tx = conn.unchecked_transaction()?;
            crate::store::upsert_rows(&tx, &def, std::slice::from_ref(&record))?;
            oplog.remove_locked_op(&tx)?;
            tx.commit()?;
            Ok(())
        })?;
        self.is_handled = true;
        self.resolved = true;
        self.retry = false;
        Ok(())
    }

    /// Discard the pending op and delete the local row, then proceed. Both
    /// writes land in one transaction.
    pub fn cancel_and_discard(&mut self) -> Result<(), SyncError> {
        self.ensure_unresolved()?;
        let id = self.id_value()?;
        let table = self.op.table_name.clone();
        let schema = self.schema.clone();
        let oplog = self.oplog.clone();
        self.store.with_conn(move |conn| {
            let def = schema.lock().unwrap().require(&table)?.clone();
            let tx = conn.unchecked_transaction()?;
            crate::store::delete_ids(&tx, &def, std::slice::from_ref(&id))?;
            oplog.remove_locked_op(&tx)?;
            tx.commit()?;
            Ok(())
        })?;
        self.is_handled = true;
        self.resolved = true;
        self.retry = false;
        Ok(())
    }

    /// Discard the pending op without touching the data table, then
    /// proceed.
    pub fn cancel(&mut self) -> Result<(), SyncError> {
        self.ensure_unresolved()?;
        self.remove_op()?;
        self.is_handled = true;
        self.resolved = true;
        self.retry = false;
        Ok(())
    }

    /// Upsert `record` and keep the op pending so push retries it.
    pub fn update(&mut self, record: Record) -> Result<(), SyncError> {
        self.ensure_unresolved()?;
        let table = self.op.table_name.clone();
        self.store.execute_batch(vec![Some(BatchOp::Upsert { table, data: record })])?;
        self.is_handled = true;
        self.resolved = true;
        self.retry = true;
        Ok(())
    }

    /// Replace the pending op's action and, for non-delete actions, upsert
    /// `record`; for delete, remove the local row. The op stays pending and
    /// push retries it under the new action. The data write and the action
    /// change land in one transaction.
    pub fn change_action(&mut self, action: OpAction, record: Option<Record>) -> Result<(), SyncError> {
        self.ensure_unresolved()?;
        let table = self.op.table_name.clone();
        let schema = self.schema.clone();
        let oplog = self.oplog.clone();
        let delete_id = if action == OpAction::Delete { Some(self.id_value()?) } else { None };
        self.store.with_conn(move |conn| {
            let def = schema.lock().unwrap().require(&table)?.clone();
            let tx = conn.unchecked_transaction()?;
            if let Some(id) = delete_id {
                crate::store::delete_ids(&tx, &def, std::slice::from_ref(&id))?;
            } else if let Some(record) = record {
                crate::store::upsert_rows(&tx, &def, std::slice::from_ref(&record))?;
            }
            oplog.replace_locked_action(&tx, action)?;
            tx.commit()?;
            Ok(())
        })?;
        self.is_handled = true;
        self.resolved = true;
        self.retry = true;
        Ok(())
    }

    fn remove_op(&self) -> Result<(), SyncError> {
        let oplog = self.oplog.clone();
        self.store.with_conn(move |conn| oplog.remove_locked_op(conn))
    }
}

/// An unhandled conflict surfaced at push completion: the caller's
/// `onConflict` handler left `isHandled == false`.
#[derive(Debug, Clone)]
pub struct UnhandledConflict {
    pub table_name: String,
    pub record_id: String,
    pub server_record: Option<Record>,
}
