use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::SyncError;

/// The action a pending operation-log entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpAction {
    Insert,
    Update,
    Delete,
}

impl OpAction {
    fn as_str(self) -> &'static str {
        match self {
            OpAction::Insert => "insert",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }

    fn parse(s: &str) -> Result<Self, SyncError> {
        match s {
            "insert" => Ok(OpAction::Insert),
            "update" => Ok(OpAction::Update),
            "delete" => Ok(OpAction::Delete),
            other => Err(SyncError::validation(format!("invalid op action '{other}'"))),
        }
    }
}

/// A durable record describing one pending local mutation.
#[derive(Debug, Clone)]
pub struct OperationEntry {
    pub seq: i64,
    pub table_name: String,
    pub record_id: String,
    pub action: OpAction,
}

/// What `coalesce` decided needs to happen to the operation-log row for a
/// `(table, id)` pair once a new local mutation is appended.
#[derive(Debug, Clone, Copy)]
pub(crate) enum LogWrite {
    Insert(OpAction),
    Replace(OpAction),
    Remove,
    Keep,
}

/// The coalescing algebra: combine an existing pending op (if any) with a
/// newly requested action for the same `(table, id)`. Derived directly from
/// the existing/new matrix; do not infer from surrounding code.
pub(crate) fn coalesce(existing: Option<OpAction>, new_action: OpAction) -> Result<LogWrite, SyncError> {
    use OpAction::*;
    Ok(match (existing, new_action) {
        (None, action) => LogWrite::Insert(action),
        (Some(Insert), Insert) => {
            return Err(SyncError::precondition("id already has a pending insert"))
        }
        (Some(Insert), Update) => LogWrite::Keep,
        (Some(Insert), Delete) => LogWrite::Remove,
        (Some(Update), Insert) => {
            return Err(SyncError::precondition("id already exists with a pending update"))
        }
        (Some(Update), Update) => LogWrite::Keep,
        (Some(Update), Delete) => LogWrite::Replace(Delete),
        (Some(Delete), Insert) => LogWrite::Replace(Update),
        (Some(Delete), Update) => {
            return Err(SyncError::precondition("no pending record to update"))
        }
        (Some(Delete), Delete) => LogWrite::Keep,
    })
}

/// Persistent, ordered record of pending local mutations, stored as an
/// ordinary table in the same store. The only in-process state it keeps is
/// the advisory single-op lock that push consults.
pub struct OperationLog {
    locked: Mutex<Option<i64>>,
}

impl Default for OperationLog {
    fn default() -> Self {
        OperationLog { locked: Mutex::new(None) }
    }
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn init_schema(conn: &Connection) -> Result<(), SyncError> {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS __operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    table_name TEXT NOT NULL,
    record_id TEXT NOT NULL,
    action TEXT NOT NULL,
    UNIQUE(table_name, record_id)
);

CREATE TABLE IF NOT EXISTS __cursors (
    query_id TEXT PRIMARY KEY,
    table_name TEXT NOT NULL,
    last_updated_at INTEGER NOT NULL
);
"#,
        )?;
        Ok(())
    }

    /// Resolve the single batch-op that, applied alongside the actual data
    /// mutation in the same transaction, persists the correct entry
    /// honoring the coalescing table.
    pub(crate) fn get_logging_operation(
        &self,
        conn: &Connection,
        table: &str,
        id: &str,
        action: OpAction,
    ) -> Result<LogWrite, SyncError> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT action FROM __operations WHERE table_name = ?1 AND record_id = ?2",
                params![table, id],
                |r| r.get(0),
            )
            .optional()?;
        let existing_action = existing.map(|s| OpAction::parse(&s)).transpose()?;
        coalesce(existing_action, action)
    }

    pub(crate) fn apply(
        &self,
        conn: &Connection,
        table: &str,
        id: &str,
        write: LogWrite,
    ) -> Result<(), SyncError> {
        match write {
            LogWrite::Insert(action) => {
                conn.execute(
                    "INSERT INTO __operations(table_name, record_id, action) VALUES (?1, ?2, ?3)",
                    params![table, id, action.as_str()],
                )?;
            }
            LogWrite::Replace(action) => {
                conn.execute(
                    "UPDATE __operations SET action = ?3 WHERE table_name = ?1 AND record_id = ?2",
                    params![table, id, action.as_str()],
                )?;
            }
            LogWrite::Remove => {
                conn.execute(
                    "DELETE FROM __operations WHERE table_name = ?1 AND record_id = ?2",
                    params![table, id],
                )?;
            }
            LogWrite::Keep => {}
        }
        Ok(())
    }

    /// Combined convenience used by the sync context's local CRUD path:
    /// resolve the coalescing outcome and apply it in one step.
    pub(crate) fn log_mutation(
        &self,
        conn: &Connection,
        table: &str,
        id: &str,
        action: OpAction,
    ) -> Result<(), SyncError> {
        let write = self.get_logging_operation(conn, table, id, action)?;
        self.apply(conn, table, id, write)
    }

    pub(crate) fn peek_first(&self, conn: &Connection) -> Result<Option<OperationEntry>, SyncError> {
        conn.query_row(
            "SELECT seq, table_name, record_id, action FROM __operations ORDER BY seq ASC LIMIT 1",
            [],
            |r| {
                let action: String = r.get(3)?;
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?, action))
            },
        )
        .optional()?
        .map(|(seq, table_name, record_id, action)| {
            Ok(OperationEntry { seq, table_name, record_id, action: OpAction::parse(&action)? })
        })
        .transpose()
    }

    pub(crate) fn lock(&self, seq: i64) -> Result<(), SyncError> {
        let mut guard = self.locked.lock().unwrap();
        if guard.is_some() {
            return Err(SyncError::precondition("another operation is already locked"));
        }
        *guard = Some(seq);
        Ok(())
    }

    pub(crate) fn unlock(&self) {
        *self.locked.lock().unwrap() = None;
    }

    pub(crate) fn locked_seq(&self) -> Option<i64> {
        *self.locked.lock().unwrap()
    }

    pub(crate) fn remove_locked_op(&self, conn: &Connection) -> Result<(), SyncError> {
        let seq = self
            .locked_seq()
            .ok_or_else(|| SyncError::precondition("no operation is currently locked"))?;
        conn.execute("DELETE FROM __operations WHERE seq = ?1", params![seq])?;
        self.unlock();
        Ok(())
    }

    pub(crate) fn replace_locked_action(&self, conn: &Connection, action: OpAction) -> Result<(), SyncError> {
        let seq = self
            .locked_seq()
            .ok_or_else(|| SyncError::precondition("no operation is currently locked"))?;
        conn.execute(
            "UPDATE __operations SET action = ?2 WHERE seq = ?1",
            params![seq, action.as_str()],
        )?;
        Ok(())
    }

    pub(crate) fn count_for_table(&self, conn: &Connection, table: &str) -> Result<i64, SyncError> {
        conn.query_row(
            "SELECT COUNT(*) FROM __operations WHERE table_name = ?1",
            params![table],
            |r| r.get(0),
        )
        .map_err(Into::into)
    }

    pub(crate) fn remove_for_table(&self, conn: &Connection, table: &str) -> Result<(), SyncError> {
        conn.execute("DELETE FROM __operations WHERE table_name = ?1", params![table])?;
        Ok(())
    }

    pub(crate) fn get_cursor(&self, conn: &Connection, query_id: &str) -> Result<Option<i64>, SyncError> {
        conn.query_row(
            "SELECT last_updated_at FROM __cursors WHERE query_id = ?1",
            params![query_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(Into::into)
    }

    pub(crate) fn set_cursor(
        &self,
        conn: &Connection,
        query_id: &str,
        table: &str,
        last_updated_at: i64,
    ) -> Result<(), SyncError> {
        conn.execute(
            "INSERT INTO __cursors(query_id, table_name, last_updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(query_id) DO UPDATE SET last_updated_at = excluded.last_updated_at",
            params![query_id, table, last_updated_at],
        )?;
        Ok(())
    }

    pub(crate) fn remove_cursors_for_table(&self, conn: &Connection, table: &str) -> Result<(), SyncError> {
        conn.execute("DELETE FROM __cursors WHERE table_name = ?1", params![table])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coalesces_per_the_invariant_table() {
        use OpAction::*;

        assert!(matches!(coalesce(None, Insert).unwrap(), LogWrite::Insert(Insert)));
        assert!(matches!(coalesce(Some(Insert), Update).unwrap(), LogWrite::Keep));
        assert!(matches!(coalesce(Some(Insert), Delete).unwrap(), LogWrite::Remove));
        assert!(coalesce(Some(Insert), Insert).is_err());

        assert!(matches!(coalesce(Some(Update), Update).unwrap(), LogWrite::Keep));
        assert!(matches!(coalesce(Some(Update), Delete).unwrap(), LogWrite::Replace(Delete)));
        assert!(coalesce(Some(Update), Insert).is_err());

        assert!(matches!(coalesce(Some(Delete), Insert).unwrap(), LogWrite::Replace(Update)));
        assert!(matches!(coalesce(Some(Delete), Delete).unwrap(), LogWrite::Keep));
        assert!(coalesce(Some(Delete), Update).is_err());
    }
}
