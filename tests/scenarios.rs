use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use sync_engine::{
    ColumnType, PulledRecord, PushError, PushHandler, Query, Record, RemotePage, RemoteTable,
    RemoteWriteOutcome, SyncContext, SyncError, TableDefinition, Value,
};

fn rec(pairs: &[(&str, Value)]) -> Record {
    pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
}

fn table_t() -> TableDefinition {
    TableDefinition::new("t")
        .with_column("id", ColumnType::String)
        .with_column("v", ColumnType::Integer)
        .with_column("version", ColumnType::String)
}

fn new_context(remote: Arc<dyn RemoteTable>) -> SyncContext {
    let _ = env_logger::try_init();
    let store = sync_engine::LocalStore::open_in_memory().unwrap();
    let ctx = SyncContext::with_default_handler(store, remote).unwrap();
    ctx.define_table(table_t()).unwrap();
    ctx
}

/// Scripted remote: write calls pop a canned outcome off a queue, query calls pop a
/// canned page. Used wherever a scenario needs a specific server response rather than
/// an echoing one.
#[derive(Default)]
struct ScriptedRemote {
    write_outcomes: Mutex<VecDeque<RemoteWriteOutcome>>,
    query_pages: Mutex<VecDeque<RemotePage>>,
    inserted: Mutex<Vec<(String, Record)>>,
    updated: Mutex<Vec<(String, String, Record, Option<String>)>>,
}

impl ScriptedRemote {
    fn with_write_outcomes(outcomes: Vec<RemoteWriteOutcome>) -> Self {
        ScriptedRemote {
            write_outcomes: Mutex::new(outcomes.into()),
            ..Default::default()
        }
    }

    fn with_pages(pages: Vec<RemotePage>) -> Self {
        ScriptedRemote {
            query_pages: Mutex::new(pages.into()),
            ..Default::default()
        }
    }
}

impl RemoteTable for ScriptedRemote {
    fn insert(&self, table: &str, record: &Record) -> Result<RemoteWriteOutcome, SyncError> {
        self.inserted.lock().unwrap().push((table.to_string(), record.clone()));
        Ok(self
            .write_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RemoteWriteOutcome::Applied { record: None, version: None }))
    }

    fn update(
        &self,
        table: &str,
        id: &str,
        record: &Record,
        version: Option<&str>,
    ) -> Result<RemoteWriteOutcome, SyncError> {
        self.updated.lock().unwrap().push((
            table.to_string(),
            id.to_string(),
            record.clone(),
            version.map(str::to_string),
        ));
        Ok(self
            .write_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RemoteWriteOutcome::Applied { record: None, version: None }))
    }

    fn delete(&self, _table: &str, _id: &str, _version: Option<&str>) -> Result<RemoteWriteOutcome, SyncError> {
        Ok(self
            .write_outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(RemoteWriteOutcome::Applied { record: None, version: None }))
    }

    fn query(&self, _query: &Query, _page_size: i64) -> Result<RemotePage, SyncError> {
        Ok(self.query_pages.lock().unwrap().pop_front().unwrap_or_default())
    }
}

struct CancelAndUpdateHandler;
impl PushHandler for CancelAndUpdateHandler {
    fn on_conflict(&self, push_error: &mut PushError) -> Result<(), SyncError> {
        let server_record = push_error.server_record().cloned().expect("conflict carries a server record");
        push_error.cancel_and_update(server_record)
    }
}

#[test]
fn s1_insert_then_push() {
    let remote = Arc::new(ScriptedRemote::with_write_outcomes(vec![RemoteWriteOutcome::Applied {
        record: Some(rec(&[("id", Value::String("a".into())), ("v", Value::Integer(1))])),
        version: None,
    }]));
    let ctx = new_context(remote.clone());

    ctx.insert("t", rec(&[("id", Value::String("a".into())), ("v", Value::Integer(1))])).unwrap();

    let summary = ctx.push().unwrap();
    assert!(summary.unhandled_conflicts.is_empty());

    let row = ctx.lookup("t", Value::String("a".into()), false).unwrap().unwrap();
    assert_eq!(row.get("v"), Some(&Value::Integer(1)));

    let calls = remote.inserted.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "t");
}

#[test]
fn s2_insert_then_delete_coalesces() {
    let remote = Arc::new(ScriptedRemote::default());
    let ctx = new_context(remote);

    ctx.insert("t", rec(&[("id", Value::String("b".into())), ("v", Value::Integer(2))])).unwrap();
    ctx.del("t", Value::String("b".into())).unwrap();

    assert!(ctx.lookup("t", Value::String("b".into()), true).unwrap().is_none());

    let summary = ctx.push().unwrap();
    assert!(summary.unhandled_conflicts.is_empty());
}

#[test]
fn s3_update_then_delete_replaces_with_delete() {
    let prepull = Arc::new(ScriptedRemote::with_pages(vec![RemotePage {
        records: vec![PulledRecord {
            record: rec(&[("id", Value::String("c".into())), ("v", Value::Integer(3))]),
            deleted: false,
            updated_at_millis: 1,
        }],
        total_count: None,
    }]));
    let ctx = new_context(prepull);
    ctx.pull(Query::new("t"), None, None).unwrap();
    assert!(ctx.lookup("t", Value::String("c".into()), true).unwrap().is_some());

    ctx.update("t", rec(&[("id", Value::String("c".into())), ("v", Value::Integer(4))])).unwrap();
    ctx.del("t", Value::String("c".into())).unwrap();

    assert!(ctx.lookup("t", Value::String("c".into()), true).unwrap().is_none());

    // The coalescing algebra replaces the pending update with a delete rather than
    // keeping both; pushing should issue exactly the one delete call and leave nothing
    // pending afterward.
    let summary = ctx.push().unwrap();
    assert!(summary.unhandled_conflicts.is_empty());
    let again = ctx.push().unwrap();
    assert!(again.unhandled_conflicts.is_empty());
}

#[test]
fn s4_conflict_cancel_and_update() {
    let server_record = rec(&[
        ("id", Value::String("d".into())),
        ("v", Value::Integer(9)),
        ("version", Value::String("w2".into())),
    ]);
    // First push (the insert) applies cleanly; the second push (the update) hits a
    // 412-style conflict that the handler resolves with cancelAndUpdate.
    let remote = Arc::new(ScriptedRemote::with_write_outcomes(vec![
        RemoteWriteOutcome::Applied {
            record: Some(rec(&[
                ("id", Value::String("d".into())),
                ("v", Value::Integer(7)),
                ("version", Value::String("w1".into())),
            ])),
            version: None,
        },
        RemoteWriteOutcome::Conflict { server_record: Some(server_record.clone()) },
    ]));

    let store = sync_engine::LocalStore::open_in_memory().unwrap();
    let ctx = SyncContext::new(store, remote, Arc::new(CancelAndUpdateHandler)).unwrap();
    ctx.define_table(table_t()).unwrap();

    ctx.insert(
        "t",
        rec(&[
            ("id", Value::String("d".into())),
            ("v", Value::Integer(7)),
            ("version", Value::String("w1".into())),
        ]),
    )
    .unwrap();
    ctx.push().unwrap();

    ctx.update(
        "t",
        rec(&[
            ("id", Value::String("d".into())),
            ("v", Value::Integer(8)),
            ("version", Value::String("w1".into())),
        ]),
    )
    .unwrap();

    let summary = ctx.push().unwrap();
    assert!(summary.unhandled_conflicts.is_empty());

    let row = ctx.lookup("t", Value::String("d".into()), false).unwrap().unwrap();
    assert_eq!(row.get("v"), Some(&Value::Integer(9)));
    assert_eq!(row.get("version"), Some(&Value::String("w2".into())));
}

#[test]
fn s5_incremental_pull_advances_cursor() {
    let remote = Arc::new(ScriptedRemote::with_pages(vec![
        RemotePage {
            records: vec![
                PulledRecord {
                    record: rec(&[("id", Value::String("e".into())), ("v", Value::Integer(1))]),
                    deleted: false,
                    updated_at_millis: 1_704_067_201_000,
                },
                PulledRecord {
                    record: rec(&[("id", Value::String("f".into())), ("v", Value::Integer(2))]),
                    deleted: false,
                    updated_at_millis: 1_704_067_202_000,
                },
            ],
            total_count: None,
        },
        RemotePage::default(),
    ]));
    let ctx = new_context(remote);

    let settings = sync_engine::PullSettings { page_size: 2 };
    ctx.pull(Query::new("t"), Some("all"), Some(settings)).unwrap();

    assert!(ctx.lookup("t", Value::String("e".into()), true).unwrap().is_some());
    assert!(ctx.lookup("t", Value::String("f".into()), true).unwrap().is_some());

    // A second pull with the same queryId should request strictly newer rows; the
    // scripted remote has no more pages queued, so an empty default page proves the
    // incremental filter/cursor plumbing did not error out.
    let ctx2 = ctx;
    ctx2.pull(Query::new("t"), Some("all"), Some(settings)).unwrap();
}

#[test]
fn s6_force_purge_drops_pending_ops() {
    let remote = Arc::new(ScriptedRemote::default());
    let ctx = new_context(remote.clone());

    ctx.insert("t", rec(&[("id", Value::String("g".into())), ("v", Value::Integer(1))])).unwrap();

    let err = ctx.purge(Query::new("t"), false).unwrap_err();
    assert!(matches!(err, SyncError::Precondition(_)));

    ctx.purge(Query::new("t"), true).unwrap();
    assert!(ctx.lookup("t", Value::String("g".into()), true).unwrap().is_none());

    let summary = ctx.push().unwrap();
    assert!(summary.unhandled_conflicts.is_empty());
    assert!(remote.inserted.lock().unwrap().is_empty());
}

/// `pull` holds the per-table lock for its whole call, including the implicit
/// push-before-pull it runs when pending ops exist for that table (SPEC_FULL §4.4.1).
/// That implicit push must not try to re-acquire the same table's lock -- prior to a
/// fix, it did, and the call deadlocked forever on the non-reentrant mutex.
#[test]
fn pull_pushes_pending_ops_for_the_same_table_without_deadlocking() {
    let remote = Arc::new(ScriptedRemote {
        write_outcomes: Mutex::new(
            vec![RemoteWriteOutcome::Applied {
                record: Some(rec(&[("id", Value::String("p".into())), ("v", Value::Integer(1))])),
                version: None,
            }]
            .into(),
        ),
        query_pages: Mutex::new(vec![RemotePage::default()].into()),
        ..Default::default()
    });
    let ctx = new_context(remote.clone());

    ctx.insert("t", rec(&[("id", Value::String("p".into())), ("v", Value::Integer(1))])).unwrap();

    ctx.pull(Query::new("t"), None, None).unwrap();

    assert_eq!(remote.inserted.lock().unwrap().len(), 1);
    let row = ctx.lookup("t", Value::String("p".into()), false).unwrap().unwrap();
    assert_eq!(row.get("v"), Some(&Value::Integer(1)));
}

struct RetryOnceHandler;
impl PushHandler for RetryOnceHandler {
    fn on_conflict(&self, push_error: &mut PushError) -> Result<(), SyncError> {
        let mut fixed = push_error.client_record().cloned().expect("client record present");
        fixed.insert("v".to_string(), Value::Integer(99));
        push_error.update(fixed)
    }
}

/// A conflict resolved with `update` keeps the op pending for a retry rather than
/// removing it. The op's advisory lock must be released so the next push() iteration
/// can re-lock the same op and actually attempt it again.
#[test]
fn retry_resolution_releases_the_op_lock() {
    let remote = Arc::new(ScriptedRemote::with_write_outcomes(vec![
        RemoteWriteOutcome::Conflict { server_record: None },
        RemoteWriteOutcome::Applied { record: None, version: None },
    ]));

    let store = sync_engine::LocalStore::open_in_memory().unwrap();
    let ctx = SyncContext::new(store, remote.clone(), Arc::new(RetryOnceHandler)).unwrap();
    ctx.define_table(table_t()).unwrap();

    ctx.insert("t", rec(&[("id", Value::String("h".into())), ("v", Value::Integer(1))])).unwrap();

    let summary = ctx.push().unwrap();
    assert!(summary.unhandled_conflicts.is_empty());

    let row = ctx.lookup("t", Value::String("h".into()), false).unwrap().unwrap();
    assert_eq!(row.get("v"), Some(&Value::Integer(99)));
    assert_eq!(remote.inserted.lock().unwrap().len(), 2);
}

/// Property-ish convergence check: a fixed, varied sequence of inserts/updates/deletes
/// against an echoing in-memory server must leave client and server agreeing on every
/// surviving row.
#[test]
fn converges_with_an_echoing_server() {
    #[derive(Default)]
    struct EchoRemote {
        rows: Mutex<std::collections::BTreeMap<String, Record>>,
    }

    impl RemoteTable for EchoRemote {
        fn insert(&self, _table: &str, record: &Record) -> Result<RemoteWriteOutcome, SyncError> {
            let id = record.get("id").unwrap().as_str().unwrap().to_string();
            self.rows.lock().unwrap().insert(id, record.clone());
            Ok(RemoteWriteOutcome::Applied { record: Some(record.clone()), version: None })
        }

        fn update(
            &self,
            _table: &str,
            id: &str,
            record: &Record,
            _version: Option<&str>,
        ) -> Result<RemoteWriteOutcome, SyncError> {
            self.rows.lock().unwrap().insert(id.to_string(), record.clone());
            Ok(RemoteWriteOutcome::Applied { record: Some(record.clone()), version: None })
        }

        fn delete(&self, _table: &str, id: &str, _version: Option<&str>) -> Result<RemoteWriteOutcome, SyncError> {
            self.rows.lock().unwrap().remove(id);
            Ok(RemoteWriteOutcome::Applied { record: None, version: None })
        }

        fn query(&self, _query: &Query, _page_size: i64) -> Result<RemotePage, SyncError> {
            Ok(RemotePage::default())
        }
    }

    let remote = Arc::new(EchoRemote::default());
    let ctx = new_context(remote.clone());

    let ops: Vec<(&str, &str, i64)> = vec![
        ("insert", "1", 10),
        ("insert", "2", 20),
        ("update", "1", 11),
        ("insert", "3", 30),
        ("delete", "2", 0),
        ("update", "3", 31),
        ("update", "1", 12),
        ("delete", "3", 0),
    ];

    for (kind, id, v) in ops {
        match kind {
            "insert" => {
                ctx.insert("t", rec(&[("id", Value::String(id.into())), ("v", Value::Integer(v))])).unwrap();
            }
            "update" => {
                ctx.update("t", rec(&[("id", Value::String(id.into())), ("v", Value::Integer(v))])).unwrap();
            }
            "delete" => {
                ctx.del("t", Value::String(id.into())).unwrap();
            }
            _ => unreachable!(),
        }
    }

    let summary = ctx.push().unwrap();
    assert!(summary.unhandled_conflicts.is_empty());

    let server_rows = remote.rows.lock().unwrap();
    assert_eq!(server_rows.len(), 1);
    let surviving = ctx.lookup("t", Value::String("1".into()), true).unwrap().unwrap();
    assert_eq!(surviving.get("v"), Some(&Value::Integer(12)));
    assert_eq!(server_rows.get("1").unwrap().get("v"), Some(&Value::Integer(12)));
    assert!(ctx.lookup("t", Value::String("2".into()), true).unwrap().is_none());
    assert!(ctx.lookup("t", Value::String("3".into()), true).unwrap().is_none());
}
