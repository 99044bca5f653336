pub mod error;
pub mod id;
pub mod oplog;
pub mod push_error;
pub mod query;
pub mod schema;
pub mod store;
pub mod sync_context;
pub mod transport;
pub mod value;

pub use error::SyncError;
pub use id::Id;
pub use oplog::{OpAction, OperationEntry};
pub use push_error::{PushError, UnhandledConflict};
pub use query::{Filter, OrderBy, Query};
pub use schema::TableDefinition;
pub use store::{BatchOp, LocalStore, ReadResult};
pub use sync_context::{DefaultPushHandler, PullSettings, PushHandler, PushSummary, SyncContext};
pub use transport::{PulledRecord, RemotePage, RemoteTable, RemoteWriteOutcome};
pub use value::{ColumnType, Record, Value};
