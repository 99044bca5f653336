use crate::error::SyncError;
use crate::query::Query;
use crate::value::Record;

/// One row returned by a pull query. `deleted` mirrors the server's
/// tombstone flag; pull only ever upserts or deletes from these, it never
/// creates operation-log entries.
#[derive(Debug, Clone)]
pub struct PulledRecord {
    pub record: Record,
    pub deleted: bool,
    pub updated_at_millis: i64,
}

/// A page of pull results.
#[derive(Debug, Clone, Default)]
pub struct RemotePage {
    pub records: Vec<PulledRecord>,
    pub total_count: Option<i64>,
}

/// Outcome of a single push write against the remote table service.
#[derive(Debug, Clone)]
pub enum RemoteWriteOutcome {
    Applied { record: Option<Record>, version: Option<String> },
    Conflict { server_record: Option<Record> },
}

/// The observable wire contract push and pull depend on:
///
/// - `POST /tables/{name}` for insert
/// - `PATCH /tables/{name}/{id}` with an optional `If-Match` for update
/// - `DELETE /tables/{name}/{id}` with an optional `If-Match` for delete
/// - `GET /tables/{name}?<odata>` for query, paged by `page_size`
///
/// The HTTP transport client and the OData/query-string generator that
/// turns a structured [`Query`] into a URL are both external collaborators:
/// this crate only depends on this trait's shape, not on how a `Query` gets
/// rendered onto the wire.
pub trait RemoteTable: Send + Sync {
    fn insert(&self, table: &str, record: &Record) -> Result<RemoteWriteOutcome, SyncError>;

    fn update(
        &self,
        table: &str,
        id: &str,
        record: &Record,
        version: Option<&str>,
    ) -> Result<RemoteWriteOutcome, SyncError>;

    fn delete(
        &self,
        table: &str,
        id: &str,
        version: Option<&str>,
    ) -> Result<RemoteWriteOutcome, SyncError>;

    fn query(&self, query: &Query, page_size: i64) -> Result<RemotePage, SyncError>;
}

/// Strip the surrounding quotes an `ETag` header carries and unescape any
/// internal `\"`, yielding the opaque version token stored on records.
pub fn version_from_etag(etag: &str) -> String {
    let trimmed = etag.trim();
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);
    inner.replace("\\\"", "\"")
}

/// The inverse of [`version_from_etag`]: wrap a version token back into a
/// quoted, escaped `ETag` header value.
pub fn etag_from_version(version: &str) -> String {
    format!("\"{}\"", version.replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_version_round_trips() {
        for etag in ["\"abc123\"", "\"a\\\"b\"", "\"\""] {
            let version = version_from_etag(etag);
            assert_eq!(etag_from_version(&version), etag);
        }
    }
}
