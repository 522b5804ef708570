//! SQLite-backed capture store.
//!
//! File databases run in WAL mode: one mutex-guarded writer connection serializes all
//! mutations while a small pool of reader connections serves listing, search and
//! lookups concurrently. The FTS5 index over `body_text` is an external-content table
//! maintained by triggers, so every insert or delete updates it in the same
//! transaction as the row.

use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::scope::Scope;
use crate::types::{clamp_limit, CapturedWebhook, DeleteFilter, ListFilter, WebhookSummary};
use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, InterruptHandle, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);
const READER_CONNECTIONS: usize = 4;
pub const MEMORY_PATH: &str = ":memory:";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS webhooks (
    id           TEXT PRIMARY KEY,
    created_at   INTEGER NOT NULL,

    method       TEXT NOT NULL,
    path         TEXT NOT NULL,
    query        TEXT,
    headers      TEXT NOT NULL,
    body         BLOB,

    provider     TEXT,
    event_type   TEXT,
    signature    TEXT,

    status_code  INTEGER,
    response_ms  INTEGER,

    body_text    TEXT
);

CREATE INDEX IF NOT EXISTS idx_webhooks_created ON webhooks(created_at DESC);
CREATE INDEX IF NOT EXISTS idx_webhooks_provider ON webhooks(provider);
CREATE INDEX IF NOT EXISTS idx_webhooks_status ON webhooks(status_code);

CREATE VIRTUAL TABLE IF NOT EXISTS webhooks_fts USING fts5(
    body_text,
    content='webhooks',
    content_rowid='rowid'
);

CREATE TRIGGER IF NOT EXISTS webhooks_ai AFTER INSERT ON webhooks BEGIN
    INSERT INTO webhooks_fts(rowid, body_text) VALUES (new.rowid, new.body_text);
END;
CREATE TRIGGER IF NOT EXISTS webhooks_ad AFTER DELETE ON webhooks BEGIN
    INSERT INTO webhooks_fts(webhooks_fts, rowid, body_text) VALUES ('delete', old.rowid, old.body_text);
END;
CREATE TRIGGER IF NOT EXISTS webhooks_au AFTER UPDATE ON webhooks BEGIN
    INSERT INTO webhooks_fts(webhooks_fts, rowid, body_text) VALUES ('delete', old.rowid, old.body_text);
    INSERT INTO webhooks_fts(rowid, body_text) VALUES (new.rowid, new.body_text);
END;
"#;

const SUMMARY_COLUMNS: &str =
    "w.id, w.created_at, w.method, w.path, w.provider, w.event_type, w.status_code, w.response_ms";

/// VM instructions between checks of a slot's abort flag.
const PROGRESS_OPS: i32 = 16;

/// A connection plus what is needed to stop whoever is using it.
struct Slot {
    conn: Mutex<Connection>,
    interrupt: InterruptHandle,
    /// Checked by the progress handler, so a statement that starts after
    /// cancellation aborts too.
    abort: Arc<AtomicBool>,
}

impl Slot {
    fn new(conn: Connection) -> Self {
        let interrupt = conn.get_interrupt_handle();
        let abort = Arc::new(AtomicBool::new(false));
        let flag = abort.clone();
        conn.progress_handler(PROGRESS_OPS, Some(move || flag.load(Ordering::SeqCst)));
        Self {
            conn: Mutex::new(conn),
            interrupt,
            abort,
        }
    }
}

/// Where a single store call is. Guarded by one mutex shared by the worker and the
/// canceller, so the two never act on a stale view of each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Abandoned,
    Finished,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    path: String,
    writer: Slot,
    /// Empty for in-memory databases, whose reads share the writer.
    readers: Vec<Slot>,
    next_reader: AtomicUsize,
}

impl Inner {
    fn slot(&self, access: Access, index: usize) -> &Slot {
        match access {
            Access::Read if !self.readers.is_empty() => &self.readers[index],
            _ => &self.writer,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Access {
    Read,
    Write,
}

#[derive(Clone)]
pub struct WebhookStore {
    inner: Arc<Inner>,
}

impl WebhookStore {
    /// Open (creating if needed) the database at `path`, or an in-memory one for
    /// `":memory:"`.
    pub async fn open(path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref().trim().to_string();
        if path.is_empty() {
            return Err(Error::validation("empty database path"));
        }

        let inner = tokio::task::spawn_blocking(move || open_blocking(path))
            .await
            .map_err(|e| Error::storage("open", e))??;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub async fn open_in_memory() -> Result<Self> {
        Self::open(MEMORY_PATH).await
    }

    pub fn path(&self) -> &str {
        &self.inner.path
    }

    pub async fn insert(&self, scope: &Scope, webhook: &CapturedWebhook) -> Result<()> {
        if webhook.id.trim().is_empty() {
            return Err(Error::validation("missing id"));
        }
        if webhook.method.trim().is_empty() || webhook.path.trim().is_empty() {
            return Err(Error::validation("missing method/path"));
        }
        let headers = serde_json::to_string(&webhook.headers)
            .map_err(|e| Error::storage("encode headers", e))?;

        let mut wh = webhook.clone();
        if wh.created_at == 0 {
            wh.created_at = Utc::now().timestamp_millis();
        }

        self.call(scope, Access::Write, "insert", move |conn| {
            conn.execute(
                r#"
INSERT INTO webhooks (
    id, created_at,
    method, path, query, headers, body,
    provider, event_type, signature,
    status_code, response_ms,
    body_text
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
"#,
                params![
                    wh.id,
                    wh.created_at,
                    wh.method,
                    wh.path,
                    null_if_blank(&wh.query),
                    headers,
                    wh.body,
                    null_if_blank(&wh.provider),
                    null_if_blank(&wh.event_type),
                    null_if_blank(&wh.signature),
                    wh.status_code.map(i64::from),
                    wh.response_ms,
                    null_if_blank(&wh.searchable_text),
                ],
            )
            .map_err(|e| Error::storage("insert", e))?;
            Ok(())
        })
        .await
    }

    pub async fn get(&self, scope: &Scope, id: &str) -> Result<CapturedWebhook> {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(Error::validation("empty id"));
        }

        self.call(scope, Access::Read, "get", move |conn| {
            conn.query_row(
                r#"
SELECT
    id, created_at,
    method, path, query, headers, body,
    provider, event_type, signature,
    status_code, response_ms,
    body_text
FROM webhooks
WHERE id = ?1
"#,
                params![id],
                webhook_from_row,
            )
            .optional()
            .map_err(|e| Error::storage("get", e))?
            .ok_or_else(|| Error::NotFound(id.clone()))
        })
        .await
    }

    pub async fn list_summaries(
        &self,
        scope: &Scope,
        filter: &ListFilter,
    ) -> Result<Vec<WebhookSummary>> {
        let limit = clamp_limit(filter.limit);
        let mut wheres: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(provider) = filter.provider.as_deref().filter(|p| !p.trim().is_empty()) {
            wheres.push("w.provider = ?");
            args.push(SqlValue::Text(provider.to_string()));
        }
        if let Some(status) = filter.status {
            wheres.push("w.status_code = ?");
            args.push(SqlValue::Integer(status.into()));
        }
        if let Some(from) = filter.from {
            wheres.push("w.created_at >= ?");
            args.push(SqlValue::Integer(from.timestamp_millis()));
        }
        if let Some(to) = filter.to {
            wheres.push("w.created_at <= ?");
            args.push(SqlValue::Integer(to.timestamp_millis()));
        }
        let where_sql = if wheres.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", wheres.join(" AND "))
        };
        args.push(SqlValue::Integer(limit as i64));

        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM webhooks w {where_sql} \
             ORDER BY w.created_at DESC, w.id DESC LIMIT ?"
        );

        self.call(scope, Access::Read, "list", move |conn| {
            query_summaries(conn, &sql, args).map_err(|e| Error::storage("list", e))
        })
        .await
    }

    pub async fn search_summaries(
        &self,
        scope: &Scope,
        query: &str,
        limit: i64,
    ) -> Result<Vec<WebhookSummary>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(Error::validation("empty search query"));
        }
        if query.chars().any(|c| c.is_control() && !c.is_whitespace()) {
            return Err(Error::validation("search query contains control characters"));
        }
        let args = vec![
            SqlValue::Text(sanitize_fts_query(query)),
            SqlValue::Integer(clamp_limit(limit) as i64),
        ];
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM webhooks_fts f \
             JOIN webhooks w ON w.rowid = f.rowid \
             WHERE webhooks_fts MATCH ? \
             ORDER BY w.created_at DESC, w.id DESC LIMIT ?"
        );

        self.call(scope, Access::Read, "search", move |conn| {
            query_summaries(conn, &sql, args).map_err(|e| Error::storage("search", e))
        })
        .await
    }

    pub async fn delete(&self, scope: &Scope, id: &str) -> Result<()> {
        let id = id.trim().to_string();
        if id.is_empty() {
            return Err(Error::validation("empty id"));
        }

        self.call(scope, Access::Write, "delete", move |conn| {
            let n = conn
                .execute("DELETE FROM webhooks WHERE id = ?1", params![id])
                .map_err(|e| Error::storage("delete", e))?;
            if n == 0 {
                return Err(Error::NotFound(id));
            }
            Ok(())
        })
        .await
    }

    /// Bulk delete. An empty filter is rejected rather than wiping the table.
    pub async fn delete_by_filter(&self, scope: &Scope, filter: &DeleteFilter) -> Result<usize> {
        if filter.is_empty() {
            return Err(Error::validation(
                "at least one filter required for bulk delete",
            ));
        }

        let mut wheres: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(older_than) = filter.older_than.filter(|d| !d.is_zero()) {
            let age = i64::try_from(older_than.as_millis()).unwrap_or(i64::MAX);
            wheres.push("created_at < ?");
            args.push(SqlValue::Integer(
                Utc::now().timestamp_millis().saturating_sub(age),
            ));
        }
        if let Some(provider) = filter.provider.as_deref().filter(|p| !p.trim().is_empty()) {
            wheres.push("provider = ?");
            args.push(SqlValue::Text(provider.to_string()));
        }
        if let Some(status) = filter.status {
            wheres.push("status_code = ?");
            args.push(SqlValue::Integer(status.into()));
        }
        let sql = format!("DELETE FROM webhooks WHERE {}", wheres.join(" AND "));

        self.call(scope, Access::Write, "delete by filter", move |conn| {
            conn.execute(&sql, params_from_iter(args.iter()))
                .map_err(|e| Error::storage("delete by filter", e))
        })
        .await
    }

    pub async fn count(&self, scope: &Scope) -> Result<u64> {
        self.call(scope, Access::Read, "count", |conn| {
            conn.query_row("SELECT COUNT(*) FROM webhooks", [], |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as u64)
                .map_err(|e| Error::storage("count", e))
        })
        .await
    }

    /// Make every later write fail.
    #[cfg(test)]
    pub(crate) async fn break_writes(&self) {
        self.call(&Scope::new(), Access::Write, "break", |conn| {
            conn.execute_batch("DROP TABLE webhooks")
                .map_err(|e| Error::storage("break", e))
        })
        .await
        .unwrap();
    }

    /// Run `f` against a connection on the blocking pool, bounded by `scope`.
    ///
    /// If the scope fires first, a call still waiting for its connection never runs,
    /// and one that is executing has its statement interrupted so the open transaction
    /// rolls back.
    async fn call<T, F>(&self, scope: &Scope, access: Access, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        scope.check()?;

        let index = match access {
            Access::Read if !self.inner.readers.is_empty() => {
                self.inner.next_reader.fetch_add(1, Ordering::Relaxed) % self.inner.readers.len()
            }
            _ => 0,
        };
        let phase = Arc::new(Mutex::new(Phase::Queued));

        let inner = self.inner.clone();
        let worker_phase = phase.clone();
        let mut task = tokio::task::spawn_blocking(move || {
            let slot = inner.slot(access, index);
            let mut conn = slot
                .conn
                .lock()
                .map_err(|_| Error::storage(op, "connection mutex poisoned"))?;
            {
                let mut phase = lock(&worker_phase);
                if *phase == Phase::Abandoned {
                    return Err(Error::Cancelled);
                }
                slot.abort.store(false, Ordering::SeqCst);
                *phase = Phase::Running;
            }
            let out = f(&mut *conn);
            let mut phase = lock(&worker_phase);
            *phase = Phase::Finished;
            slot.abort.store(false, Ordering::SeqCst);
            out
        });

        tokio::select! {
            biased;
            reason = scope.done() => {
                let slot = self.inner.slot(access, index);
                let finished = {
                    let mut phase = lock(&phase);
                    match *phase {
                        Phase::Queued => *phase = Phase::Abandoned,
                        // The worker still holds the connection, so no other
                        // caller's statement can be hit.
                        Phase::Running => {
                            slot.abort.store(true, Ordering::SeqCst);
                            slot.interrupt.interrupt();
                        }
                        Phase::Abandoned | Phase::Finished => {}
                    }
                    *phase == Phase::Finished
                };
                if finished {
                    // Lost the race to completion: report what actually happened.
                    return (&mut task).await.map_err(|e| Error::storage(op, e))?;
                }
                tracing::debug!(op, %reason, "store call abandoned");
                Err(reason)
            }
            joined = &mut task => joined.map_err(|e| Error::storage(op, e))?,
        }
    }
}

fn open_blocking(path: String) -> Result<Inner> {
    let memory = path == MEMORY_PATH;

    let writer = if memory {
        let conn = Connection::open_in_memory().map_err(|e| Error::storage("open", e))?;
        conn.pragma_update_and_check(None, "journal_mode", "MEMORY", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| Error::storage("open", e))?;
        conn
    } else {
        ensure_parent_dir(Path::new(&path))?;
        let conn = open_file(&path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| Error::storage("open", e))?;
        conn
    };
    writer
        .execute_batch(SCHEMA)
        .map_err(|e| Error::storage("migrate", e))?;

    let mut readers = Vec::new();
    if !memory {
        for _ in 0..READER_CONNECTIONS {
            readers.push(Slot::new(open_file(&path)?));
        }
    }

    tracing::debug!(path = %path, readers = readers.len(), "store opened");

    Ok(Inner {
        path,
        writer: Slot::new(writer),
        readers,
        next_reader: AtomicUsize::new(0),
    })
}

fn open_file(path: &str) -> Result<Connection> {
    let conn = Connection::open(path).map_err(|e| Error::storage("open", e))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| Error::storage("open", e))?;
    Ok(conn)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)
            .map_err(|e| Error::storage("create database directory", e)),
        _ => Ok(()),
    }
}

fn null_if_blank(s: &str) -> Option<&str> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Turn arbitrary user text into a single FTS5 phrase, so operator syntax such as
/// `OR`, `NOT`, `*`, `^` or column filters is matched literally.
pub fn sanitize_fts_query(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

fn status_from_sql(v: Option<i64>) -> Option<u16> {
    v.and_then(|n| u16::try_from(n).ok())
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<WebhookSummary> {
    Ok(WebhookSummary {
        id: row.get(0)?,
        created_at: row.get(1)?,
        method: row.get(2)?,
        path: row.get(3)?,
        provider: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        event_type: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        status_code: status_from_sql(row.get(6)?),
        response_ms: row.get::<_, Option<i64>>(7)?.unwrap_or_default(),
    })
}

fn webhook_from_row(row: &Row<'_>) -> rusqlite::Result<CapturedWebhook> {
    let headers_json: String = row.get(5)?;
    let headers = match serde_json::from_str::<Headers>(&headers_json) {
        Ok(h) => h,
        // A corrupt header blob should not make the capture unreadable.
        Err(e) => [("_error", e.to_string())].into_iter().collect(),
    };

    Ok(CapturedWebhook {
        id: row.get(0)?,
        created_at: row.get(1)?,
        method: row.get(2)?,
        path: row.get(3)?,
        query: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        headers,
        body: row.get::<_, Option<Vec<u8>>>(6)?.unwrap_or_default(),
        provider: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        event_type: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        signature: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        status_code: status_from_sql(row.get(10)?),
        response_ms: row.get::<_, Option<i64>>(11)?.unwrap_or_default(),
        searchable_text: row.get::<_, Option<String>>(12)?.unwrap_or_default(),
    })
}

fn query_summaries(
    conn: &Connection,
    sql: &str,
    args: Vec<SqlValue>,
) -> rusqlite::Result<Vec<WebhookSummary>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(args.iter()), summary_from_row)?;
    rows.collect()
}

impl std::fmt::Debug for WebhookStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookStore")
            .field("path", &self.inner.path)
            .finish()
    }
}

/// Where the default database lives inside an extension data directory.
pub fn default_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("hooks.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(id: &str, created_at: i64, body: &str) -> CapturedWebhook {
        CapturedWebhook {
            id: id.to_string(),
            created_at,
            method: "POST".into(),
            path: "/hooks/stripe".into(),
            query: "a=1&b=2".into(),
            headers: [
                ("Content-Type", "application/json"),
                ("X-Multi", "one"),
                ("X-Multi", "two"),
            ]
            .into_iter()
            .collect(),
            body: body.as_bytes().to_vec(),
            provider: "stripe".into(),
            event_type: "payment_intent.succeeded".into(),
            signature: "t=1,v1=abc".into(),
            status_code: Some(200),
            response_ms: 12,
            searchable_text: body.to_string(),
        }
    }

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        let wh = sample("wh-1", 1_700_000_000_000, r#"{"type":"payment_intent.succeeded"}"#);

        store.insert(&scope, &wh).await.unwrap();
        let got = store.get(&scope, "wh-1").await.unwrap();
        assert_eq!(got, wh);

        let mut binary = sample("wh-2", 1_700_000_000_001, "");
        binary.body = vec![0, 159, 146, 150, 255];
        binary.searchable_text.clear();
        binary.status_code = None;
        binary.query.clear();
        store.insert(&scope, &binary).await.unwrap();
        assert_eq!(store.get(&scope, "wh-2").await.unwrap(), binary);
    }

    #[tokio::test]
    async fn insert_validates_and_rejects_duplicates() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();

        let mut wh = sample(" ", 1, "{}");
        assert!(matches!(
            store.insert(&scope, &wh).await,
            Err(Error::Validation(_))
        ));
        wh.id = "dup".into();
        wh.method.clear();
        assert!(matches!(
            store.insert(&scope, &wh).await,
            Err(Error::Validation(_))
        ));

        let wh = sample("dup", 1, "{}");
        store.insert(&scope, &wh).await.unwrap();
        assert!(matches!(
            store.insert(&scope, &wh).await,
            Err(Error::Storage { .. })
        ));
    }

    #[tokio::test]
    async fn zero_created_at_defaults_to_now() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        let before = Utc::now().timestamp_millis();
        store.insert(&scope, &sample("now", 0, "{}")).await.unwrap();
        let got = store.get(&scope, "now").await.unwrap();
        assert!(got.created_at >= before);
    }

    #[tokio::test]
    async fn get_and_delete_unknown_ids() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        assert!(matches!(
            store.get(&scope, "nope").await,
            Err(Error::NotFound(id)) if id == "nope"
        ));
        assert!(matches!(
            store.delete(&scope, "nope").await,
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            store.get(&scope, "").await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn list_orders_newest_first_and_filters() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();

        let mut a = sample("a", 1_000, "{}");
        a.provider = "github".into();
        let mut b = sample("b", 3_000, "{}");
        b.status_code = Some(502);
        let c = sample("c", 2_000, "{}");
        // Same timestamp as `c`; the id breaks the tie.
        let d = sample("d", 2_000, "{}");
        for wh in [&a, &b, &c, &d] {
            store.insert(&scope, wh).await.unwrap();
        }

        let all = store
            .list_summaries(&scope, &ListFilter::default())
            .await
            .unwrap();
        let ids: Vec<&str> = all.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["b", "d", "c", "a"]);

        let github = store
            .list_summaries(
                &scope,
                &ListFilter {
                    provider: Some("github".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(github.len(), 1);
        assert_eq!(github[0].id, "a");

        let failed = store
            .list_summaries(
                &scope,
                &ListFilter {
                    status: Some(502),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, "b");

        let ranged = store
            .list_summaries(
                &scope,
                &ListFilter {
                    from: Utc.timestamp_millis_opt(2_000).single(),
                    to: Utc.timestamp_millis_opt(2_000).single(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let ids: Vec<&str> = ranged.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["d", "c"]);

        let limited = store
            .list_summaries(
                &scope,
                &ListFilter {
                    limit: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn list_limit_is_clamped() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        for i in 0..25 {
            store
                .insert(&scope, &sample(&format!("wh-{i:02}"), 1_000 + i, "{}"))
                .await
                .unwrap();
        }
        for limit in [0, -1, 501, 10_000] {
            let rows = store
                .list_summaries(
                    &scope,
                    &ListFilter {
                        limit,
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
            assert_eq!(rows.len(), 20, "limit {limit}");
        }
        let rows = store
            .list_summaries(
                &scope,
                &ListFilter {
                    limit: 500,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 25);
    }

    #[tokio::test]
    async fn search_treats_operators_as_literal_text() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        store
            .insert(&scope, &sample("plain", 1, "alpha beta"))
            .await
            .unwrap();
        store
            .insert(&scope, &sample("ops", 2, "alpha OR gamma"))
            .await
            .unwrap();

        let hits = store
            .search_summaries(&scope, "alpha OR gamma", 0)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "ops");

        let hits = store.search_summaries(&scope, "alpha", 0).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, ["ops", "plain"]);

        // None of these may be parsed as FTS syntax.
        for q in ["beta*", "NOT alpha", "body_text:alpha", "\"unbalanced", "^alpha"] {
            store.search_summaries(&scope, q, 0).await.unwrap();
        }

        assert!(matches!(
            store.search_summaries(&scope, "   ", 0).await,
            Err(Error::Validation(_))
        ));
    }

    #[tokio::test]
    async fn delete_removes_row_and_index_entry() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        store
            .insert(&scope, &sample("gone", 1, r#"{"customer":"zebra"}"#))
            .await
            .unwrap();
        assert_eq!(
            store.search_summaries(&scope, "zebra", 10).await.unwrap().len(),
            1
        );

        store.delete(&scope, "gone").await.unwrap();
        assert!(matches!(
            store.get(&scope, "gone").await,
            Err(Error::NotFound(_))
        ));
        assert!(store
            .search_summaries(&scope, "zebra", 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn delete_by_filter() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        let now = Utc::now().timestamp_millis();

        let mut old = sample("old", now - 10 * 86_400_000, "{}");
        old.provider = "github".into();
        let recent = sample("recent", now, "{}");
        let mut failed = sample("failed", now, "{}");
        failed.status_code = Some(502);
        for wh in [&old, &recent, &failed] {
            store.insert(&scope, wh).await.unwrap();
        }

        assert!(matches!(
            store.delete_by_filter(&scope, &DeleteFilter::default()).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(store.count(&scope).await.unwrap(), 3);

        let n = store
            .delete_by_filter(
                &scope,
                &DeleteFilter {
                    older_than: Some(Duration::from_secs(7 * 86_400)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(n, 1);

        let n = store
            .delete_by_filter(
                &scope,
                &DeleteFilter {
                    provider: Some("stripe".into()),
                    status: Some(502),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(store.count(&scope).await.unwrap(), 1);
        store.get(&scope, "recent").await.unwrap();
    }

    #[tokio::test]
    async fn expired_scope_does_no_work() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let live = Scope::new();
        let dead = Scope::new();
        dead.cancel();

        assert!(matches!(
            store.insert(&dead, &sample("x", 1, "{}")).await,
            Err(Error::Cancelled)
        ));
        assert_eq!(store.count(&live).await.unwrap(), 0);

        let expired = Scope::new().with_timeout(Duration::ZERO);
        let err = store
            .list_summaries(&expired, &ListFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded));
    }

    const ENDLESS: &str =
        "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c) SELECT count(*) FROM c";

    fn endless(conn: &mut Connection) -> Result<i64> {
        conn.query_row(ENDLESS, [], |row| row.get(0))
            .map_err(|e| Error::storage("endless", e))
    }

    #[tokio::test]
    async fn running_statement_is_interrupted() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new().with_timeout(Duration::from_millis(200));
        let started = std::time::Instant::now();

        let err = store
            .call(&scope, Access::Write, "endless", endless)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(2));

        // The writer only frees up once the statement has actually stopped.
        let count = tokio::time::timeout(Duration::from_secs(2), store.count(&Scope::new()))
            .await
            .expect("writer still busy");
        assert_eq!(count.unwrap(), 0);
        store
            .insert(&Scope::new(), &sample("after", 1, "{}"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn queued_write_never_lands_after_its_caller_gives_up() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let busy = store.clone();
        let blocker = tokio::spawn(async move {
            let scope = Scope::new().with_timeout(Duration::from_millis(400));
            busy.call(&scope, Access::Write, "endless", endless).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let short = Scope::new().with_timeout(Duration::from_millis(100));
        let err = store
            .insert(&short, &sample("late", 1, "{}"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeadlineExceeded), "{err:?}");

        assert!(matches!(blocker.await.unwrap(), Err(Error::DeadlineExceeded)));
        assert!(matches!(
            store.get(&Scope::new(), "late").await,
            Err(Error::NotFound(_))
        ));
        assert_eq!(store.count(&Scope::new()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn control_characters_in_search_are_rejected() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        store
            .insert(&scope, &sample("a", 1, r#"{"note":"hello world"}"#))
            .await
            .unwrap();

        for bad in ["hello\u{0}", "\u{7}bell"] {
            assert!(matches!(
                store.search_summaries(&scope, bad, 10).await,
                Err(Error::Validation(_))
            ));
        }
        let hits = store
            .search_summaries(&scope, "hello\tworld", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn corrupt_headers_stay_readable() {
        let store = WebhookStore::open_in_memory().await.unwrap();
        let scope = Scope::new();
        store.insert(&scope, &sample("h", 1, "{}")).await.unwrap();
        store
            .call(&scope, Access::Write, "corrupt", |conn| {
                conn.execute("UPDATE webhooks SET headers = 'nope' WHERE id = 'h'", [])
                    .map_err(|e| Error::storage("corrupt", e))
            })
            .await
            .unwrap();

        let got = store.get(&scope, "h").await.unwrap();
        assert_eq!(got.headers.len(), 1);
        assert!(got.headers.get("_error").is_some());
    }

    #[tokio::test]
    async fn file_store_reads_while_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hooks.db");
        let store = WebhookStore::open(path.to_string_lossy()).await.unwrap();
        let scope = Scope::new();

        let writer = {
            let store = store.clone();
            let scope = scope.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    store
                        .insert(&scope, &sample(&format!("w{i}"), 1_000 + i, "{}"))
                        .await
                        .unwrap();
                }
            })
        };
        for _ in 0..20 {
            store
                .list_summaries(&scope, &ListFilter::default())
                .await
                .unwrap();
        }
        writer.await.unwrap();

        assert_eq!(store.count(&scope).await.unwrap(), 50);
        assert!(path.exists());

        // Reopening sees the committed rows.
        drop(store);
        let reopened = WebhookStore::open(path.to_string_lossy()).await.unwrap();
        assert_eq!(reopened.count(&scope).await.unwrap(), 50);
    }

    #[test]
    fn fts_query_sanitizing() {
        assert_eq!(sanitize_fts_query("a OR b"), r#""a OR b""#);
        assert_eq!(sanitize_fts_query(r#"say "hi""#), r#""say ""hi""""#);
    }
}
