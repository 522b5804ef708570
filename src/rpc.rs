//! Newline-delimited JSON-RPC surface the host drives the recorder through.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::http_server::{self, http_client, Mode, Recorder};
use crate::log::TracingLog;
use crate::replay::ReplayEngine;
use crate::scope::Scope;
use crate::store::WebhookStore;
use crate::types::{DeleteFilter, ListFilter, MAX_LIMIT};
use base64::Engine as _;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

pub const PARSE_ERROR: i64 = -32700;
pub const UNKNOWN_METHOD: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const NOT_FOUND: i64 = -32004;
pub const NETWORK_ERROR: i64 = -32001;
pub const CANCELLED: i64 = -32003;
pub const INTERNAL_ERROR: i64 = -32000;

// ─── JSON-RPC wire types ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: Value,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

fn raw_response(id: Value, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: Some(result),
        error: None,
        id,
    }
}

fn ok_response(id: Value, data: Value) -> JsonRpcResponse {
    raw_response(
        id,
        json!({
            "success": true,
            "data": data,
            "message": null
        }),
    )
}

pub fn err_response(id: Value, code: i64, message: String) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        result: None,
        error: Some(JsonRpcError { code, message }),
        id,
    }
}

pub fn error_code(err: &Error) -> i64 {
    match err {
        Error::Validation(_) => INVALID_PARAMS,
        Error::NotFound(_) => NOT_FOUND,
        Error::Network(_) => NETWORK_ERROR,
        Error::Cancelled | Error::DeadlineExceeded => CANCELLED,
        Error::Storage { .. } | Error::Io(_) => INTERNAL_ERROR,
    }
}

fn from_error(id: Value, err: &Error) -> JsonRpcResponse {
    err_response(id, error_code(err), err.to_string())
}

/// Parse one protocol line. Malformed JSON becomes a ready-to-send error response.
pub fn parse_line(line: &str) -> std::result::Result<JsonRpcRequest, JsonRpcResponse> {
    serde_json::from_str(line)
        .map_err(|e| err_response(Value::Null, PARSE_ERROR, format!("Parse error: {e}")))
}

// ─── Shared app state ────────────────────────────────────────────────────────

struct Running {
    config: Config,
    store: WebhookStore,
    client: reqwest::Client,
    mode: Mode,
    addr: SocketAddr,
    server: JoinHandle<()>,
}

impl Running {
    fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

/// Process-wide state behind the protocol loop.
pub struct App {
    scope: Scope,
    running: RwLock<Option<Running>>,
}

impl Default for App {
    fn default() -> Self {
        Self::new()
    }
}

impl App {
    pub fn new() -> Self {
        Self {
            scope: Scope::new(),
            running: RwLock::new(None),
        }
    }

    pub async fn handle(&self, req: &JsonRpcRequest) -> JsonRpcResponse {
        let result = match req.method.as_str() {
            "initialize" => self.initialize(&req.params).await.map(|r| raw_response(req.id.clone(), r)),
            "shutdown" => {
                self.shutdown().await;
                Ok(raw_response(req.id.clone(), json!({})))
            }
            "execute" => self.execute(&req.params).await.map(|d| ok_response(req.id.clone(), d)),
            _ => {
                return err_response(
                    req.id.clone(),
                    UNKNOWN_METHOD,
                    format!("Unknown method: {}", req.method),
                )
            }
        };
        result.unwrap_or_else(|e| from_error(req.id.clone(), &e))
    }

    async fn initialize(&self, params: &Value) -> Result<Value> {
        let mut running = self.running.write().await;
        if running.is_some() {
            return Err(Error::validation("already initialized"));
        }

        let config = Config::from_params(params)?;
        let store = WebhookStore::open(config.db_path()).await?;
        let client = http_client(config.timeout())?;
        let mode = Mode::from_target(config.forward_url()?);
        let recorder = Recorder::new(
            mode.clone(),
            store.clone(),
            client.clone(),
            Arc::new(TracingLog),
            self.scope.child(),
        );
        let (addr, server) = http_server::start(Arc::new(recorder), config.listen_addr()).await?;

        let state = Running {
            config,
            store,
            client,
            mode,
            addr,
            server,
        };
        let reply = json!({
            "ready": true,
            "port": state.addr.port(),
            "base_url": state.base_url(),
            "mode": state.mode.describe(),
        });
        *running = Some(state);
        Ok(reply)
    }

    pub async fn shutdown(&self) {
        self.scope.cancel();
        if let Some(state) = self.running.write().await.take() {
            if let Err(e) = state.server.await {
                tracing::warn!(error = %e, "recorder task ended abnormally");
            }
        }
    }

    async fn execute(&self, params: &Value) -> Result<Value> {
        let operation = params
            .get("operation")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        let input = params
            .get("input")
            .cloned()
            .unwrap_or(Value::Object(Default::default()));

        let guard = self.running.read().await;
        let state = guard
            .as_ref()
            .ok_or_else(|| Error::validation("server not initialized"))?;
        let scope = self.scope.child();

        match operation {
            "get_server_info" => op_get_server_info(&scope, state).await,
            "list_webhooks" => op_list_webhooks(&scope, state, input).await,
            "search_webhooks" => op_search_webhooks(&scope, state, input).await,
            "get_webhook" => op_get_webhook(&scope, state, input).await,
            "delete_webhook" => op_delete_webhook(&scope, state, input).await,
            "delete_webhooks" => op_delete_webhooks(&scope, state, input).await,
            "replay_webhook" => op_replay_webhook(&scope, state, input).await,
            "replay_last" => op_replay_last(&scope, state, input).await,
            _ => Err(Error::validation(format!("Unknown operation: {operation}"))),
        }
    }
}

fn parse_input<T: for<'de> Deserialize<'de>>(input: Value) -> Result<T> {
    serde_json::from_value(input).map_err(|e| Error::validation(e.to_string()))
}

fn required(value: Option<String>, field: &str) -> Result<String> {
    value
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| Error::validation(format!("missing required field: {field}")))
}

/// Which end of a time range a value bounds. Date-only input snaps to that end of the
/// day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    From,
    To,
}

/// RFC 3339, `YYYY-MM-DD HH:MM:SS` (UTC), `YYYY-MM-DD`, an age like `7d` counted back
/// from `now`, or epoch milliseconds.
pub fn parse_time(value: &Value, bound: Bound, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    match value {
        Value::String(s) => parse_time_text(s.trim(), bound, now),
        Value::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| Error::validation(format!("invalid epoch milliseconds: {n}"))),
        other => Err(Error::validation(format!("invalid time: {other}"))),
    }
}

fn parse_time_text(s: &str, bound: Bound, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if looks_like_age(s) {
        let age = chrono::Duration::from_std(parse_age(s)?)
            .map_err(|_| Error::validation(format!("age out of range: {s:?}")))?;
        return now
            .checked_sub_signed(age)
            .ok_or_else(|| Error::validation(format!("age out of range: {s:?}")));
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    if let Ok(t) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&t));
    }
    if let Ok(day) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let t = match bound {
            Bound::From => day.and_hms_opt(0, 0, 0),
            Bound::To => day.and_hms_milli_opt(23, 59, 59, 999),
        };
        if let Some(t) = t {
            return Ok(Utc.from_utc_datetime(&t));
        }
    }
    Err(Error::validation(format!(
        "invalid time {s:?}; use YYYY-MM-DD, RFC 3339, or an age like 7d"
    )))
}

fn looks_like_age(s: &str) -> bool {
    match s.char_indices().last() {
        Some((i, unit)) if i > 0 => {
            matches!(unit, 's' | 'm' | 'h' | 'd') && s[..i].bytes().all(|b| b.is_ascii_digit())
        }
        _ => false,
    }
}

/// Ages like `45s`, `30m`, `12h` or `7d`.
pub fn parse_age(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    let invalid = || Error::validation(format!("invalid duration {raw:?}; use e.g. 30m, 12h, 7d"));
    let (split, _) = raw.char_indices().last().ok_or_else(invalid)?;
    let (digits, unit) = raw.split_at(split);
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let secs = match unit {
        "s" => Some(n),
        "m" => n.checked_mul(60),
        "h" => n.checked_mul(3600),
        "d" => n.checked_mul(86_400),
        _ => None,
    }
    .ok_or_else(invalid)?;
    Ok(Duration::from_secs(secs))
}

/// Accept the patch either as a JSON document or as its text.
fn patch_text(patch: Option<Value>) -> Result<String> {
    match patch {
        None | Some(Value::Null) => Ok(String::new()),
        Some(Value::String(s)) => Ok(s),
        Some(doc) => serde_json::to_string(&doc).map_err(|e| Error::validation(e.to_string())),
    }
}

// ─── Operations ───────────────────────────────────────────────────────────────

async fn op_get_server_info(scope: &Scope, st: &Running) -> Result<Value> {
    let count = st.store.count(scope).await?;
    Ok(json!({
        "port": st.addr.port(),
        "base_url": st.base_url(),
        "mode": st.mode.describe(),
        "db_path": st.store.path(),
        "webhook_count": count,
    }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ListInput {
    limit: i64,
    provider: Option<String>,
    status: Option<u16>,
    from: Option<Value>,
    to: Option<Value>,
}

async fn op_list_webhooks(scope: &Scope, st: &Running, input: Value) -> Result<Value> {
    let input: ListInput = parse_input(input)?;
    let now = Utc::now();
    let filter = ListFilter {
        limit: input.limit,
        provider: input.provider,
        status: input.status,
        from: input
            .from
            .as_ref()
            .map(|v| parse_time(v, Bound::From, now))
            .transpose()?,
        to: input
            .to
            .as_ref()
            .map(|v| parse_time(v, Bound::To, now))
            .transpose()?,
    };
    let items = st.store.list_summaries(scope, &filter).await?;
    Ok(json!({ "count": items.len(), "webhooks": items }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct SearchInput {
    query: Option<String>,
    limit: i64,
}

async fn op_search_webhooks(scope: &Scope, st: &Running, input: Value) -> Result<Value> {
    let input: SearchInput = parse_input(input)?;
    let query = required(input.query, "query")?;
    let items = st.store.search_summaries(scope, &query, input.limit).await?;
    Ok(json!({ "count": items.len(), "webhooks": items }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct IdInput {
    id: Option<String>,
}

async fn op_get_webhook(scope: &Scope, st: &Running, input: Value) -> Result<Value> {
    let id = required(parse_input::<IdInput>(input)?.id, "id")?;
    let wh = st.store.get(scope, &id).await?;
    let mut out = serde_json::to_value(&wh).map_err(|e| Error::storage("encode webhook", e))?;
    if let Some(obj) = out.as_object_mut() {
        obj.insert(
            "body_base64".into(),
            base64::engine::general_purpose::STANDARD.encode(&wh.body).into(),
        );
        obj.insert(
            "body_text".into(),
            String::from_utf8_lossy(&wh.body).into_owned().into(),
        );
    }
    Ok(out)
}

async fn op_delete_webhook(scope: &Scope, st: &Running, input: Value) -> Result<Value> {
    let id = required(parse_input::<IdInput>(input)?.id, "id")?;
    st.store.delete(scope, &id).await?;
    Ok(json!({ "deleted": true, "id": id }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct DeleteInput {
    older_than: Option<String>,
    provider: Option<String>,
    status: Option<u16>,
}

async fn op_delete_webhooks(scope: &Scope, st: &Running, input: Value) -> Result<Value> {
    let input: DeleteInput = parse_input(input)?;
    let filter = DeleteFilter {
        older_than: input
            .older_than
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .map(parse_age)
            .transpose()?,
        provider: input.provider,
        status: input.status,
    };
    let deleted = st.store.delete_by_filter(scope, &filter).await?;
    Ok(json!({ "deleted": deleted }))
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct ReplayInput {
    id: Option<String>,
    count: i64,
    target: Option<String>,
    patch: Option<Value>,
    dry_run: bool,
}

impl ReplayInput {
    fn target(&self, config: &Config) -> Result<String> {
        self.target
            .as_deref()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .or_else(|| config.replay_base())
            .map(str::to_string)
            .ok_or_else(|| Error::validation("no replay target: pass target or configure one"))
    }
}

fn engine(st: &Running, dry_run: bool) -> ReplayEngine {
    ReplayEngine::new(st.store.clone(), st.client.clone()).dry_run(dry_run)
}

async fn op_replay_webhook(scope: &Scope, st: &Running, input: Value) -> Result<Value> {
    let input: ReplayInput = parse_input(input)?;
    let target = input.target(&st.config)?;
    let id = required(input.id, "id")?;
    let patch = patch_text(input.patch)?;
    let outcome = engine(st, input.dry_run)
        .replay_by_id(scope, &id, &target, &patch)
        .await?;
    serde_json::to_value(outcome).map_err(|e| Error::storage("encode outcome", e))
}

async fn op_replay_last(scope: &Scope, st: &Running, input: Value) -> Result<Value> {
    let input: ReplayInput = parse_input(input)?;
    if input.count <= 0 || input.count > MAX_LIMIT as i64 {
        return Err(Error::validation(format!(
            "count must be between 1 and {MAX_LIMIT}"
        )));
    }
    let target = input.target(&st.config)?;
    let patch = patch_text(input.patch)?;
    let filter = ListFilter {
        limit: input.count,
        ..Default::default()
    };
    let newest = st.store.list_summaries(scope, &filter).await?;
    let engine = engine(st, input.dry_run);

    let mut results = Vec::new();
    let mut errors = Vec::new();
    for summary in newest {
        match engine.replay_by_id(scope, &summary.id, &target, &patch).await {
            Ok(outcome) => results.push(outcome),
            Err(e) if e.is_cancellation() => return Err(e),
            Err(e) => {
                tracing::warn!(id = %summary.id, error = %e, "replay failed");
                errors.push(json!({ "id": summary.id, "code": error_code(&e), "error": e.to_string() }));
            }
        }
    }
    Ok(json!({ "results": results, "errors": errors }))
}
