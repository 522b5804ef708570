use crate::detect::detect;
use crate::error::{Error, Result};
use crate::headers::{is_hop_by_hop, Headers};
use crate::log::CaptureLog;
use crate::scope::Scope;
use crate::store::WebhookStore;
use crate::target::{authority, resolve};
use crate::types::CapturedWebhook;
use axum::{
    body::{Body, Bytes},
    extract::{Request, State},
    http::{header, request::Parts, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use chrono::Utc;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use url::Url;

/// Largest request body that is captured.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;
/// Largest slice of a body that goes into the search index.
pub const MAX_SEARCHABLE_BYTES: usize = 200_000;

/// What happens to a request after it has been read.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Answer 200 straight away.
    RecordOnly,
    /// Proxy to the local application and relay its answer.
    Forward(Url),
}

impl Mode {
    pub fn from_target(target: Option<Url>) -> Self {
        target.map_or(Mode::RecordOnly, Mode::Forward)
    }

    pub fn describe(&self) -> String {
        match self {
            Mode::RecordOnly => "record-only".to_string(),
            Mode::Forward(url) => format!("forward -> {url}"),
        }
    }
}

/// Capture proxy: reads each inbound request, optionally forwards it, and stores it.
pub struct Recorder {
    mode: Mode,
    store: WebhookStore,
    client: reqwest::Client,
    log: Arc<dyn CaptureLog>,
    scope: Scope,
}

/// The outbound client shared by forwarding and replay.
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()?)
}

enum BodyError {
    TooLarge(usize),
    Read(String),
    Cancelled,
}

impl Recorder {
    pub fn new(
        mode: Mode,
        store: WebhookStore,
        client: reqwest::Client,
        log: Arc<dyn CaptureLog>,
        scope: Scope,
    ) -> Self {
        Self {
            mode,
            store,
            client,
            log,
            scope,
        }
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn router(self: Arc<Self>) -> Router {
        Router::new().fallback(handle_capture).with_state(self)
    }

    pub async fn capture(self: &Arc<Self>, req: Request) -> Response {
        let started = Instant::now();
        let created_at = Utc::now().timestamp_millis();
        let scope = self.scope.child();

        if scope.check().is_err() {
            return (StatusCode::SERVICE_UNAVAILABLE, "request cancelled").into_response();
        }

        let (parts, body) = req.into_parts();
        let body = match read_body(&scope, &parts.headers, body, MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(BodyError::TooLarge(size)) => {
                self.log
                    .warn("request body too large", &[("bytes", size.to_string())]);
                return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response();
            }
            Err(BodyError::Read(e)) => {
                self.log.error("failed to read request body", &[("error", e)]);
                return (StatusCode::BAD_REQUEST, "failed to read request body").into_response();
            }
            Err(BodyError::Cancelled) => {
                return (StatusCode::SERVICE_UNAVAILABLE, "request cancelled").into_response();
            }
        };

        // hyper drops this future when the sender hangs up. Dropping the guard then
        // cancels the forward, while the spawned task still records the outcome.
        let guard = scope.token().clone().drop_guard();
        let recorder = Arc::clone(self);
        let task = tokio::spawn(async move {
            recorder
                .respond_and_record(&scope, started, created_at, parts, body)
                .await
        });
        let response = match task.await {
            Ok(response) => response,
            Err(e) => {
                self.log
                    .error("capture task failed", &[("error", e.to_string())]);
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        };
        guard.disarm();
        response
    }

    async fn respond_and_record(
        &self,
        scope: &Scope,
        started: Instant,
        created_at: i64,
        parts: Parts,
        body: Bytes,
    ) -> Response {
        let id = uuid::Uuid::new_v4().to_string();
        let headers = Headers::from(&parts.headers);
        let detection = detect(&headers, &body);
        let searchable_text = searchable_text(headers.value("content-type"), &body);

        let (response, status, response_ms) = match &self.mode {
            Mode::RecordOnly => (StatusCode::OK.into_response(), StatusCode::OK, elapsed_ms(started)),
            Mode::Forward(target) => {
                match self.forward(scope, target, &parts, body.clone()).await {
                    Ok((response, ms)) => {
                        let status = response.status();
                        (response, status, ms)
                    }
                    Err(e) => {
                        self.log.warn(
                            "forward failed",
                            &[("error", e.to_string()), ("target", target.to_string())],
                        );
                        let status = if e.is_cancellation() {
                            StatusCode::SERVICE_UNAVAILABLE
                        } else {
                            StatusCode::BAD_GATEWAY
                        };
                        ((status, e.to_string()).into_response(), status, elapsed_ms(started))
                    }
                }
            }
        };

        let webhook = CapturedWebhook {
            id,
            created_at,
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            query: parts.uri.query().unwrap_or_default().to_string(),
            headers,
            body: body.to_vec(),
            provider: detection.provider,
            event_type: detection.event_type,
            signature: detection.signature,
            status_code: Some(status.as_u16()),
            response_ms,
            searchable_text,
        };

        // The response is already decided; a failed write is only reported. The write
        // runs under the server scope so a departed sender cannot cancel it.
        match self.store.insert(&self.scope.child(), &webhook).await {
            Ok(()) => tracing::debug!(
                id = %webhook.id,
                method = %webhook.method,
                path = %webhook.path,
                status = status.as_u16(),
                "captured webhook"
            ),
            Err(e) => self.log.error(
                "failed to store webhook",
                &[("id", webhook.id.clone()), ("error", e.to_string())],
            ),
        }

        response
    }

    async fn forward(
        &self,
        scope: &Scope,
        target: &Url,
        parts: &Parts,
        body: Bytes,
    ) -> Result<(Response, i64)> {
        let started = Instant::now();
        let url = resolve(target, parts.uri.path(), parts.uri.query().unwrap_or_default());

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in &parts.headers {
            if is_hop_by_hop(name.as_str()) || name == header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        if let Ok(host) = HeaderValue::from_str(&authority(target)) {
            headers.insert(header::HOST, host);
        }

        let request = self
            .client
            .request(parts.method.clone(), url)
            .headers(headers)
            .body(body);
        let upstream = scope
            .run(async { request.send().await.map_err(Error::from) })
            .await?;
        let ms = elapsed_ms(started);

        let mut response = Response::new(Body::empty());
        *response.status_mut() = upstream.status();
        for (name, value) in upstream.headers() {
            if !is_hop_by_hop(name.as_str()) {
                response.headers_mut().append(name.clone(), value.clone());
            }
        }
        *response.body_mut() = Body::from_stream(upstream.bytes_stream());

        Ok((response, ms))
    }
}

async fn handle_capture(State(recorder): State<Arc<Recorder>>, req: Request) -> Response {
    recorder.capture(req).await
}

async fn read_body(
    scope: &Scope,
    headers: &HeaderMap,
    body: Body,
    limit: usize,
) -> std::result::Result<Bytes, BodyError> {
    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok());
    if let Some(len) = declared.filter(|len| *len > limit) {
        return Err(BodyError::TooLarge(len));
    }

    let mut stream = body.into_data_stream();
    let mut buf = Vec::with_capacity(declared.unwrap_or(0));
    loop {
        let next = tokio::select! {
            biased;
            _ = scope.done() => return Err(BodyError::Cancelled),
            next = stream.next() => next,
        };
        match next {
            None => break,
            Some(Ok(chunk)) => {
                if buf.len() + chunk.len() > limit {
                    return Err(BodyError::TooLarge(buf.len() + chunk.len()));
                }
                buf.extend_from_slice(&chunk);
            }
            Some(Err(e)) => return Err(BodyError::Read(e.to_string())),
        }
    }
    Ok(Bytes::from(buf))
}

/// Text handed to the search index: textual bodies only, capped in size.
pub fn searchable_text(content_type: &str, body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    let ct = content_type.to_ascii_lowercase();
    let textual = ct.contains("application/json")
        || ct.contains("application/xml")
        || ct.contains("text/")
        || ct.contains("application/x-www-form-urlencoded");
    if !textual {
        return String::new();
    }

    let head = &body[..body.len().min(MAX_SEARCHABLE_BYTES)];
    let mut text = String::from_utf8_lossy(head).into_owned();
    if text.len() > MAX_SEARCHABLE_BYTES {
        let mut end = MAX_SEARCHABLE_BYTES;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

fn elapsed_ms(since: Instant) -> i64 {
    i64::try_from(since.elapsed().as_millis()).unwrap_or(i64::MAX)
}

/// Bind the recorder on `addr` and serve it until its scope is cancelled.
pub async fn start(
    recorder: Arc<Recorder>,
    addr: SocketAddr,
) -> Result<(SocketAddr, JoinHandle<()>)> {
    let listener = TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!(addr = %local, mode = %recorder.mode().describe(), "recorder listening");

    let token = recorder.scope.token().clone();
    let app = recorder.router();
    let handle = tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            tracing::error!(error = %e, "recorder server error");
        }
    });

    Ok((local, handle))
}
