use crate::error::{Error, Result};
use crate::headers::Headers;
use crate::scope::Scope;
use crate::store::WebhookStore;
use crate::target::{parse_base_url, resolve};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

/// Headers the HTTP client derives from the target and the (possibly patched) body.
const CLIENT_MANAGED: &[&str] = &["host", "content-length", "transfer-encoding"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReplayOutcome {
    pub webhook_id: String,
    pub url: String,
    pub sent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
}

/// A captured body as seen by the patcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<'a> {
    Structured(Value),
    /// Anything that is not JSON; patches never touch it.
    Opaque(&'a [u8]),
}

impl<'a> Payload<'a> {
    pub fn classify(content_type: &str, body: &'a [u8]) -> Result<Self> {
        let json_type = content_type.to_ascii_lowercase().contains("application/json");
        if !json_type && !looks_like_json(body) {
            return Ok(Payload::Opaque(body));
        }
        if body.is_empty() {
            return Ok(Payload::Structured(Value::Object(Default::default())));
        }
        serde_json::from_slice(body)
            .map(Payload::Structured)
            .map_err(|e| Error::validation(format!("captured body is not valid JSON: {e}")))
    }
}

fn looks_like_json(body: &[u8]) -> bool {
    matches!(
        body.iter().find(|b| !b.is_ascii_whitespace()),
        Some(b'{') | Some(b'[')
    )
}

/// Apply an RFC 7396 merge patch to a JSON body. Blank patches and non-JSON bodies
/// come back unchanged.
pub fn apply_merge_patch(content_type: &str, body: &[u8], patch: &str) -> Result<Vec<u8>> {
    if patch.trim().is_empty() {
        return Ok(body.to_vec());
    }
    match Payload::classify(content_type, body)? {
        Payload::Opaque(raw) => Ok(raw.to_vec()),
        Payload::Structured(mut doc) => {
            let patch: Value = serde_json::from_str(patch)
                .map_err(|e| Error::validation(format!("invalid merge patch: {e}")))?;
            json_patch::merge(&mut doc, &patch);
            serde_json::to_vec(&doc)
                .map_err(|e| Error::validation(format!("cannot encode patched body: {e}")))
        }
    }
}

fn outbound_headers(headers: &Headers) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, values) in headers.iter() {
        if CLIENT_MANAGED.iter().any(|m| m.eq_ignore_ascii_case(name)) {
            continue;
        }
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            tracing::warn!(header = name, "skipping unsendable header name");
            continue;
        };
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(v) => {
                    out.append(header_name.clone(), v);
                }
                Err(_) => tracing::warn!(header = name, "skipping unsendable header value"),
            }
        }
    }
    out
}

/// Resends captured webhooks. Each call is one attempt; retries are up to the caller.
#[derive(Debug, Clone)]
pub struct ReplayEngine {
    store: WebhookStore,
    client: reqwest::Client,
    pub dry_run: bool,
}

impl ReplayEngine {
    pub fn new(store: WebhookStore, client: reqwest::Client) -> Self {
        Self {
            store,
            client,
            dry_run: false,
        }
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub async fn replay_by_id(
        &self,
        scope: &Scope,
        id: &str,
        target_base: &str,
        patch: &str,
    ) -> Result<ReplayOutcome> {
        let wh = self.store.get(scope, id).await?;
        let base = parse_base_url(target_base)?;
        let body = apply_merge_patch(wh.content_type(), &wh.body, patch)?;
        let url = resolve(&base, &wh.path, &wh.query);

        if self.dry_run {
            return Ok(ReplayOutcome {
                webhook_id: wh.id,
                url: url.to_string(),
                sent: false,
                status_code: None,
                duration_ms: None,
            });
        }

        let method = Method::from_bytes(wh.method.as_bytes())
            .map_err(|e| Error::validation(format!("invalid method {:?}: {e}", wh.method)))?;
        let request = self
            .client
            .request(method, url.clone())
            .headers(outbound_headers(&wh.headers))
            .body(body);

        let started = Instant::now();
        let mut response = scope
            .run(async { request.send().await.map_err(Error::from) })
            .await?;
        let status = response.status().as_u16();
        let duration_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        // Read the rest so the connection can be reused. The status is already in hand,
        // so an interrupted drain does not fail the replay.
        let drained = scope
            .run(async {
                while response.chunk().await?.is_some() {}
                Ok::<_, Error>(())
            })
            .await;
        if let Err(e) = drained {
            tracing::debug!(id = %wh.id, error = %e, "replay response drain interrupted");
        }

        tracing::info!(id = %wh.id, url = %url, status, duration_ms, "replayed webhook");
        Ok(ReplayOutcome {
            webhook_id: wh.id,
            url: url.to_string(),
            sent: true,
            status_code: Some(status),
            duration_ms: Some(duration_ms),
        })
    }
}
