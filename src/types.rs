use crate::headers::Headers;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_LIMIT: usize = 20;
pub const MAX_LIMIT: usize = 500;

/// One captured inbound request plus the outcome it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedWebhook {
    pub id: String,
    /// Epoch milliseconds. Zero means "now" on insert.
    pub created_at: i64,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    pub headers: Headers,
    #[serde(skip)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub signature: String,
    pub status_code: Option<u16>,
    pub response_ms: i64,
    /// Indexed text view of the body; empty for binary payloads.
    #[serde(default)]
    pub searchable_text: String,
}

impl CapturedWebhook {
    pub fn content_type(&self) -> &str {
        self.headers.value("content-type")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookSummary {
    pub id: String,
    pub created_at: i64,
    pub method: String,
    pub path: String,
    pub provider: String,
    pub event_type: String,
    pub status_code: Option<u16>,
    pub response_ms: i64,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub limit: i64,
    pub provider: Option<String>,
    pub status: Option<u16>,
    /// Inclusive lower bound.
    pub from: Option<DateTime<Utc>>,
    /// Inclusive upper bound.
    pub to: Option<DateTime<Utc>>,
}

/// Out-of-range limits fall back to the default rather than saturating.
pub fn clamp_limit(limit: i64) -> usize {
    if limit <= 0 || limit > MAX_LIMIT as i64 {
        DEFAULT_LIMIT
    } else {
        limit as usize
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeleteFilter {
    pub older_than: Option<Duration>,
    pub provider: Option<String>,
    pub status: Option<u16>,
}

impl DeleteFilter {
    pub fn is_empty(&self) -> bool {
        self.older_than.map_or(true, |d| d.is_zero())
            && self.provider.as_deref().map_or(true, |p| p.trim().is_empty())
            && self.status.is_none()
    }
}
