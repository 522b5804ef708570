//! Webhook capture proxy: records inbound webhooks into SQLite, optionally forwards
//! them to a local application, and replays them later.

pub mod config;
pub mod detect;
pub mod error;
pub mod headers;
pub mod http_server;
pub mod log;
pub mod replay;
pub mod rpc;
pub mod scope;
pub mod store;
pub mod target;
pub mod types;

pub use error::{Error, Result};
pub use headers::Headers;
pub use http_server::{Mode, Recorder};
pub use replay::{ReplayEngine, ReplayOutcome};
pub use scope::Scope;
pub use store::WebhookStore;
pub use types::{CapturedWebhook, DeleteFilter, ListFilter, WebhookSummary};
