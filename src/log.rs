use std::sync::{Arc, Mutex};
use tracing_subscriber::EnvFilter;

pub type Fields<'a> = &'a [(&'static str, String)];

/// Where the recorder reports problems it must not surface to the HTTP client.
pub trait CaptureLog: Send + Sync {
    fn warn(&self, message: &str, fields: Fields<'_>);
    fn error(&self, message: &str, fields: Fields<'_>);
}

/// Forwards to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLog;

impl CaptureLog for TracingLog {
    fn warn(&self, message: &str, fields: Fields<'_>) {
        tracing::warn!(fields = %render(fields), "{message}");
    }

    fn error(&self, message: &str, fields: Fields<'_>) {
        tracing::error!(fields = %render(fields), "{message}");
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullLog;

impl CaptureLog for NullLog {
    fn warn(&self, _: &str, _: Fields<'_>) {}
    fn error(&self, _: &str, _: Fields<'_>) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub level: Level,
    pub message: String,
    pub fields: Vec<(&'static str, String)>,
}

/// Keeps every entry in memory; handy for asserting on what was reported.
#[derive(Debug, Clone, Default)]
pub struct MemoryLog {
    entries: Arc<Mutex<Vec<Entry>>>,
}

impl MemoryLog {
    pub fn entries(&self) -> Vec<Entry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, level: Level, message: &str, fields: Fields<'_>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(Entry {
                level,
                message: message.to_string(),
                fields: fields.to_vec(),
            });
        }
    }
}

impl CaptureLog for MemoryLog {
    fn warn(&self, message: &str, fields: Fields<'_>) {
        self.push(Level::Warn, message, fields);
    }

    fn error(&self, message: &str, fields: Fields<'_>) {
        self.push(Level::Error, message, fields);
    }
}

fn render(fields: Fields<'_>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Install the stderr subscriber. Stdout belongs to the host protocol.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
