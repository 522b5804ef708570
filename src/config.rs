use crate::error::{Error, Result};
use crate::store::{default_db_path, MEMORY_PATH};
use crate::target::parse_base_url;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Settings handed over by the host in `initialize`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: Option<PathBuf>,
    pub db_path: Option<String>,
    /// Live-forward target; `host:port` shorthand is accepted.
    pub forward: Option<String>,
    /// Default base for replays when a call does not name one.
    pub replay_target: Option<String>,
    pub bind: Option<IpAddr>,
    pub port: u16,
    pub timeout_secs: Option<u64>,
}

impl Config {
    pub fn from_params(params: &serde_json::Value) -> Result<Self> {
        if params.is_null() {
            return Ok(Self::default());
        }
        let config: Self = serde_json::from_value(params.clone())
            .map_err(|e| Error::validation(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.forward_url()?;
        if let Some(target) = non_blank(&self.replay_target) {
            parse_base_url(target)?;
        }
        if let Some(db) = non_blank(&self.db_path) {
            if db != MEMORY_PATH && db.contains("..") {
                return Err(Error::validation(format!(
                    "database path contains invalid characters: {db:?}"
                )));
            }
        }
        if self.timeout_secs == Some(0) {
            return Err(Error::validation("timeout_secs must be positive"));
        }
        Ok(())
    }

    pub fn db_path(&self) -> String {
        match non_blank(&self.db_path) {
            Some(db) => db.to_string(),
            None => {
                let dir = self.data_dir.clone().unwrap_or_else(|| PathBuf::from("."));
                default_db_path(&dir).to_string_lossy().into_owned()
            }
        }
    }

    pub fn forward_url(&self) -> Result<Option<Url>> {
        non_blank(&self.forward).map(parse_base_url).transpose()
    }

    /// Replay base: explicit `replay_target`, else the forward target.
    pub fn replay_base(&self) -> Option<&str> {
        non_blank(&self.replay_target).or_else(|| non_blank(&self.forward))
    }

    pub fn listen_addr(&self) -> SocketAddr {
        let ip = self.bind.unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS))
    }
}

fn non_blank(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}
