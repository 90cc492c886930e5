//! PID file handling (`server.pid`).
//!
//! JSON shape: `{"pid": <int>, "port": <int>, "host": "<str>",
//! "started_at": "<iso8601>"}`. Written when a server starts, removed
//! on confirmed death or clean shutdown.

use chrono::{SecondsFormat, Utc};
use gproxy_core::{ProxyError, Result};
use serde::{Deserialize, Serialize};

use crate::Supervisor;

/// Contents of a `server.pid` file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PidInfo {
    pub pid: i32,
    pub port: u16,
    pub host: String,
    pub started_at: String,
}

impl Supervisor {
    /// Read the PID file, `None` when absent or unparseable.
    pub fn read_pid(&self, name: &str) -> Option<PidInfo> {
        let content = std::fs::read_to_string(self.pid_file(name)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Write the PID file for a freshly started server.
    pub fn write_pid(&self, name: &str, pid: i32, port: u16, host: &str) -> Result<()> {
        let path = self.pid_file(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProxyError::configuration(format!("cannot create {}: {e}", parent.display()))
            })?;
        }
        let info = PidInfo {
            pid,
            port,
            host: host.to_string(),
            started_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        };
        let content = serde_json::to_string_pretty(&info)
            .map_err(|e| ProxyError::internal(e.to_string()))?;
        std::fs::write(&path, content)
            .map_err(|e| ProxyError::configuration(format!("cannot write {}: {e}", path.display())))
    }

    /// Remove the PID file if present.
    pub fn remove_pid(&self, name: &str) {
        let path = self.pid_file(name);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                tracing::warn!(path = %path.display(), error = %e, "cannot remove pid file");
            }
        }
    }
}
