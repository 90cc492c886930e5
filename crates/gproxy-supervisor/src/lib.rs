//! gproxy process supervisor
//!
//! Manages the per-instance directory tree under a base directory
//! (`~/.gproxy/<name>/` by default): the plaintext `config.ini`, the
//! embedded database file, and the `server.pid` liveness record.
//! Provides liveness checks (signal 0), graceful stop with SIGTERM →
//! SIGKILL escalation, and detached background spawning of `serve`.
//!
//! The supervisor only mutates files under the instance directory;
//! concurrent `serve` calls on the same instance resolve through the
//! "already running" fast path.

pub mod config;
pub mod pidfile;
pub mod process;

pub use config::InstanceConfig;
pub use pidfile::PidInfo;
pub use process::InstanceStatus;

use gproxy_core::{ProxyError, Result};
use std::path::{Path, PathBuf};

/// Default base-directory name under the user's home.
pub const DEFAULT_DIR_NAME: &str = ".gproxy";

/// Database filename inside each instance directory.
pub const DB_FILE: &str = "data.db";

/// Configuration filename inside each instance directory.
pub const CONFIG_FILE: &str = "config.ini";

/// PID filename inside each instance directory.
pub const PID_FILE: &str = "server.pid";

/// Supervisor over one base directory of proxy instances.
#[derive(Debug, Clone)]
pub struct Supervisor {
    base_dir: PathBuf,
    /// Executable used to respawn instances in background mode.
    cli_command: String,
}

impl Supervisor {
    pub fn new(base_dir: impl Into<PathBuf>, cli_command: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            cli_command: cli_command.into(),
        }
    }

    /// Base directory for a proxy name: `~/.{proxy_name}/`.
    pub fn default_base_dir(proxy_name: Option<&str>) -> PathBuf {
        let dir_name = match proxy_name {
            Some(name) => format!(".{name}"),
            None => DEFAULT_DIR_NAME.to_string(),
        };
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(dir_name)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn cli_command(&self) -> &str {
        &self.cli_command
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    pub fn config_file(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(CONFIG_FILE)
    }

    pub fn db_file(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(DB_FILE)
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.instance_dir(name).join(PID_FILE)
    }

    /// Names of configured instances: subdirectories holding either a
    /// config file or a database file.
    pub fn instance_names(&self) -> Vec<String> {
        let Ok(entries) = std::fs::read_dir(&self.base_dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.path().is_dir())
            .filter(|entry| {
                let dir = entry.path();
                dir.join(CONFIG_FILE).exists() || dir.join(DB_FILE).exists()
            })
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        names.sort();
        names
    }

    /// Fail unless `name` is a configured instance.
    pub fn require_instance(&self, name: &str) -> Result<()> {
        if self.config_file(name).exists() || self.db_file(name).exists() {
            Ok(())
        } else {
            Err(ProxyError::configuration(format!(
                "instance '{name}' not found in {}",
                self.base_dir.display()
            )))
        }
    }
}
