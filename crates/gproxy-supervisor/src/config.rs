//! Instance configuration file (`config.ini`).
//!
//! Sections: `[server]` (name, host, port), `[database]` (path),
//! `[auth]` (api_token). The file is created on first `serve` with a
//! fresh generated admin token and is never implicitly deleted.

use gproxy_core::{ProxyError, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::collections::HashMap;
use std::path::Path;

use crate::Supervisor;

/// Parsed instance configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub db_path: String,
    pub api_token: Option<String>,
}

/// Generate an admin token for a fresh instance config.
pub fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(43)
        .map(char::from)
        .collect()
}

/// Minimal INI reader: sections, `key = value`, `#`/`;` comments.
fn parse_ini(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(section) = line.strip_prefix('[').and_then(|s| s.strip_suffix(']')) {
            current = section.trim().to_string();
            sections.entry(current.clone()).or_default();
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            sections
                .entry(current.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    sections
}

fn get<'a>(
    sections: &'a HashMap<String, HashMap<String, String>>,
    section: &str,
    key: &str,
) -> Option<&'a str> {
    sections.get(section)?.get(key).map(String::as_str)
}

impl Supervisor {
    /// Read an instance configuration, `None` when the file is absent.
    pub fn read_config(&self, name: &str) -> Option<InstanceConfig> {
        let path = self.config_file(name);
        let content = std::fs::read_to_string(&path).ok()?;
        let sections = parse_ini(&content);

        Some(InstanceConfig {
            name: get(&sections, "server", "name").unwrap_or(name).to_string(),
            host: get(&sections, "server", "host")
                .unwrap_or("0.0.0.0")
                .to_string(),
            port: get(&sections, "server", "port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            db_path: get(&sections, "database", "path")
                .map(ToString::to_string)
                .unwrap_or_else(|| self.db_file(name).to_string_lossy().into_owned()),
            api_token: get(&sections, "auth", "api_token")
                .filter(|t| !t.is_empty())
                .map(ToString::to_string),
        })
    }

    /// Ensure the instance config exists, creating it with defaults
    /// and a fresh admin token when absent.
    pub fn ensure_config(&self, name: &str, host: &str, port: u16) -> Result<InstanceConfig> {
        let config_file = self.config_file(name);
        if !config_file.exists() {
            let instance_dir = self.instance_dir(name);
            std::fs::create_dir_all(&instance_dir)
                .map_err(|e| ProxyError::configuration(format!("cannot create {}: {e}", instance_dir.display())))?;
            let db_path = self.db_file(name);
            write_default_config(&config_file, name, host, port, &db_path, &generate_token())?;
        }
        self.read_config(name).ok_or_else(|| {
            ProxyError::configuration(format!("cannot read instance config for '{name}'"))
        })
    }
}

fn write_default_config(
    path: &Path,
    name: &str,
    host: &str,
    port: u16,
    db_path: &Path,
    api_token: &str,
) -> Result<()> {
    let content = format!(
        "# gproxy configuration\n\
         # Generated automatically - edit as needed\n\
         \n\
         [server]\n\
         name = {name}\n\
         host = {host}\n\
         port = {port}\n\
         \n\
         [database]\n\
         path = {}\n\
         \n\
         [auth]\n\
         api_token = {api_token}\n",
        db_path.display()
    );
    std::fs::write(path, content)
        .map_err(|e| ProxyError::configuration(format!("cannot write {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor() -> (tempfile::TempDir, Supervisor) {
        let dir = tempfile::tempdir().unwrap();
        let sup = Supervisor::new(dir.path(), "gproxy");
        (dir, sup)
    }

    #[test]
    fn test_ensure_config_creates_file_with_token() {
        let (_dir, sup) = supervisor();
        let config = sup.ensure_config("inst1", "127.0.0.1", 9001).unwrap();
        assert_eq!(config.name, "inst1");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 9001);
        assert!(config.api_token.is_some());
        assert!(sup.config_file("inst1").exists());
    }

    #[test]
    fn test_ensure_config_is_idempotent() {
        let (_dir, sup) = supervisor();
        let first = sup.ensure_config("inst1", "127.0.0.1", 9001).unwrap();
        // A later call with different values keeps the existing file.
        let second = sup.ensure_config("inst1", "0.0.0.0", 8000).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_read_config_parses_sections() {
        let (_dir, sup) = supervisor();
        std::fs::create_dir_all(sup.instance_dir("custom")).unwrap();
        std::fs::write(
            sup.config_file("custom"),
            "# comment\n[server]\nname = Custom Name\nhost = 10.0.0.1\nport = 8888\n\n\
             [database]\npath = /tmp/custom.db\n\n[auth]\napi_token = tok123\n",
        )
        .unwrap();

        let config = sup.read_config("custom").unwrap();
        assert_eq!(config.name, "Custom Name");
        assert_eq!(config.host, "10.0.0.1");
        assert_eq!(config.port, 8888);
        assert_eq!(config.db_path, "/tmp/custom.db");
        assert_eq!(config.api_token.as_deref(), Some("tok123"));
    }

    #[test]
    fn test_read_config_missing_file() {
        let (_dir, sup) = supervisor();
        assert!(sup.read_config("nope").is_none());
    }

    #[test]
    fn test_instance_names_require_config_or_db() {
        let (_dir, sup) = supervisor();
        sup.ensure_config("one", "0.0.0.0", 8000).unwrap();
        std::fs::create_dir_all(sup.instance_dir("stray")).unwrap();
        std::fs::create_dir_all(sup.instance_dir("legacy")).unwrap();
        std::fs::write(sup.db_file("legacy"), b"").unwrap();

        assert_eq!(sup.instance_names(), vec!["legacy", "one"]);
    }

    #[test]
    fn test_generated_tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
        assert_eq!(generate_token().len(), 43);
    }
}
