//! Process liveness, stop/escalation, and background spawning.

use gproxy_core::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;

use crate::Supervisor;

/// Poll interval for liveness checks while stopping.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long `stop` waits before escalating to SIGKILL.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a background `serve` waits for the PID file to appear.
const SPAWN_TIMEOUT: Duration = Duration::from_secs(2);

/// One instance as reported by `list`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

impl Supervisor {
    /// Check whether an instance is running: PID file plus signal-0.
    /// Returns `(running, pid, port)`.
    pub fn is_running(&self, name: &str) -> (bool, Option<i32>, Option<u16>) {
        let Some(info) = self.read_pid(name) else {
            return (false, None, None);
        };
        if process_alive(info.pid) {
            (true, Some(info.pid), Some(info.port))
        } else {
            (false, None, Some(info.port))
        }
    }

    /// Scan the base directory and report every instance with its
    /// running status.
    pub fn list_instances(&self) -> Vec<InstanceStatus> {
        self.instance_names()
            .into_iter()
            .map(|name| {
                let config = self.read_config(&name);
                let (running, pid, running_port) = self.is_running(&name);
                let host = config
                    .as_ref()
                    .map(|c| c.host.clone())
                    .unwrap_or_else(|| "0.0.0.0".to_string());
                let port = running_port
                    .or(config.as_ref().map(|c| c.port))
                    .unwrap_or(8000);
                InstanceStatus {
                    url: running.then(|| format!("http://localhost:{port}")),
                    name,
                    host,
                    port,
                    running,
                    pid,
                }
            })
            .collect()
    }

    /// Stop a running instance.
    ///
    /// Sends SIGTERM (SIGKILL when `force`), polls liveness at 100 ms
    /// for up to five seconds, escalates to SIGKILL and polls once
    /// more. The PID file is removed on confirmed death. Returns true
    /// when the process is gone.
    pub async fn stop_instance(&self, name: &str, force: bool) -> bool {
        let (running, pid, _) = self.is_running(name);
        let Some(pid) = pid.filter(|_| running) else {
            return false;
        };

        let signal = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        if kill(Pid::from_raw(pid), signal).is_err() {
            self.remove_pid(name);
            return false;
        }

        let iterations = (STOP_TIMEOUT.as_millis() / POLL_INTERVAL.as_millis()) as u32;
        for _ in 0..iterations {
            tokio::time::sleep(POLL_INTERVAL).await;
            if !process_alive(pid) {
                self.remove_pid(name);
                return true;
            }
        }

        if !force {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            tokio::time::sleep(POLL_INTERVAL * 5).await;
            if !process_alive(pid) {
                self.remove_pid(name);
                return true;
            }
        }
        false
    }

    /// Stop every running instance (`name == "*"`) or one by name.
    /// Returns the names that were stopped.
    pub async fn stop_matching(&self, name: &str, force: bool) -> Vec<String> {
        let mut stopped = Vec::new();
        if name == "*" {
            for status in self.list_instances() {
                if status.running && self.stop_instance(&status.name, force).await {
                    stopped.push(status.name);
                }
            }
        } else if self.stop_instance(name, force).await {
            stopped.push(name.to_string());
        }
        stopped
    }

    /// Spawn `<cli_command> serve <name> --host H --port P` detached
    /// and poll up to two seconds for the PID file to appear.
    ///
    /// Returns the spawned instance's PID when it came up in time.
    pub async fn spawn_background(&self, name: &str, host: &str, port: u16) -> Result<Option<i32>> {
        let mut command = std::process::Command::new(&self.cli_command);
        command
            .arg("serve")
            .arg(name)
            .arg("--host")
            .arg(host)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        {
            use std::os::unix::process::CommandExt;
            // Detach from our process group so the child survives us.
            command.process_group(0);
        }
        command
            .spawn()
            .map_err(|e| gproxy_core::ProxyError::configuration(format!(
                "cannot spawn '{}': {e}",
                self.cli_command
            )))?;

        let iterations = (SPAWN_TIMEOUT.as_millis() / POLL_INTERVAL.as_millis()) as u32;
        for _ in 0..iterations {
            tokio::time::sleep(POLL_INTERVAL).await;
            let (running, pid, _) = self.is_running(name);
            if running {
                return Ok(pid);
            }
        }
        Ok(None)
    }
}
