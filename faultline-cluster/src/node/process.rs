//! OS process backend.

use super::{LaunchSpec, NodeBackend, NodeHandle, StopMode};
use crate::error::{Error, Result};
use async_trait::async_trait;
use faultline_core::config::ProcessSettings;
use std::{
    collections::BTreeMap,
    fs::OpenOptions,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};
use tokio::{
    process::{Child, Command},
    sync::Mutex,
};
use tracing::{debug, info, warn};

/// Launches each node as a child process from templated arguments.
///
/// Recognised placeholders: `{node}`, `{ordinal}`, `{host}`, `{data_dir}`,
/// `{client_port}`, `{cluster_port}`, `{peers}`, `{database}`, `{config}`.
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    capture_output: bool,
}

impl ProcessBackend {
    /// Create a backend running `program` with argument templates.
    pub fn new<P: Into<PathBuf>>(program: P, args: Vec<String>) -> Self {
        Self { program: program.into(), args, env: BTreeMap::new(), capture_output: true }
    }

    /// Create a backend from the process settings; `None` when no program is configured.
    pub fn from_settings(settings: &ProcessSettings) -> Option<Self> {
        let program = settings.program.clone()?;
        Some(Self {
            program,
            args: settings.args.clone(),
            env: settings.env.clone(),
            capture_output: settings.capture_output,
        })
    }

    /// Add an environment variable to every launched process.
    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Send stdout/stderr to the node's log file instead of discarding it.
    pub fn with_capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    fn output(&self, spec: &LaunchSpec) -> Result<(Stdio, Stdio)> {
        if !self.capture_output {
            return Ok((Stdio::null(), Stdio::null()));
        }
        let log = OpenOptions::new().create(true).append(true).open(spec.root_dir.join("node.log"))?;
        let err = log.try_clone()?;
        Ok((Stdio::from(log), Stdio::from(err)))
    }
}

#[async_trait]
impl NodeBackend for ProcessBackend {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn launch(&self, spec: &LaunchSpec) -> Result<Arc<dyn NodeHandle>> {
        let args: Vec<String> = self.args.iter().map(|arg| expand_template(arg, spec)).collect();
        let (stdout, stderr) = self.output(spec)?;

        let child = Command::new(&self.program)
            .args(&args)
            .envs(&self.env)
            .current_dir(&spec.root_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::node_start(&spec.node, format!("spawn {}: {e}", self.program.display())))?;

        let pid = child.id();
        info!(node = %spec.node, ?pid, program = %self.program.display(), "Spawned node process");
        Ok(Arc::new(ProcessHandle { pid, child: Mutex::new(child) }))
    }
}

/// Handle of a spawned node process.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: Option<u32>,
    child: Mutex<Child>,
}

impl ProcessHandle {
    #[cfg(unix)]
    #[allow(unsafe_code)]
    fn terminate(&self) -> std::io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
        // SAFETY: kill(2) with a pid obtained from our own child has no memory effects.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> std::io::Result<()> {
        Err(std::io::Error::new(std::io::ErrorKind::Unsupported, "graceful stop needs signals"))
    }
}

#[async_trait]
impl NodeHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn stop(&self, mode: StopMode, grace: Duration) -> Result<()> {
        let mut child = self.child.lock().await;
        if child.try_wait()?.is_some() {
            debug!(pid = ?self.pid, "Process already exited");
            return Ok(());
        }

        if mode == StopMode::Graceful {
            match self.terminate() {
                Ok(()) => match tokio::time::timeout(grace, child.wait()).await {
                    Ok(status) => {
                        let status = status?;
                        debug!(pid = ?self.pid, %status, "Process exited after SIGTERM");
                        return Ok(());
                    },
                    Err(_) => warn!(
                        pid = ?self.pid,
                        grace_ms = grace.as_millis() as u64,
                        "Process ignored SIGTERM, killing"
                    ),
                },
                Err(err) => warn!(pid = ?self.pid, error = %err, "SIGTERM failed, killing"),
            }
        }

        child.kill().await?;
        Ok(())
    }

    async fn has_exited(&self) -> bool {
        let mut child = self.child.lock().await;
        !matches!(child.try_wait(), Ok(None))
    }
}

/// Substitute launch placeholders in one argument.
pub fn expand_template(template: &str, spec: &LaunchSpec) -> String {
    let peers = spec
        .settings
        .peers
        .values()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");

    template
        .replace("{node}", spec.node.as_str())
        .replace("{ordinal}", &spec.ordinal.to_string())
        .replace("{host}", &spec.host)
        .replace("{data_dir}", &spec.data_dir.display().to_string())
        .replace("{client_port}", &spec.client_port.to_string())
        .replace("{cluster_port}", &spec.cluster_port.to_string())
        .replace("{peers}", &peers)
        .replace("{database}", &spec.database)
        .replace("{config}", &spec.config_file.display().to_string())
}
