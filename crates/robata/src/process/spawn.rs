use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::info;

use super::channel::{DispatcherEndpoint, Endpoint};
use crate::error::EngineError;

const VISIBLE_DEVICES: &str = "CUDA_VISIBLE_DEVICES";

/// How to launch one worker process.
///
/// Each worker runs `program args... --device <index>`, plus `--signal-ready`
/// when the dispatcher waits for readiness. The worker speaks the process
/// channel protocol on stdin and stdout; stderr is inherited for its logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables for the worker
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            env: BTreeMap::new(),
        }
    }

    pub fn with_arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Launches the worker bound to `device` and connects to its stdio.
    pub(crate) fn spawn(
        &self,
        device: usize,
        signal_ready: bool,
    ) -> Result<(Child, DispatcherEndpoint), EngineError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg("--device")
            .arg(device.to_string())
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if signal_ready {
            command.arg("--signal-ready");
        }

        let mut child = command.spawn()?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(EngineError::WorkerUnavailable(format!(
                "worker {device} started without piped stdio"
            )));
        };
        info!(
            device,
            pid = child.id(),
            program = %self.program.display(),
            "spawned worker process"
        );
        Ok((child, Endpoint::new(stdout, stdin)))
    }
}

/// Number of accelerators this process may use: one per entry of
/// `CUDA_VISIBLE_DEVICES`, or 1 when it is unset or empty.
pub fn detect_accelerators() -> usize {
    count_devices(std::env::var(VISIBLE_DEVICES).ok().as_deref())
}

fn count_devices(visible: Option<&str>) -> usize {
    let count = visible
        .map(|devices| devices.split(',').filter(|d| !d.trim().is_empty()).count())
        .unwrap_or(0);
    count.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_devices() {
        assert_eq!(count_devices(None), 1);
        assert_eq!(count_devices(Some("")), 1);
        assert_eq!(count_devices(Some("0")), 1);
        assert_eq!(count_devices(Some("0,1,3")), 3);
        assert_eq!(count_devices(Some("0, 1,")), 2);
    }

    #[test]
    fn test_command_from_toml() {
        let command: WorkerCommand = toml::from_str(
            r#"
            program = "/usr/bin/robata-worker"
            args = ["--reply", "hi"]
            env = { RUST_LOG = "debug" }
            "#,
        )
        .unwrap();
        assert_eq!(
            command,
            WorkerCommand::new("/usr/bin/robata-worker")
                .with_arg("--reply")
                .with_arg("hi")
                .with_env("RUST_LOG", "debug")
        );
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_spawn() {
        let command = WorkerCommand::new("/nonexistent/robata-worker");
        assert!(matches!(command.spawn(0, false), Err(EngineError::Io(_))));
    }
}
