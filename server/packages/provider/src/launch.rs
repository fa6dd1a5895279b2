use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use codex_provider_error::ProviderError;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};

use crate::transport::{ConnectFuture, TransportFactory, TransportIo};

pub const DEFAULT_PROGRAM: &str = "codex";
pub const DEFAULT_ARGS: &[&str] = &["app-server"];

/// How to start one agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_PROGRAM),
            args: DEFAULT_ARGS.iter().map(|arg| arg.to_string()).collect(),
            env: HashMap::new(),
        }
    }
}

impl LaunchSpec {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: HashMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn display(&self) -> String {
        format_command_for_display(&self.program, &self.args)
    }
}

/// Spawns a fresh agent subprocess per connection.
#[derive(Debug, Clone, Default)]
pub struct ProcessTransportFactory {
    launch: LaunchSpec,
}

impl ProcessTransportFactory {
    pub fn new(launch: LaunchSpec) -> Self {
        Self { launch }
    }

    pub fn launch(&self) -> &LaunchSpec {
        &self.launch
    }

    async fn spawn(&self) -> Result<TransportIo, ProviderError> {
        let launch = &self.launch;
        let spawn_start = Instant::now();

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &launch.env {
            command.env(key, value);
        }

        tracing::info!(
            program = ?launch.program,
            args = ?launch.args,
            "spawning agent process"
        );

        let command_for_display = launch.display();
        let mut child = command.spawn().map_err(|err| {
            tracing::error!(
                program = ?launch.program,
                args = ?launch.args,
                error = %err,
                "failed to spawn agent process"
            );
            ProviderError::Spawn {
                command: command_for_display.clone(),
                message: err.to_string(),
            }
        })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(
            pid = pid,
            elapsed_ms = spawn_start.elapsed().as_millis() as u64,
            "agent process spawned"
        );

        let missing = |stream: &str| ProviderError::Spawn {
            command: command_for_display.clone(),
            message: format!("failed to capture subprocess {stream}"),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        tokio::spawn(drain_stderr(stderr, pid, spawn_start));

        Ok(TransportIo::new(format!("pid:{pid}"), stdout, stdin).with_child(child))
    }
}

impl TransportFactory for ProcessTransportFactory {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(self.spawn())
    }

    fn describe(&self) -> String {
        self.launch.display()
    }
}

async fn drain_stderr(stderr: ChildStderr, pid: u32, spawned_at: Instant) {
    let mut lines = BufReader::new(stderr).lines();
    let mut line_count: u64 = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        line_count += 1;
        tracing::info!(
            pid = pid,
            line_number = line_count,
            age_ms = spawned_at.elapsed().as_millis() as u64,
            "agent stderr: {}",
            line
        );
    }

    tracing::debug!(
        pid = pid,
        total_lines = line_count,
        age_ms = spawned_at.elapsed().as_millis() as u64,
        "agent stderr: stream ended"
    );
}

fn format_command_for_display(program: &std::path::Path, args: &[String]) -> String {
    let mut parts = Vec::with_capacity(args.len() + 1);
    parts.push(shell_quote(program.to_string_lossy().as_ref()));
    for arg in args {
        parts.push(shell_quote(arg));
    }
    parts.join(" ")
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_launch_runs_the_app_server() {
        let launch = LaunchSpec::default();
        assert_eq!(launch.display(), "'codex' 'app-server'");
    }

    #[test]
    fn display_quotes_embedded_single_quotes() {
        let launch = LaunchSpec::new("/opt/agent", vec!["--name".to_string(), "it's".to_string()]);
        assert_eq!(launch.display(), r"'/opt/agent' '--name' 'it'\''s'");
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let factory = ProcessTransportFactory::new(LaunchSpec::new(
            "/definitely/not/a/real/codex-binary",
            Vec::new(),
        ));
        match factory.connect().await {
            Err(ProviderError::Spawn { command, .. }) => {
                assert!(command.contains("codex-binary"));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("spawn should fail"),
        }
    }
}
