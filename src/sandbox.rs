mod docker_runner;
mod runner;
mod simple_runner;

pub use docker_runner::DockerRunner;
pub use runner::SandboxRunner;
pub use simple_runner::SimpleRunner;

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::{ExecutorConfig, RuntimeKind};
use crate::error::{Result, SandboxError};

/// Mount point of the execution directory inside the container.
pub const CONTAINER_DATA_DIR: &str = "/mnt/data";

/// Per-stream ceiling on captured output.
const MAX_CAPTURED_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    Python,
    JavaScript,
    Other,
}

impl Language {
    pub fn parse(lang: &str) -> Self {
        match lang.trim().to_ascii_lowercase().as_str() {
            "py" | "python" | "python3" => Self::Python,
            "js" | "javascript" | "ts" | "typescript" | "node" => Self::JavaScript,
            _ => Self::Other,
        }
    }

    pub fn script_name(self) -> &'static str {
        match self {
            Self::Python => "script.py",
            Self::JavaScript => "script.js",
            Self::Other => "script.txt",
        }
    }
}

/// Everything a runner needs to execute one prepared execution directory.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub exec_id: String,
    pub exec_dir: PathBuf,
    pub language: Language,
    pub args: Vec<String>,
    pub image: String,
    pub timeout: Duration,
    pub memory_mb: u64,
    pub cpus: f64,
}

impl RunSpec {
    pub fn script_name(&self) -> &'static str {
        self.language.script_name()
    }
}

/// Raw process outcome. A non-zero `exit_code` is a normal result.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Creates the runner selected by configuration
///
/// The Docker runner provides full isolation; the simple runner executes the
/// interpreter directly on the host and is meant for development only.
pub fn create_sandbox_runner(config: &ExecutorConfig) -> anyhow::Result<Box<dyn SandboxRunner>> {
    match config.runtime {
        RuntimeKind::Docker => {
            let available = std::process::Command::new("which")
                .arg(&config.docker_binary)
                .output()
                .map(|output| output.status.success())
                .unwrap_or(false);
            if !available {
                log::warn!(
                    "Container runtime `{}` not found on PATH; executions will report exit code -1",
                    config.docker_binary
                );
            }
            log::info!("Creating DockerRunner (image {})", config.docker_image);
            Ok(Box::new(DockerRunner::new(&config.docker_binary)))
        }
        RuntimeKind::Simple => {
            log::info!("Creating SimpleRunner (no isolation)");
            Ok(Box::new(SimpleRunner::new()))
        }
    }
}

fn spawn_reader<R>(mut pipe: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::new();
        let mut chunk = [0u8; 8192];
        let mut truncated = false;

        // Keep draining past the cap so the child never blocks on a full pipe.
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let room = MAX_CAPTURED_BYTES.saturating_sub(kept.len());
                    kept.extend_from_slice(&chunk[..n.min(room)]);
                    truncated |= n > room;
                }
                Err(e) => {
                    log::warn!("Failed to read process output: {e}");
                    break;
                }
            }
        }

        let mut text = String::from_utf8_lossy(&kept).into_owned();
        if truncated {
            text.push_str("\n[output truncated]");
        }
        text
    })
}

async fn collect(handle: Option<JoinHandle<String>>) -> String {
    match handle {
        Some(handle) => match tokio::time::timeout(Duration::from_secs(5), handle).await {
            Ok(Ok(text)) => text,
            Ok(Err(e)) => {
                log::warn!("Output reader failed: {e}");
                String::new()
            }
            Err(_) => {
                log::warn!("Output reader did not finish after process exit");
                String::new()
            }
        },
        None => String::new(),
    }
}

/// Spawns `cmd`, captures both streams and enforces a wall-clock timeout by
/// killing the process.
///
/// Only a failure to spawn or wait is an error; the exit code of the process,
/// whatever it is, is reported in [`RunOutput`].
pub(crate) async fn run_process(mut cmd: Command, timeout: Duration) -> Result<RunOutput> {
    let program = cmd.as_std().get_program().to_string_lossy().into_owned();
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|e| {
        SandboxError::ExecutionInfrastructure(format!("failed to spawn {program}: {e}"))
    })?;

    let stdout = child.stdout.take().map(spawn_reader);
    let stderr = child.stderr.take().map(spawn_reader);

    let (status, timed_out) = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            let status = status.map_err(|e| {
                SandboxError::ExecutionInfrastructure(format!("failed to wait for {program}: {e}"))
            })?;
            (Some(status), false)
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                log::warn!("Failed to kill timed out {program}: {e}");
            }
            (None, true)
        }
    };

    let stdout = collect(stdout).await;
    let mut stderr = collect(stderr).await;

    // Killed by a signal (including our own timeout kill) has no exit code.
    let exit_code = status.and_then(|s| s.code()).unwrap_or(-1);
    if timed_out {
        if !stderr.is_empty() && !stderr.ends_with('\n') {
            stderr.push('\n');
        }
        stderr.push_str(&format!(
            "Execution timed out after {} ms",
            timeout.as_millis()
        ));
    }

    Ok(RunOutput {
        stdout,
        stderr,
        exit_code,
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_parsing() {
        assert_eq!(Language::parse("py"), Language::Python);
        assert_eq!(Language::parse("Python"), Language::Python);
        assert_eq!(Language::parse("ts"), Language::JavaScript);
        assert_eq!(Language::parse("js"), Language::JavaScript);
        assert_eq!(Language::parse("r"), Language::Other);
        assert_eq!(Language::Python.script_name(), "script.py");
        assert_eq!(Language::JavaScript.script_name(), "script.js");
        assert_eq!(Language::Other.script_name(), "script.txt");
    }

    #[tokio::test]
    async fn test_run_process_passes_exit_code_through() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let output = run_process(cmd, Duration::from_secs(10)).await.unwrap();

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert!(!output.timed_out);
    }

    #[tokio::test]
    async fn test_run_process_times_out() {
        let mut cmd = Command::new("sleep");
        cmd.arg("10");
        let output = run_process(cmd, Duration::from_millis(100)).await.unwrap();

        assert!(output.timed_out);
        assert_eq!(output.exit_code, -1);
        assert!(output.stderr.contains("timed out after 100 ms"));
    }

    #[tokio::test]
    async fn test_run_process_spawn_failure_is_infrastructure_error() {
        let cmd = Command::new("/nonexistent/container-runtime");
        let err = run_process(cmd, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, SandboxError::ExecutionInfrastructure(_)));
    }
}
