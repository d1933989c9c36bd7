use async_trait::async_trait;
use tokio::process::Command;

use super::{CONTAINER_DATA_DIR, Language, RunOutput, RunSpec, SandboxRunner, run_process};
use crate::error::{Result, SandboxError};

/// Project directory baked into the executor image that pins the Python deps.
const PYTHON_PROJECT_DIR: &str = "/opt/sandbox";

/// Exit status `docker run` reports when the container could not be created.
const DOCKER_RUN_FAILURE: i32 = 125;

/// Runs each execution in a throwaway container via the Docker CLI
///
/// The container has no network, a memory and CPU ceiling, and sees only its
/// execution directory, mounted read-write at [`CONTAINER_DATA_DIR`].
pub struct DockerRunner {
    binary: String,
}

impl DockerRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn container_name(spec: &RunSpec) -> String {
        format!("sandbox-{}", spec.exec_id)
    }

    /// Full argv after the runtime binary
    pub fn docker_args(spec: &RunSpec) -> Vec<String> {
        let script = format!("{CONTAINER_DATA_DIR}/{}", spec.script_name());
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            Self::container_name(spec),
            "--network".to_string(),
            "none".to_string(),
            "--memory".to_string(),
            format!("{}m", spec.memory_mb),
            "--cpus".to_string(),
            format!("{}", spec.cpus),
            "-v".to_string(),
            format!("{}:{CONTAINER_DATA_DIR}:rw", spec.exec_dir.display()),
            "-w".to_string(),
            CONTAINER_DATA_DIR.to_string(),
            spec.image.clone(),
        ];

        match spec.language {
            Language::Python => args.extend(
                ["uv", "run", "--project", PYTHON_PROJECT_DIR, "python"]
                    .into_iter()
                    .map(String::from),
            ),
            Language::JavaScript | Language::Other => args.push("bun".to_string()),
        }
        args.push(script);
        args.extend(spec.args.iter().cloned());
        args
    }

    /// Separates failures of the Docker CLI itself (daemon unreachable, image
    /// pull failure) from the user's program exiting with 125.
    fn check_runtime_failure(output: RunOutput) -> Result<RunOutput> {
        if output.exit_code == DOCKER_RUN_FAILURE
            && output.stderr.trim_start().starts_with("docker:")
        {
            return Err(SandboxError::ExecutionInfrastructure(
                output.stderr.trim().to_string(),
            ));
        }
        Ok(output)
    }

    /// Killing the CLI client leaves the container running, so stop it by name.
    async fn kill_container(&self, spec: &RunSpec) {
        let name = Self::container_name(spec);
        match Command::new(&self.binary).args(["kill", &name]).output().await {
            Ok(out) if out.status.success() => log::info!("Killed timed out container {name}"),
            Ok(out) => log::warn!(
                "docker kill {name} failed: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
            Err(e) => log::warn!("Unable to run docker kill for {name}: {e}"),
        }
    }
}

#[async_trait]
impl SandboxRunner for DockerRunner {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(Self::docker_args(spec));
        log::debug!("Starting container {}", Self::container_name(spec));

        let output = run_process(cmd, spec.timeout).await?;
        if output.timed_out {
            self.kill_container(spec).await;
            return Ok(output);
        }
        Self::check_runtime_failure(output)
    }
}
