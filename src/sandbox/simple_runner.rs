use async_trait::async_trait;
use tokio::process::Command;

use super::{Language, RunOutput, RunSpec, SandboxRunner, run_process};
use crate::error::Result;

/// A simple runner that executes code without sandboxing
///
/// SimpleRunner invokes the host's `python3` or `node` directly inside the
/// execution directory. It only enforces the wall-clock timeout: no memory,
/// network, or filesystem restrictions apply. Intended for development
/// environments where Docker is unavailable.
pub struct SimpleRunner;

impl SimpleRunner {
    pub fn new() -> Self {
        log::warn!("SimpleRunner provides NO security isolation - use only in trusted environments");
        Self
    }

    fn interpreter(language: Language) -> &'static str {
        match language {
            Language::Python => "python3",
            Language::JavaScript | Language::Other => "node",
        }
    }
}

impl Default for SimpleRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxRunner for SimpleRunner {
    fn name(&self) -> &'static str {
        "simple"
    }

    async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
        let mut cmd = Command::new(Self::interpreter(spec.language));
        cmd.arg(spec.script_name())
            .args(&spec.args)
            .current_dir(&spec.exec_dir);

        run_process(cmd, spec.timeout).await
    }
}
