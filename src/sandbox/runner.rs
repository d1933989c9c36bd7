use async_trait::async_trait;

use super::{RunOutput, RunSpec};
use crate::error::Result;

/// Trait for different sandbox execution implementations
///
/// This trait abstracts the one thing the executor needs from a container
/// runtime: run the script staged in an execution directory under the given
/// limits and report what the process printed and how it exited. Staging and
/// output harvesting stay in the executor so every runtime shares them.
#[async_trait]
pub trait SandboxRunner: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Runs `spec.script_name()` inside `spec.exec_dir`
    ///
    /// Returns `Err` only when the runtime itself is unusable (binary missing,
    /// spawn failure); user-code failures are ordinary [`RunOutput`]s.
    async fn run(&self, spec: &RunSpec) -> Result<RunOutput>;
}
