use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ExecutorConfig;
use crate::error::{Result, SandboxError};
use crate::path_guard::{extension_of, resolve_within, sanitize_filename};
use crate::sandbox::{Language, RunOutput, RunSpec, SandboxRunner};
use crate::storage::{
    DIR_PERMISSIONS, EXEC_DIR_PREFIX, JsonIndex, MANIFEST_FILE, SessionPaths, SessionStorage,
    write_restricted,
};

/// Reference to a previously uploaded file, staged under `name`.
#[derive(Deserialize, Debug, Clone)]
pub struct FileRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub user_id: String,
    pub session_id: String,
    pub lang: String,
    pub code: String,
    pub args: Vec<String>,
    pub files: Vec<FileRef>,
    pub docker_image: Option<String>,
    pub timeout: Option<Duration>,
    pub memory_mb: Option<u64>,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct GeneratedFile {
    pub id: String,
    pub name: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct ExecutionResult {
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    #[serde(rename = "exitCode")]
    pub exit_code: i32,
    pub files: Vec<GeneratedFile>,
}

/// Runs one request in a fresh execution directory and harvests its outputs.
pub struct Executor {
    storage: Arc<SessionStorage>,
    runner: Arc<dyn SandboxRunner>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(
        storage: Arc<SessionStorage>,
        runner: Arc<dyn SandboxRunner>,
        config: ExecutorConfig,
    ) -> Self {
        log::info!("Executor using {} runtime", runner.name());
        Self {
            storage,
            runner,
            config,
        }
    }

    pub fn storage(&self) -> &Arc<SessionStorage> {
        &self.storage
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn runtime_name(&self) -> &'static str {
        self.runner.name()
    }

    /// Stages inputs, runs the code and collects generated files.
    ///
    /// A non-zero exit code is an ordinary result, and so is a runtime that
    /// could not be started (exit code -1, reason in stderr). Only security
    /// and storage failures come back as `Err`.
    pub async fn execute(&self, options: ExecuteOptions) -> Result<ExecutionResult> {
        let paths = self
            .storage
            .ensure_session_dirs(&options.user_id, &options.session_id)
            .await?;

        let mut exec_id = crate::generate_id();
        exec_id.truncate(8);
        let exec_dir = resolve_within(
            self.storage.root(),
            paths.workspace.join(format!("{EXEC_DIR_PREFIX}{exec_id}")),
        )?;
        // Fails if the directory exists; execution directories are never reused.
        tokio::fs::DirBuilder::new()
            .mode(DIR_PERMISSIONS)
            .create(&exec_dir)
            .await?;

        let result = self.run_in(&paths, &exec_id, &exec_dir, &options).await;
        self.schedule_cleanup(exec_dir);
        result
    }

    async fn run_in(
        &self,
        paths: &SessionPaths,
        exec_id: &str,
        exec_dir: &Path,
        options: &ExecuteOptions,
    ) -> Result<ExecutionResult> {
        let language = Language::parse(&options.lang);
        let inputs = self
            .stage_inputs(paths, exec_dir, &options.files, language.script_name())
            .await?;

        let script = resolve_within(exec_dir, language.script_name())?;
        write_restricted(&script, options.code.as_bytes()).await?;

        let spec = RunSpec {
            exec_id: exec_id.to_string(),
            exec_dir: exec_dir.to_path_buf(),
            language,
            args: options.args.clone(),
            image: options
                .docker_image
                .clone()
                .unwrap_or_else(|| self.config.docker_image.clone()),
            timeout: options
                .timeout
                .unwrap_or(Duration::from_millis(self.config.timeout_ms)),
            memory_mb: options.memory_mb.unwrap_or(self.config.memory_mb),
            cpus: self.config.cpus,
        };

        let output = match self.runner.run(&spec).await {
            Ok(output) => output,
            Err(e) => {
                log::error!("Execution {exec_id} could not be started: {e}");
                RunOutput {
                    stderr: e.to_string(),
                    exit_code: -1,
                    ..Default::default()
                }
            }
        };
        if output.timed_out {
            log::warn!("Execution {exec_id} timed out after {:?}", spec.timeout);
        }

        let mut skip = inputs;
        skip.insert(language.script_name().to_string());
        let files = match self.harvest_outputs(paths, exec_dir, &skip).await {
            Ok(files) => files,
            Err(e) => {
                log::error!("Failed to collect outputs of execution {exec_id}: {e}");
                Vec::new()
            }
        };

        Ok(ExecutionResult {
            session_id: options.session_id.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            files,
        })
    }

    /// Copies each referenced upload into the execution directory under its
    /// original name. Returns the staged names.
    ///
    /// `script_name` is reserved for the submitted code; an input asking for
    /// it is refused.
    async fn stage_inputs(
        &self,
        paths: &SessionPaths,
        exec_dir: &Path,
        files: &[FileRef],
        script_name: &str,
    ) -> Result<HashSet<String>> {
        let mut staged = HashSet::new();
        if files.is_empty() {
            return Ok(staged);
        }
        let manifest = JsonIndex::load(&paths.uploads.join(MANIFEST_FILE)).await;

        for file in files {
            let Some(source) = self.storage.find_upload(paths, &file.id).await? else {
                log::warn!("Input file {} not found in session uploads, skipping", file.id);
                continue;
            };

            let requested = file
                .name
                .as_deref()
                .or_else(|| manifest.get(&file.id).map(String::as_str))
                .unwrap_or(&file.id);
            let name = sanitize_filename(requested)?;
            if name == script_name {
                return Err(SandboxError::InvalidFilename(name));
            }
            let dest = resolve_within(exec_dir, &name)?;

            tokio::fs::copy(&source, &dest).await?;
            staged.insert(name);
        }
        Ok(staged)
    }

    /// Treats every top-level regular file not in `skip` as output, copies it
    /// to `workspace/{newId}{ext}` and records its name in the manifest.
    ///
    /// Symlinks, hidden files and subdirectories are ignored.
    async fn harvest_outputs(
        &self,
        paths: &SessionPaths,
        exec_dir: &Path,
        skip: &HashSet<String>,
    ) -> Result<Vec<GeneratedFile>> {
        let mut entries = tokio::fs::read_dir(exec_dir).await?;
        let mut generated = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || skip.contains(&name) {
                continue;
            }
            if !entry.file_type().await?.is_file() {
                log::debug!("Skipping non-regular output entry {name}");
                continue;
            }

            let file_id = crate::generate_id();
            let dest = resolve_within(
                self.storage.root(),
                paths
                    .workspace
                    .join(format!("{file_id}{}", extension_of(&name))),
            )?;
            if let Err(e) = tokio::fs::copy(entry.path(), &dest).await {
                log::warn!("Failed to copy output file {name}: {e}");
                continue;
            }
            self.storage.record_filename(paths, &file_id, &name).await?;

            generated.push(GeneratedFile { id: file_id, name });
        }

        generated.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(generated)
    }

    fn schedule_cleanup(&self, exec_dir: PathBuf) {
        let delay = Duration::from_millis(self.config.cleanup_delay_ms);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match tokio::fs::remove_dir_all(&exec_dir).await {
                Ok(()) => log::debug!("Removed execution directory {}", exec_dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => log::warn!(
                    "Failed to remove execution directory {}: {e}",
                    exec_dir.display()
                ),
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    use super::*;

    /// Writes the configured files into the execution directory and reports
    /// what it found there.
    #[derive(Default)]
    struct FakeRunner {
        exit_code: i32,
        stdout: &'static str,
        writes: Vec<(&'static str, &'static str)>,
        symlink_to: Option<PathBuf>,
        seen: Mutex<Vec<String>>,
        last_spec: Mutex<Option<RunSpec>>,
    }

    #[async_trait]
    impl SandboxRunner for FakeRunner {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn run(&self, spec: &RunSpec) -> Result<RunOutput> {
            let mut seen: Vec<String> = std::fs::read_dir(&spec.exec_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect();
            seen.sort();
            *self.seen.lock() = seen;
            *self.last_spec.lock() = Some(spec.clone());

            for (name, content) in &self.writes {
                std::fs::write(spec.exec_dir.join(name), content).unwrap();
            }
            if let Some(target) = &self.symlink_to {
                std::os::unix::fs::symlink(target, spec.exec_dir.join("leak.txt")).unwrap();
            }
            Ok(RunOutput {
                stdout: self.stdout.to_string(),
                stderr: String::new(),
                exit_code: self.exit_code,
                timed_out: false,
            })
        }
    }

    struct BrokenRunner;

    #[async_trait]
    impl SandboxRunner for BrokenRunner {
        fn name(&self) -> &'static str {
            "broken"
        }

        async fn run(&self, _spec: &RunSpec) -> Result<RunOutput> {
            Err(SandboxError::ExecutionInfrastructure(
                "failed to spawn docker: No such file or directory".to_string(),
            ))
        }
    }

    fn executor(runner: Arc<dyn SandboxRunner>) -> (tempfile::TempDir, Executor) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(SessionStorage::new(dir.path()).unwrap());
        let config = ExecutorConfig {
            cleanup_delay_ms: 150,
            ..Default::default()
        };
        (dir, Executor::new(storage, runner, config))
    }

    fn options(lang: &str, code: &str) -> ExecuteOptions {
        ExecuteOptions {
            user_id: "user1".to_string(),
            session_id: "sess1".to_string(),
            lang: lang.to_string(),
            code: code.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_exit_code_passes_through() {
        let runner = Arc::new(FakeRunner {
            exit_code: 3,
            stdout: "partial\n",
            ..Default::default()
        });
        let (_dir, executor) = executor(runner.clone());

        let result = executor
            .execute(options("py", "import sys; sys.exit(3)"))
            .await
            .unwrap();

        assert_eq!(result.exit_code, 3);
        assert_eq!(result.stdout, "partial\n");
        assert_eq!(result.session_id, "sess1");
        assert!(result.files.is_empty());
        assert_eq!(*runner.seen.lock(), vec!["script.py"]);
    }

    #[tokio::test]
    async fn test_generated_file_is_harvested_and_downloadable() {
        let runner = Arc::new(FakeRunner {
            writes: vec![("out.csv", "a,b\n1,2\n")],
            ..Default::default()
        });
        let (_dir, executor) = executor(runner);

        let result = executor
            .execute(options("py", "open('out.csv','w')"))
            .await
            .unwrap();

        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].name, "out.csv");

        let storage = executor.storage();
        let path = storage
            .get_file_path("user1", "sess1", &result.files[0].id)
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "a,b\n1,2\n");
        assert_eq!(
            storage
                .original_filename("user1", "sess1", &result.files[0].id)
                .await
                .unwrap()
                .as_deref(),
            Some("out.csv")
        );
    }

    #[tokio::test]
    async fn test_inputs_are_staged_under_original_name_and_not_harvested() {
        let runner = Arc::new(FakeRunner::default());
        let (_dir, executor) = executor(runner.clone());
        let stored = executor
            .storage()
            .save_upload("user1", "sess1", b"x,y\n", "data.csv")
            .await
            .unwrap();

        let mut opts = options("js", "require('fs').readFileSync('data.csv')");
        opts.files = vec![
            FileRef {
                id: stored.file_id.clone(),
                name: None,
                session_id: None,
            },
            FileRef {
                id: "missing".to_string(),
                name: Some("missing.txt".to_string()),
                session_id: None,
            },
        ];
        let result = executor.execute(opts).await.unwrap();

        assert_eq!(*runner.seen.lock(), vec!["data.csv", "script.js"]);
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn test_malicious_staged_name_is_rejected() {
        let (dir, executor) = executor(Arc::new(FakeRunner::default()));
        let stored = executor
            .storage()
            .save_upload("user1", "sess1", b"x", "a.txt")
            .await
            .unwrap();

        let mut opts = options("py", "pass");
        opts.files = vec![FileRef {
            id: stored.file_id,
            name: Some("../../../escape.txt".to_string()),
            session_id: None,
        }];
        let err = executor.execute(opts).await.unwrap_err();

        assert!(err.is_security());
        assert!(!dir.path().join("user1/escape.txt").exists());
    }

    #[tokio::test]
    async fn test_input_named_like_script_is_rejected() {
        let runner = Arc::new(FakeRunner::default());
        let (_dir, executor) = executor(runner.clone());
        let stored = executor
            .storage()
            .save_upload("user1", "sess1", b"USER_INPUT_DATA", "script.py")
            .await
            .unwrap();
        let input = FileRef {
            id: stored.file_id.clone(),
            name: None,
            session_id: None,
        };

        let mut opts = options("py", "print(open('script.py').read())");
        opts.files = vec![input.clone()];
        let err = executor.execute(opts).await.unwrap_err();

        assert!(matches!(err, SandboxError::InvalidFilename(ref name) if name == "script.py"));
        assert!(runner.seen.lock().is_empty());
        assert_eq!(std::fs::read(&stored.filepath).unwrap(), b"USER_INPUT_DATA");

        // Another language uses a different script name
        let mut opts = options("js", "require('fs').readFileSync('script.py')");
        opts.files = vec![input];
        executor.execute(opts).await.unwrap();
        assert_eq!(*runner.seen.lock(), vec!["script.js", "script.py"]);
    }

    #[tokio::test]
    async fn test_infrastructure_failure_becomes_result() {
        let (_dir, executor) = executor(Arc::new(BrokenRunner));

        let result = executor.execute(options("py", "print(1)")).await.unwrap();

        assert_eq!(result.exit_code, -1);
        assert!(result.stderr.contains("failed to spawn docker"));
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn test_symlinked_output_is_not_harvested() {
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        let runner = Arc::new(FakeRunner {
            symlink_to: Some(outside.path().join("secret")),
            ..Default::default()
        });
        let (_dir, executor) = executor(runner);

        let result = executor.execute(options("py", "pass")).await.unwrap();
        assert!(result.files.is_empty());
    }

    #[tokio::test]
    async fn test_limits_and_overrides_reach_the_runner() {
        let runner = Arc::new(FakeRunner::default());
        let (_dir, executor) = executor(runner.clone());

        let mut opts = options("python", "pass");
        opts.args = vec!["--verbose".to_string()];
        opts.memory_mb = Some(1024);
        opts.timeout = Some(Duration::from_secs(60));
        executor.execute(opts).await.unwrap();

        let spec = runner.last_spec.lock().clone().unwrap();
        assert_eq!(spec.memory_mb, 1024);
        assert_eq!(spec.timeout, Duration::from_secs(60));
        assert_eq!(spec.args, vec!["--verbose"]);
        assert_eq!(spec.image, "librechat/sandbox-executor:latest");
        assert!(spec.exec_dir.file_name().unwrap().to_string_lossy().starts_with("exec_"));
    }

    #[tokio::test]
    async fn test_execution_directory_is_removed_after_delay() {
        let runner = Arc::new(FakeRunner::default());
        let (_dir, executor) = executor(runner.clone());

        executor.execute(options("py", "pass")).await.unwrap();
        let exec_dir = runner.last_spec.lock().clone().unwrap().exec_dir;
        assert!(exec_dir.exists());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert!(!exec_dir.exists());
    }
}
