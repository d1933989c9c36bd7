use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug, Default)]
#[command(name = "sandbox-server", version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long = "config", short = 'c', env = "SANDBOX_CONFIG")]
    pub config_path: Option<String>,

    /// Whether to flush the existing audit database
    #[arg(long = "flush-data", short = 'f', default_value_t = false)]
    pub flush_data: bool,

    #[arg(long = "bind", env = "SANDBOX_BIND_ADDRESS")]
    pub bind_address: Option<String>,

    #[arg(long = "port", env = "SANDBOX_PORT")]
    pub bind_port: Option<u16>,

    /// Shared API key; empty disables authentication
    #[arg(long, env = "SANDBOX_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    #[arg(long, env = "SANDBOX_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    #[arg(long, env = "SANDBOX_MAX_CONCURRENT_EXECUTIONS")]
    pub max_concurrent: Option<usize>,

    #[arg(long, env = "SANDBOX_DOCKER_IMAGE")]
    pub docker_image: Option<String>,

    #[arg(long, env = "SANDBOX_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    #[arg(long, env = "SANDBOX_MEMORY_MB")]
    pub memory_mb: Option<u64>,

    /// SQLite file for the durable audit trail
    #[arg(long, env = "SANDBOX_AUDIT_DB")]
    pub audit_db: Option<PathBuf>,

    /// Keep audit records in the log only
    #[arg(long, default_value_t = false)]
    pub no_audit_db: bool,

    #[arg(long, env = "SANDBOX_AUDIT_TTL_DAYS")]
    pub audit_ttl_days: Option<u32>,
}

impl CliArgs {
    /// Load the configuration file (if any) and apply command line overrides
    pub fn to_config(&self) -> std::io::Result<Config> {
        let mut config = match &self.config_path {
            Some(path) => {
                let file = std::fs::File::open(path)?;
                let reader = std::io::BufReader::new(file);
                serde_json::from_reader(reader)?
            }
            None => Config::default(),
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(addr) = &self.bind_address {
            config.server.bind_address = addr.clone();
        }
        if let Some(port) = self.bind_port {
            config.server.bind_port = port;
        }
        if let Some(key) = &self.api_key {
            config.server.api_key = key.clone();
        }
        if let Some(root) = &self.storage_path {
            config.storage.root = root.clone();
        }
        if let Some(n) = self.max_concurrent {
            config.queue.max_concurrent = n;
        }
        if let Some(image) = &self.docker_image {
            config.executor.docker_image = image.clone();
        }
        if let Some(ms) = self.timeout_ms {
            config.executor.timeout_ms = ms;
        }
        if let Some(mb) = self.memory_mb {
            config.executor.memory_mb = mb;
        }
        if let Some(path) = &self.audit_db {
            config.audit.database_path = Some(path.clone());
        }
        if self.no_audit_db {
            config.audit.enabled = false;
        }
        if let Some(days) = self.audit_ttl_days {
            config.audit.ttl_days = Some(days);
        }
        config.queue.max_concurrent = config.queue.max_concurrent.max(1);
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub pdf: PdfConfig,
    pub audit: AuditConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub api_key: String,
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            bind_port: 3081,
            api_key: String::new(),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("storage"),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QueueConfig {
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrent: crate::queue::DEFAULT_MAX_CONCURRENT,
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    #[default]
    Docker,
    Simple,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ExecutorConfig {
    pub runtime: RuntimeKind,
    pub docker_binary: String,
    pub docker_image: String,
    pub timeout_ms: u64,
    pub memory_mb: u64,
    pub cpus: f64,
    /// Grace period before a finished execution directory is deleted
    pub cleanup_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            runtime: RuntimeKind::Docker,
            docker_binary: "docker".to_string(),
            docker_image: "librechat/sandbox-executor:latest".to_string(),
            timeout_ms: 30_000,
            memory_mb: 512,
            cpus: 1.0,
            cleanup_delay_ms: 1_000,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PdfConfig {
    pub timeout_ms: u64,
    pub memory_mb: u64,
}

impl Default for PdfConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            memory_mb: 1024,
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    /// Defaults to the per-user data directory
    pub database_path: Option<PathBuf>,
    pub ttl_days: Option<u32>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: None,
            ttl_days: None,
        }
    }
}
