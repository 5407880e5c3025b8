use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub state: StateConfig,
    #[serde(default)]
    pub mssql: MssqlConfig,
    #[serde(default)]
    pub backup: BackupConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub rag: RagConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StateConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MssqlConfig {
    #[serde(default = "default_mssql_host")]
    pub host: String,
    #[serde(default = "default_mssql_port")]
    pub port: u16,
    #[serde(default = "default_mssql_user")]
    pub user: String,
    /// Usually left unset in the config file and supplied via `MSSQL_PASSWORD`.
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MssqlConfig {
    fn default() -> Self {
        Self {
            host: default_mssql_host(),
            port: default_mssql_port(),
            user: default_mssql_user(),
            password: None,
        }
    }
}

impl MssqlConfig {
    /// Resolve the password from config or the `MSSQL_PASSWORD` environment
    /// variable, checked at connection time rather than config load so that
    /// offline commands (`init`, `sources`) work without credentials.
    pub fn resolved_password(&self) -> Result<String> {
        if let Some(p) = &self.password {
            return Ok(p.clone());
        }
        std::env::var("MSSQL_PASSWORD")
            .map_err(|_| anyhow::anyhow!("MSSQL_PASSWORD environment variable not set"))
    }
}

fn default_mssql_host() -> String {
    "localhost".to_string()
}
fn default_mssql_port() -> u16 {
    1433
}
fn default_mssql_user() -> String {
    "sa".to_string()
}

/// Paths involved in moving a backup file from this process to the database
/// server. The two directories are the same volume seen from two mount points.
#[derive(Debug, Deserialize, Clone)]
pub struct BackupConfig {
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_server_backup_dir")]
    pub server_backup_dir: PathBuf,
    #[serde(default = "default_server_data_dir")]
    pub server_data_dir: PathBuf,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            backup_dir: default_backup_dir(),
            server_backup_dir: default_server_backup_dir(),
            server_data_dir: default_server_data_dir(),
        }
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("./backups")
}
fn default_server_backup_dir() -> PathBuf {
    PathBuf::from("/var/opt/mssql/backups")
}
fn default_server_data_dir() -> PathBuf {
    PathBuf::from("/var/opt/mssql/data")
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Azure OpenAI resource endpoint, e.g. `https://myresource.openai.azure.com`.
    pub endpoint: String,
    #[serde(default = "default_deployment")]
    pub deployment: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_chat_retries")]
    pub max_retries: u32,
    #[serde(default = "default_max_result_rows")]
    pub max_result_rows: usize,
}

fn default_deployment() -> String {
    "gpt-4o".to_string()
}
fn default_api_version() -> String {
    "2024-02-15-preview".to_string()
}
fn default_api_key_env() -> String {
    "AZURE_OPENAI_API_KEY".to_string()
}
fn default_temperature() -> f64 {
    0.2
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_chat_retries() -> u32 {
    2
}
fn default_max_result_rows() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    /// Azure embeddings deployment name (provider = "azure").
    #[serde(default)]
    pub deployment: Option<String>,
    /// Ollama model name (provider = "ollama").
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            deployment: None,
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout_secs(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_embed_retries() -> u32 {
    5
}
fn default_embed_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RagConfig {
    #[serde(default = "default_chunk_chars")]
    pub chunk_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,
    #[serde(default = "default_max_collections")]
    pub max_collections: usize,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            chunk_chars: default_chunk_chars(),
            overlap_chars: default_overlap_chars(),
            top_k: default_top_k(),
            max_sources: default_max_sources(),
            max_collections: default_max_collections(),
        }
    }
}

fn default_chunk_chars() -> usize {
    2000
}
fn default_overlap_chars() -> usize {
    200
}
fn default_top_k() -> usize {
    4
}
fn default_max_sources() -> usize {
    10
}
fn default_max_collections() -> usize {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate model
    if config.model.endpoint.trim().is_empty() {
        anyhow::bail!("model.endpoint must be set");
    }
    if !(0.0..=2.0).contains(&config.model.temperature) {
        anyhow::bail!("model.temperature must be in [0.0, 2.0]");
    }
    if config.model.max_result_rows == 0 {
        anyhow::bail!("model.max_result_rows must be >= 1");
    }

    // Validate chunking
    if config.rag.chunk_chars == 0 {
        anyhow::bail!("rag.chunk_chars must be > 0");
    }
    if config.rag.overlap_chars >= config.rag.chunk_chars {
        anyhow::bail!("rag.overlap_chars must be smaller than rag.chunk_chars");
    }

    // Validate retrieval limits
    if config.rag.top_k < 1 {
        anyhow::bail!("rag.top_k must be >= 1");
    }
    if config.rag.max_sources < 1 {
        anyhow::bail!("rag.max_sources must be >= 1");
    }
    if config.rag.max_collections < 1 {
        anyhow::bail!("rag.max_collections must be >= 1");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "azure" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, azure, or ollama.",
            other
        ),
    }

    Ok(config)
}
