//! TOML configuration.
//!
//! One [`Config`] is loaded at startup by [`load_config`] and passed by
//! reference to every component. There is no global state: the source
//! client, embedder, synchronizer, and chat client all take the slice of
//! configuration they need at construction.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub chat: ChatConfig,
}

/// Where the catalog/cache database and the index directories live.
#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    pub db_path: PathBuf,
    pub index_dir: PathBuf,
}

impl DataConfig {
    /// Directory holding the persisted index for `db_id`.
    pub fn index_path(&self, db_id: &str) -> PathBuf {
        self.index_dir.join(db_id)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Polarion base URL, e.g. `https://polarion.example.com/polarion`.
    pub base_url: String,
    /// Environment variable holding the personal access token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Project holding one work item per release configuration.
    #[serde(default = "default_config_project")]
    pub config_project: String,
    #[serde(default = "default_continuation_marker")]
    pub continuation_marker: String,
    /// Custom field carrying the applicable release configuration.
    #[serde(default = "default_release_field")]
    pub release_field: String,
    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default = "default_source_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub fields: FieldNames,
    /// Project groups: group id to member project ids.
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
}

fn default_token_env() -> String {
    "POLARION_TOKEN".to_string()
}
fn default_config_project() -> String {
    "PTS_Config".to_string()
}
fn default_continuation_marker() -> String {
    "(cont'd)".to_string()
}
fn default_release_field() -> String {
    "ibaApplicableConfiguration".to_string()
}
fn default_source_timeout_secs() -> u64 {
    60
}
fn default_page_size() -> usize {
    100
}

/// Polarion attribute names of the custom fields the pipeline reads.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FieldNames {
    pub external_id: String,
    pub hazardous_situation: String,
    pub initiating_event: String,
    pub harm: String,
    pub failure_mode: String,
    pub cause: String,
    pub effects: String,
}

impl Default for FieldNames {
    fn default() -> Self {
        Self {
            external_id: "ibaFullPuid".to_string(),
            hazardous_situation: "ibaHazardousSituation".to_string(),
            initiating_event: "ibaInitiatingEvent".to_string(),
            harm: "ibaHarm".to_string(),
            failure_mode: "ibaRAFailureMode".to_string(),
            cause: "ibaRACause".to_string(),
            effects: "ibaRAEffects".to_string(),
        }
    }
}

impl FieldNames {
    /// All configured attribute names, in a stable order.
    pub fn all(&self) -> [&str; 7] {
        [
            &self.external_id,
            &self.hazardous_situation,
            &self.initiating_event,
            &self.harm,
            &self.failure_mode,
            &self.cause,
            &self.effects,
        ]
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Window size in characters.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Chunks per embedding request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_chunk_size() -> usize {
    1000
}
fn default_batch_size() -> usize {
    32
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Environment variable holding an API key, sent as a bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            url: None,
            dims: None,
            api_key_env: None,
            max_retries: 5,
            timeout_secs: 30,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct MergeConfig {
    /// Emit a hazard or failure mode as its own record when it has no
    /// continuation children.
    #[serde(default = "default_emit_childless_parents")]
    pub emit_childless_parents: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            emit_childless_parents: default_emit_childless_parents(),
        }
    }
}

fn default_emit_childless_parents() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            score_threshold: default_score_threshold(),
        }
    }
}

fn default_k() -> usize {
    5
}
fn default_score_threshold() -> f32 {
    0.35
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Base URL of an OpenAI-compatible API (ending in `/v1`).
    #[serde(default = "default_chat_url")]
    pub url: String,
    #[serde(default = "default_chat_model")]
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_chat_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            url: default_chat_url(),
            model: default_chat_model(),
            temperature: default_temperature(),
            api_key_env: None,
            timeout_secs: default_chat_timeout_secs(),
        }
    }
}

fn default_chat_url() -> String {
    "http://localhost:22028/v1".to_string()
}
fn default_chat_model() -> String {
    "mistralai/Mistral-7B-Instruct-v0.2".to_string()
}
fn default_temperature() -> f32 {
    0.5
}
fn default_chat_timeout_secs() -> u64 {
    300
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.source.base_url.trim().is_empty() {
        anyhow::bail!("source.base_url must not be empty");
    }
    if config.source.page_size == 0 {
        anyhow::bail!("source.page_size must be > 0");
    }

    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.batch_size == 0 {
        anyhow::bail!("chunking.batch_size must be > 0");
    }

    if config.retrieval.k < 1 {
        anyhow::bail!("retrieval.k must be >= 1");
    }
    if !(-1.0..=1.0).contains(&config.retrieval.score_threshold) {
        anyhow::bail!("retrieval.score_threshold must be in [-1.0, 1.0]");
    }

    match config.embedding.provider.as_str() {
        "disabled" | "tei" => {}
        "openai" | "ollama" => {
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, tei, openai, or ollama.",
            other
        ),
    }
    if config.embedding.provider == "tei" && config.embedding.url.is_none() {
        anyhow::bail!("embedding.url must be specified when provider is 'tei'");
    }
    if config.embedding.dims == Some(0) {
        anyhow::bail!("embedding.dims must be > 0 when set");
    }

    Ok(())
}
