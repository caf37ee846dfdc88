//! TOML configuration.
//!
//! [`load_config`] parses and validates the file once; [`SharedConfig`]
//! holds the current snapshot for long-running processes and swaps it on an
//! explicit [`SharedConfig::reload`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub store: StoreConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub reranker: RerankerConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub prompts: PromptConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Directory holding `index.bin` and `chunks.json`.
    pub data_dir: PathBuf,
    /// Directory of extracted markdown; emptied by `clear`.
    #[serde(default)]
    pub markdown_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Number of nearest chunks fetched in the recall stage.
    #[serde(default = "default_result_count")]
    pub result_count: usize,
    /// Number of passages kept after reranking.
    #[serde(default = "default_rerank_top_n")]
    pub rerank_top_n: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            result_count: default_result_count(),
            rerank_top_n: default_rerank_top_n(),
        }
    }
}

fn default_result_count() -> usize {
    5
}
fn default_rerank_top_n() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
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
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct RerankerConfig {
    #[serde(default = "default_reranker_provider")]
    pub provider: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: default_reranker_provider(),
            url: None,
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_reranker_provider() -> String {
    "none".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: String,
    #[serde(default = "default_ollama_url")]
    pub url: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    /// Whether callers may request reasoning output.
    #[serde(default)]
    pub think_enabled: bool,
    /// Longest silence tolerated between two provider events.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default)]
    pub options: GenerationOptions,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            url: default_ollama_url(),
            model: default_llm_model(),
            think_enabled: false,
            idle_timeout_secs: default_idle_timeout_secs(),
            options: GenerationOptions::default(),
        }
    }
}

fn default_generation_provider() -> String {
    "ollama".to_string()
}
fn default_ollama_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_llm_model() -> String {
    "llama3.1".to_string()
}
fn default_idle_timeout_secs() -> u64 {
    120
}

/// Sampling and length controls forwarded verbatim to the generation provider.
#[derive(Debug, Deserialize, Clone, serde::Serialize, PartialEq)]
pub struct GenerationOptions {
    #[serde(default = "default_num_ctx")]
    pub num_ctx: u32,
    #[serde(default = "default_repeat_last_n")]
    pub repeat_last_n: i32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default)]
    pub seed: i64,
    #[serde(default)]
    pub stop: Vec<String>,
    #[serde(default = "default_num_predict")]
    pub num_predict: i32,
    #[serde(default = "default_top_k")]
    pub top_k: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub min_p: f32,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            num_ctx: default_num_ctx(),
            repeat_last_n: default_repeat_last_n(),
            repeat_penalty: default_repeat_penalty(),
            temperature: default_temperature(),
            seed: 0,
            stop: Vec::new(),
            num_predict: default_num_predict(),
            top_k: default_top_k(),
            top_p: default_top_p(),
            min_p: 0.0,
        }
    }
}

fn default_num_ctx() -> u32 {
    4096
}
fn default_repeat_last_n() -> i32 {
    64
}
fn default_repeat_penalty() -> f32 {
    1.1
}
fn default_temperature() -> f32 {
    0.2
}
fn default_num_predict() -> i32 {
    -1
}
fn default_top_k() -> u32 {
    40
}
fn default_top_p() -> f32 {
    0.9
}

#[derive(Debug, Deserialize, Clone)]
pub struct PromptConfig {
    /// Answer template; `{context}`, `{question}`, `{keyword}` and `{history}`
    /// are substituted.
    #[serde(default = "default_system_prompt")]
    pub system: String,
    /// Term analysis template; `{question}` is substituted.
    #[serde(default = "default_analysis_prompt")]
    pub analysis: String,
    /// Prepended to every stored answer.
    #[serde(default)]
    pub answer_prefix: String,
    #[serde(default = "default_citation_label")]
    pub citation_label: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system: default_system_prompt(),
            analysis: default_analysis_prompt(),
            answer_prefix: String::new(),
            citation_label: default_citation_label(),
        }
    }
}

fn default_system_prompt() -> String {
    "Answer the question using only the context below. \
     If the context does not contain the answer, say so.\n\n\
     Context:\n{context}\n\nKeywords: {keyword}\n\nQuestion: {question}"
        .to_string()
}
fn default_analysis_prompt() -> String {
    "List and briefly explain the key terms in the following text:\n\n{question}".to_string()
}
fn default_citation_label() -> String {
    "Sources: ".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    #[serde(default = "default_per_user_limit")]
    pub per_user_limit: u32,
    #[serde(default = "default_global_limit")]
    pub global_limit: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            per_user_limit: default_per_user_limit(),
            global_limit: default_global_limit(),
        }
    }
}

fn default_per_user_limit() -> u32 {
    1
}
fn default_global_limit() -> u32 {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Chunking
    if config.chunking.chunk_size == 0 {
        bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    // Retrieval
    if config.retrieval.result_count < 1 {
        bail!("retrieval.result_count must be >= 1");
    }
    if config.retrieval.rerank_top_n < 1 {
        bail!("retrieval.rerank_top_n must be >= 1");
    }

    // Admission
    if config.admission.per_user_limit < 1 {
        bail!("admission.per_user_limit must be >= 1");
    }
    if config.admission.global_limit < 1 {
        bail!("admission.global_limit must be >= 1");
    }

    // Embedding
    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }
    if matches!(config.embedding.provider.as_str(), "openai" | "ollama") {
        if config.embedding.model.is_none() {
            bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.dims == Some(0) {
            bail!("embedding.dims must be > 0 when set");
        }
    }

    // Reranker
    match config.reranker.provider.as_str() {
        "none" | "local" => {}
        "http" => {
            if config.reranker.url.is_none() {
                bail!("reranker.url must be specified when provider is 'http'");
            }
        }
        other => bail!(
            "Unknown reranker provider: '{}'. Must be none, http, or local.",
            other
        ),
    }

    // Generation
    if config.generation.provider != "ollama" {
        bail!(
            "Unknown generation provider: '{}'. Must be ollama.",
            config.generation.provider
        );
    }
    if config.generation.idle_timeout_secs == 0 {
        bail!("generation.idle_timeout_secs must be > 0");
    }
    let opts = &config.generation.options;
    if !(0.0..=1.0).contains(&opts.top_p) {
        bail!("generation.options.top_p must be in [0.0, 1.0]");
    }
    if !(0.0..=1.0).contains(&opts.min_p) {
        bail!("generation.options.min_p must be in [0.0, 1.0]");
    }
    if opts.temperature < 0.0 {
        bail!("generation.options.temperature must be >= 0.0");
    }

    if !config.prompts.system.contains("{context}") {
        bail!("prompts.system must contain a {{context}} placeholder");
    }

    Ok(())
}

/// The live configuration of a running server.
///
/// Readers take a cheap [`Arc`] snapshot per request, so a reload never
/// changes settings underneath an in-flight request.
pub struct SharedConfig {
    path: Option<PathBuf>,
    current: RwLock<Arc<Config>>,
}

impl SharedConfig {
    /// Load `path` and remember it for later reloads.
    pub fn load(path: &Path) -> Result<Self> {
        let config = load_config(path)?;
        Ok(Self {
            path: Some(path.to_path_buf()),
            current: RwLock::new(Arc::new(config)),
        })
    }

    /// Wrap an already-validated config that has no backing file.
    pub fn fixed(config: Config) -> Self {
        Self {
            path: None,
            current: RwLock::new(Arc::new(config)),
        }
    }

    pub async fn snapshot(&self) -> Arc<Config> {
        self.current.read().await.clone()
    }

    /// Re-read and re-validate the file, then swap the snapshot.
    ///
    /// On error the previous snapshot stays active.
    pub async fn reload(&self) -> Result<Arc<Config>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("configuration has no backing file to reload"))?;
        let fresh = Arc::new(load_config(path)?);
        *self.current.write().await = fresh.clone();
        tracing::info!(path = %path.display(), "configuration reloaded");
        Ok(fresh)
    }
}
