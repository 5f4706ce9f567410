//! Configuration file handling.
//!
//! This module handles loading and merging configuration from
//! `.orchestrator.toml` files.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file name, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = ".orchestrator.toml";

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General workflow settings.
    #[serde(default)]
    pub general: GeneralConfig,

    /// Reasoning service settings.
    #[serde(default)]
    pub model: ModelConfig,

    /// Analytical data store settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Knowledge base settings.
    #[serde(default)]
    pub knowledge: KnowledgeConfig,

    /// Chart sandbox settings.
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Image publishing settings.
    #[serde(default)]
    pub publish: PublishConfig,

    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Routing shortcuts.
    #[serde(default)]
    pub router: RouterConfig,
}

/// How multiple specialists are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Every specialist runs at once on its own snapshot.
    #[default]
    Concurrent,
    /// Specialists run in assignment order, each seeing the previous findings.
    Sequential,
}

/// General workflow settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Judge retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Wall-clock budget for one request, in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Specialist dispatch mode.
    #[serde(default)]
    pub dispatch: DispatchMode,

    /// Enable verbose logging by default.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            request_timeout_seconds: default_request_timeout(),
            dispatch: DispatchMode::default(),
            verbose: false,
        }
    }
}

fn default_max_retries() -> usize {
    2
}

fn default_request_timeout() -> u64 {
    300
}

/// Reasoning service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Base URL of an OpenAI-compatible chat completions API.
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Model used by the router.
    #[serde(default = "default_light_model")]
    pub router_model: String,

    /// Model used by the metrics specialist.
    #[serde(default = "default_heavy_model")]
    pub data_model: String,

    /// Model used by the strategy specialist.
    #[serde(default = "default_light_model")]
    pub strategy_model: String,

    /// Model used by the judge.
    #[serde(default = "default_light_model")]
    pub judge_model: String,

    /// Model used to generate chart code.
    #[serde(default = "default_light_model")]
    pub graph_model: String,

    /// Model used for direct answers.
    #[serde(default = "default_light_model")]
    pub responder_model: String,

    /// Temperature for generation.
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// HTTP timeout per reasoning call, in seconds.
    #[serde(default = "default_model_timeout")]
    pub timeout_seconds: u64,

    /// Maximum tool-calling rounds inside one reasoning call.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_key_env: default_api_key_env(),
            router_model: default_light_model(),
            data_model: default_heavy_model(),
            strategy_model: default_light_model(),
            judge_model: default_light_model(),
            graph_model: default_light_model(),
            responder_model: default_light_model(),
            temperature: default_temperature(),
            timeout_seconds: default_model_timeout(),
            max_tool_rounds: default_max_tool_rounds(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.openai.com".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_light_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_heavy_model() -> String {
    "gpt-4o".to_string()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_model_timeout() -> u64 {
    60
}

fn default_max_tool_rounds() -> usize {
    8
}

/// Analytical data store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    /// Pool size shared by concurrent requests and specialists.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Row ceiling before the sampling fallback kicks in.
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Rows returned by the sampling fallback.
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_connections: default_max_connections(),
            max_rows: default_max_rows(),
            sample_size: default_sample_size(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/resv.db")
}

fn default_max_connections() -> u32 {
    4
}

fn default_max_rows() -> usize {
    1000
}

fn default_sample_size() -> usize {
    1000
}

/// Knowledge base settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    /// Directory holding the knowledge files.
    #[serde(default = "default_knowledge_dir")]
    pub dir: PathBuf,

    /// Column dictionary (`- "COLUMN": description` lines).
    #[serde(default = "default_columns_file")]
    pub columns_file: String,

    /// Free-form business context.
    #[serde(default = "default_context_file")]
    pub context_file: String,

    /// One wholesaler name per line.
    #[serde(default = "default_wholesalers_file")]
    pub wholesalers_file: String,

    /// Example queries, one per line.
    #[serde(default = "default_examples_file")]
    pub examples_file: String,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            dir: default_knowledge_dir(),
            columns_file: default_columns_file(),
            context_file: default_context_file(),
            wholesalers_file: default_wholesalers_file(),
            examples_file: default_examples_file(),
        }
    }
}

fn default_knowledge_dir() -> PathBuf {
    PathBuf::from("knowledge")
}

fn default_columns_file() -> String {
    "reservations_columns.md".to_string()
}

fn default_context_file() -> String {
    "business_context.md".to_string()
}

fn default_wholesalers_file() -> String {
    "wholesalers.txt".to_string()
}

fn default_examples_file() -> String {
    "query_examples.md".to_string()
}

/// Chart sandbox settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Disable to skip charts entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Python interpreter with pandas and matplotlib installed.
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Hard execution timeout, in seconds.
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_seconds: u64,

    /// Address-space ceiling for the interpreter, in MiB.
    #[serde(default = "default_memory_limit")]
    pub memory_limit_mb: u64,

    /// Renders allowed to run at once on the graph worker.
    #[serde(default = "default_concurrent_renders")]
    pub max_concurrent_renders: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: default_interpreter(),
            timeout_seconds: default_sandbox_timeout(),
            memory_limit_mb: default_memory_limit(),
            max_concurrent_renders: default_concurrent_renders(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interpreter() -> String {
    "python3".to_string()
}

fn default_sandbox_timeout() -> u64 {
    30
}

fn default_memory_limit() -> u64 {
    1024
}

fn default_concurrent_renders() -> usize {
    2
}

/// Image publishing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Multipart upload endpoint returning `{"url": ...}`.
    #[serde(default = "default_upload_url")]
    pub upload_url: String,

    /// Upload timeout, in seconds.
    #[serde(default = "default_upload_timeout")]
    pub timeout_seconds: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            upload_url: default_upload_url(),
            timeout_seconds: default_upload_timeout(),
        }
    }
}

fn default_upload_url() -> String {
    "http://localhost:9000/upload/charts".to_string()
}

fn default_upload_timeout() -> u64 {
    30
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the `/ask` endpoint binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8000".to_string()
}

/// Keyword shortcut mapping straight to a fixed specialist assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Shortcut {
    /// Case-insensitive substrings of the user question.
    pub keywords: Vec<String>,
    /// Specialist ids dispatched when a keyword matches.
    pub specialists: Vec<String>,
}

/// Routing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_shortcuts")]
    pub shortcuts: Vec<Shortcut>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            shortcuts: default_shortcuts(),
        }
    }
}

fn default_shortcuts() -> Vec<Shortcut> {
    vec![Shortcut {
        keywords: vec!["wholesaler".to_string(), "mayorista".to_string()],
        specialists: vec!["data_analyst".to_string()],
    }]
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Try to load configuration from the default location.
    ///
    /// Returns `Ok(None)` if the file doesn't exist, `Err` if it exists but can't be parsed.
    pub fn load_default() -> Result<Option<Self>> {
        let default_path = Path::new(DEFAULT_CONFIG_FILE);

        if default_path.exists() {
            Ok(Some(Self::load(default_path)?))
        } else {
            Ok(None)
        }
    }

    /// Merge this configuration with CLI arguments.
    ///
    /// CLI arguments take precedence over config file settings, but only
    /// when they were given explicitly.
    pub fn merge_with_args(&mut self, args: &crate::cli::Args) {
        if let Some(ref url) = args.api_url {
            self.model.api_url = url.clone();
        }
        if let Some(ref model) = args.model {
            self.model.router_model = model.clone();
            self.model.data_model = model.clone();
            self.model.strategy_model = model.clone();
            self.model.judge_model = model.clone();
            self.model.graph_model = model.clone();
            self.model.responder_model = model.clone();
        }
        if let Some(ref path) = args.database {
            self.database.path = path.clone();
        }
        if let Some(ref dir) = args.knowledge {
            self.knowledge.dir = dir.clone();
        }
        if let Some(retries) = args.max_retries {
            self.general.max_retries = retries;
        }
        if let Some(timeout) = args.timeout {
            self.general.request_timeout_seconds = timeout;
        }
        if let Some(ref bind) = args.bind {
            self.server.bind = bind.clone();
        }

        if args.sequential {
            self.general.dispatch = DispatchMode::Sequential;
        }
        if args.no_graph {
            self.sandbox.enabled = false;
        }
        if args.verbose {
            self.general.verbose = true;
        }
    }

    /// Generate a default configuration file content.
    pub fn default_toml() -> String {
        let config = Config::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}
