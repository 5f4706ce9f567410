//! Analytics Orchestrator - multi-agent analytics assistant
//!
//! Routes a question to data and strategy specialists, judges and retries
//! their answers, renders charts in a sandbox and composes a markdown reply.
//! Runs once from the command line or as an HTTP service.
//!
//! Exit codes:
//!   0 - Success
//!   1 - Runtime error (configuration, database, workflow failure, etc.)

mod agent;
mod cli;
mod config;
mod db;
mod error;
mod graph;
mod knowledge;
mod models;
mod orchestrator;
mod report;
mod server;

use agent::tools::{KnowledgeKind, KnowledgeTool, SqlQueryTool, Tool};
use agent::{AgentProfile, OpenAiReasoning, ReasoningService, ToolSet};
use anyhow::{Context, Result};
use cli::{Args, OutputFormat};
use config::{Config, DEFAULT_CONFIG_FILE};
use db::DataStore;
use graph::{GraphPipeline, GraphWorker, HttpPublisher, PythonSandbox};
use indicatif::{ProgressBar, ProgressStyle};
use knowledge::KnowledgeBase;
use models::{AskRequest, HistoryEntry};
use orchestrator::{Workflow, WorkflowTools};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse_args();

    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    // Handle --init-config early (no logging needed)
    if args.init_config {
        return handle_init_config();
    }

    init_logging(&args);

    info!("Analytics Orchestrator v{}", env!("CARGO_PKG_VERSION"));
    debug!("Arguments: {:?}", args);

    match run(args).await {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            error!("Run failed: {:#}", e);
            eprintln!("\n❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Handle --init-config: generate a default .orchestrator.toml.
fn handle_init_config() -> Result<()> {
    let path = std::path::Path::new(DEFAULT_CONFIG_FILE);

    if path.exists() {
        eprintln!(
            "⚠️  {} already exists. Remove it first or edit it manually.",
            DEFAULT_CONFIG_FILE
        );
        std::process::exit(1);
    }

    let content = Config::default_toml();
    std::fs::write(path, &content)
        .with_context(|| format!("Failed to write {}", DEFAULT_CONFIG_FILE))?;

    println!("✅ Created {} with default settings.", DEFAULT_CONFIG_FILE);
    println!("   Edit it to customize models, database, sandbox and shortcuts.");
    Ok(())
}

/// Initialize logging; `RUST_LOG` overrides the verbosity flags.
fn init_logging(args: &Args) {
    let level = args.log_level();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let result = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .try_init();

    if let Err(e) = result {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

async fn run(args: Args) -> Result<i32> {
    let mut config = load_config(&args)?;
    config.merge_with_args(&args);

    let (workflow, store) = build_workflow(&config).await?;
    let workflow = Arc::new(workflow);

    let work = async {
        if args.serve {
            server::serve(workflow, &config.server.bind).await.map(|()| 0)
        } else {
            answer_once(&args, &workflow).await
        }
    };
    closing(&store, work).await
}

/// Await `work`, then close the store whatever the outcome.
async fn closing<T>(store: &DataStore, work: impl Future<Output = Result<T>>) -> Result<T> {
    let outcome = work.await;
    store.close().await;
    outcome
}

/// Wire the data store, knowledge tools, reasoning client and graph worker.
async fn build_workflow(config: &Config) -> Result<(Workflow, DataStore)> {
    let store = DataStore::connect(&config.database).await?;

    let knowledge = Arc::new(KnowledgeBase::new(&config.knowledge));
    knowledge.log_inventory();

    let knowledge_tools: Vec<Arc<dyn Tool>> = [
        KnowledgeKind::TableColumns,
        KnowledgeKind::BusinessContext,
        KnowledgeKind::Wholesalers,
        KnowledgeKind::QueryExamples,
    ]
    .into_iter()
    .map(|kind| Arc::new(KnowledgeTool::new(kind, knowledge.clone())) as Arc<dyn Tool>)
    .collect();

    let mut data_tools: Vec<Arc<dyn Tool>> = vec![Arc::new(SqlQueryTool::new(store.clone()))];
    data_tools.extend(knowledge_tools.iter().cloned());

    let reasoning: Arc<dyn ReasoningService> = Arc::new(OpenAiReasoning::new(&config.model)?);

    let graph = if config.sandbox.enabled {
        let pipeline = GraphPipeline::new(
            reasoning.clone(),
            AgentProfile::graph_code(&config.model),
            Arc::new(PythonSandbox::new(&config.sandbox)),
            Arc::new(HttpPublisher::new(&config.publish)?),
        );
        Some(
            GraphWorker::spawn(pipeline, config.sandbox.max_concurrent_renders)
                .context("Failed to start graph worker")?,
        )
    } else {
        info!("Charts disabled");
        None
    };

    let tools = WorkflowTools {
        knowledge: ToolSet::new(knowledge_tools),
        data: ToolSet::new(data_tools),
    };

    Ok((Workflow::new(config, reasoning, tools, graph), store))
}

/// One-shot mode: answer `--question` and write the result.
async fn answer_once(args: &Args, workflow: &Workflow) -> Result<i32> {
    let question = args
        .question
        .clone()
        .context("--question is required without --serve")?;
    let history = load_history(args)?;

    let spinner = if args.quiet {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .context("Invalid spinner template")?,
        );
        pb.set_message("Thinking...");
        pb.enable_steady_tick(Duration::from_millis(120));
        Some(pb)
    };

    let outcome = workflow.run(AskRequest { question, history }).await;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let (body, exit_code) = match (&outcome, args.format) {
        (Ok(response), OutputFormat::Markdown) => (response.markdown.clone(), 0),
        (Ok(response), OutputFormat::Json) => (
            serde_json::to_string_pretty(response).context("Failed to serialize response")?,
            0,
        ),
        (Err(e), OutputFormat::Json) => (
            serde_json::to_string_pretty(&serde_json::json!({"error": e.to_string()}))
                .context("Failed to serialize error")?,
            1,
        ),
        (Err(e), OutputFormat::Markdown) => {
            eprintln!("\n❌ Error: {}", e);
            return Ok(1);
        }
    };

    match args.output {
        Some(ref path) => {
            std::fs::write(path, &body)
                .with_context(|| format!("Failed to write answer to {}", path.display()))?;
            if !args.quiet {
                println!("✅ Answer saved to: {}", path.display());
            }
        }
        None => println!("{}", body),
    }

    if let Ok(ref response) = outcome {
        info!("Done in {:.1}s", response.elapsed_time.as_secs_f64());
    }
    Ok(exit_code)
}

fn load_history(args: &Args) -> Result<Vec<HistoryEntry>> {
    let Some(ref path) = args.history else {
        return Ok(Vec::new());
    };

    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read history file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse history file: {}", path.display()))
}

/// Load configuration from file or use defaults.
fn load_config(args: &Args) -> Result<Config> {
    // Try explicit config path
    if let Some(ref config_path) = args.config {
        info!("Loading config from: {}", config_path.display());
        return Config::load(config_path);
    }

    // Try default location
    match Config::load_default() {
        Ok(Some(config)) => {
            info!("Loaded default config from {}", DEFAULT_CONFIG_FILE);
            Ok(config)
        }
        Ok(None) => {
            debug!("No config file found, using defaults");
            Ok(Config::default())
        }
        Err(e) => {
            warn!("Failed to load config: {}", e);
            Ok(Config::default())
        }
    }
}
