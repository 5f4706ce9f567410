//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use clap::Parser;
use std::path::PathBuf;

/// Analytics Orchestrator - multi-agent analytics assistant
///
/// Routes a question to data and strategy specialists, judges and retries
/// their answers, renders charts in a sandbox and composes a markdown reply.
///
/// Examples:
///   analytics-orchestrator --question "What is total revenue by room category in 2025?"
///   analytics-orchestrator --question "Plot nights per month" --history convo.json
///   analytics-orchestrator --serve --bind 127.0.0.1:8000
///   analytics-orchestrator --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Question to answer in one-shot mode
    #[arg(
        short = 'Q',
        long,
        value_name = "TEXT",
        required_unless_present_any = ["serve", "init_config"]
    )]
    pub question: Option<String>,

    /// JSON file with prior turns: [{"role": "...", "content": "..."}]
    #[arg(long, value_name = "FILE")]
    pub history: Option<PathBuf>,

    /// Run the HTTP server instead of answering one question
    #[arg(long, conflicts_with = "question")]
    pub serve: bool,

    /// Address to bind in server mode
    #[arg(long, value_name = "ADDR", env = "ORCHESTRATOR_BIND")]
    pub bind: Option<String>,

    /// Path to configuration file
    ///
    /// If not specified, looks for .orchestrator.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Base URL of the OpenAI-compatible reasoning API
    #[arg(long, value_name = "URL", env = "ORCHESTRATOR_API_URL")]
    pub api_url: Option<String>,

    /// Use one model for every profile
    #[arg(short, long, env = "ORCHESTRATOR_MODEL")]
    pub model: Option<String>,

    /// SQLite database with the analytical data
    #[arg(long, value_name = "FILE")]
    pub database: Option<PathBuf>,

    /// Knowledge directory
    #[arg(long, value_name = "DIR")]
    pub knowledge: Option<PathBuf>,

    /// Judge retry budget
    #[arg(long, value_name = "COUNT")]
    pub max_retries: Option<usize>,

    /// Request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Run specialists one after another instead of concurrently
    #[arg(long)]
    pub sequential: bool,

    /// Never render charts
    #[arg(long)]
    pub no_graph: bool,

    /// Output file for the answer (stdout when omitted)
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Generate a default .orchestrator.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for one-shot answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown answer only (default)
    #[default]
    Markdown,
    /// Full JSON response payload
    Json,
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        if self.init_config {
            return Ok(());
        }

        if let Some(ref question) = self.question {
            if question.trim().is_empty() {
                return Err("Question must not be empty".to_string());
            }
        }

        if let Some(ref url) = self.api_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err("API URL must start with 'http://' or 'https://'".to_string());
            }
        }

        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if let Some(timeout) = self.timeout {
            if timeout == 0 {
                return Err("Timeout must be at least 1 second".to_string());
            }
        }

        if let Some(ref history) = self.history {
            if !history.is_file() {
                return Err(format!("History file does not exist: {}", history.display()));
            }
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
