//! Knowledge base backing the retrieval tools.
//!
//! Files live in one directory and are re-read only when their
//! modification time changes.

use crate::config::KnowledgeConfig;
use crate::error::ToolError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

struct CachedFile {
    modified: SystemTime,
    content: String,
}

/// Directory of knowledge files with a modification-time cache.
pub struct KnowledgeBase {
    root: PathBuf,
    config: KnowledgeConfig,
    cache: Mutex<HashMap<PathBuf, CachedFile>>,
}

impl KnowledgeBase {
    pub fn new(config: &KnowledgeConfig) -> Self {
        Self {
            root: config.dir.clone(),
            config: config.clone(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Relative paths of every file in the knowledge directory.
    pub fn list(&self) -> Vec<String> {
        let mut files: Vec<String> = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|p| p.display().to_string())
            })
            .collect();
        files.sort();
        files
    }

    /// Log what is available; missing files only surface when a tool asks.
    pub fn log_inventory(&self) {
        let files = self.list();
        if files.is_empty() {
            warn!("Knowledge directory {} is empty or missing", self.root.display());
        } else {
            info!(
                "Knowledge base at {}: {} files",
                self.root.display(),
                files.len()
            );
            for name in &files {
                debug!("  knowledge file: {}", name);
            }
        }
    }

    /// Read a file, serving the cached copy while its mtime is unchanged.
    pub fn read(&self, name: &str) -> Result<String, ToolError> {
        let relative = Path::new(name);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(ToolError::InvalidArguments(format!(
                "knowledge file name must be relative: {}",
                name
            )));
        }

        let path = self.root.join(relative);
        let modified = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map_err(|_| ToolError::MissingResource(format!("{} does not exist", path.display())))?;

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| ToolError::Execution("knowledge cache poisoned".to_string()))?;

        if let Some(cached) = cache.get(&path) {
            if cached.modified == modified {
                return Ok(cached.content.clone());
            }
        }

        let content = fs::read_to_string(&path)
            .map_err(|e| ToolError::Execution(format!("failed to read {}: {}", path.display(), e)))?;
        debug!("Reloaded knowledge file {}", path.display());

        cache.insert(
            path,
            CachedFile {
                modified,
                content: content.clone(),
            },
        );
        Ok(content)
    }

    /// Column name to description, in file order.
    pub fn columns(&self) -> Result<Map<String, Value>, ToolError> {
        let content = self.read(&self.config.columns_file)?;
        Ok(parse_columns(&content))
    }

    pub fn business_context(&self) -> Result<String, ToolError> {
        self.read(&self.config.context_file)
    }

    pub fn wholesalers(&self) -> Result<Vec<String>, ToolError> {
        let content = self.read(&self.config.wholesalers_file)?;
        Ok(non_blank_lines(&content))
    }

    pub fn query_examples(&self) -> Result<Vec<String>, ToolError> {
        let content = self.read(&self.config.examples_file)?;
        Ok(non_blank_lines(&content))
    }
}

/// Parse `- "COLUMN": description` lines; everything else is ignored.
pub fn parse_columns(content: &str) -> Map<String, Value> {
    let mut columns = Map::new();

    for line in content.lines() {
        let Some(rest) = line.trim_start().strip_prefix("- \"") else {
            continue;
        };
        let Some((name, description)) = rest.split_once(':') else {
            continue;
        };
        let name = name.trim().trim_end_matches('"');
        if name.is_empty() {
            continue;
        }
        columns.insert(
            name.to_string(),
            Value::String(description.trim().to_string()),
        );
    }

    columns
}

fn non_blank_lines(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}
