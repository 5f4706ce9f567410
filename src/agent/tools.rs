//! Tool definitions for the reasoning service.
//!
//! This module defines the tools the model can call mid-turn and the
//! [`ToolSet`] that dispatches those calls.

use crate::db::DataStore;
use crate::error::ToolError;
use crate::knowledge::KnowledgeBase;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Tool definition in the chat-completions tool-calling format.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDefinition {
    #[serde(rename = "type")]
    pub tool_type: String,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

impl ToolDefinition {
    pub fn function(name: &str, description: &str, parameters: Value) -> Self {
        Self {
            tool_type: "function".to_string(),
            function: FunctionDefinition {
                name: name.to_string(),
                description: description.to_string(),
                parameters,
            },
        }
    }
}

/// Result of executing a tool, as fed back to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: String) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(message),
        }
    }

    /// Text placed in the tool message.
    pub fn into_message(self) -> String {
        if self.success {
            self.output
        } else {
            format!("Error: {}", self.error.unwrap_or_default())
        }
    }
}

/// A callable tool with typed input and output.
#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    /// Run to completion; domain failures are errors, never malformed data.
    async fn execute(&self, args: &Value) -> Result<Value, ToolError>;
}

/// The tools available to one profile.
#[derive(Clone, Default)]
pub struct ToolSet {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolSet {
    pub fn new(tools: Vec<Arc<dyn Tool>>) -> Self {
        Self { tools }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .iter()
            .map(|t| t.definition().function.name)
            .collect()
    }

    /// Execute a tool call whose arguments arrive as a JSON string.
    pub async fn execute(&self, name: &str, raw_arguments: &str) -> ToolResult {
        debug!("Executing tool: {} with args: {}", name, raw_arguments);

        let args = if raw_arguments.trim().is_empty() {
            json!({})
        } else {
            match serde_json::from_str::<Value>(raw_arguments) {
                Ok(v) => v,
                Err(e) => return ToolResult::error(format!("Arguments are not valid JSON: {}", e)),
            }
        };

        let Some(tool) = self
            .tools
            .iter()
            .find(|t| t.definition().function.name == name)
        else {
            return ToolResult::error(format!("Unknown tool: {}", name));
        };

        match tool.execute(&args).await {
            Ok(value) => ToolResult::success(value.to_string()),
            Err(e) => {
                warn!("Tool {} failed: {}", name, e);
                ToolResult::error(e.to_string())
            }
        }
    }
}

/// `execute_sql_query`: read-only SQL against the data store.
pub struct SqlQueryTool {
    store: DataStore,
}

impl SqlQueryTool {
    pub fn new(store: DataStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for SqlQueryTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::function(
            "execute_sql_query",
            "Run one read-only SELECT statement against the analytics database. Returns rows as JSON objects. Large results are randomly sampled.",
            json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "A single SQLite SELECT (or WITH ... SELECT) statement"
                    }
                },
                "required": ["query"]
            }),
        )
    }

    async fn execute(&self, args: &Value) -> Result<Value, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidArguments("Missing required parameter: query".to_string()))?;

        let rows = self.store.execute(query).await?;
        Ok(Value::Array(rows.into_iter().map(Value::Object).collect()))
    }
}

/// Which knowledge file a [`KnowledgeTool`] serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnowledgeKind {
    TableColumns,
    BusinessContext,
    Wholesalers,
    QueryExamples,
}

/// Retrieval tool over the knowledge base.
pub struct KnowledgeTool {
    kind: KnowledgeKind,
    knowledge: Arc<KnowledgeBase>,
}

impl KnowledgeTool {
    pub fn new(kind: KnowledgeKind, knowledge: Arc<KnowledgeBase>) -> Self {
        Self { kind, knowledge }
    }
}

#[async_trait]
impl Tool for KnowledgeTool {
    fn definition(&self) -> ToolDefinition {
        let (name, description) = match self.kind {
            KnowledgeKind::TableColumns => (
                "retrieve_table_columns",
                "Column names of the reservations table with their descriptions.",
            ),
            KnowledgeKind::BusinessContext => (
                "retrieve_business_context",
                "General information about the business: offering, seasons, positioning.",
            ),
            KnowledgeKind::Wholesalers => (
                "retrieve_wholesalers_list",
                "Known wholesaler names, spelled as stored in the database.",
            ),
            KnowledgeKind::QueryExamples => (
                "retrieve_query_examples",
                "Example SQL queries showing how to query the reservations table.",
            ),
        };

        ToolDefinition::function(
            name,
            description,
            json!({"type": "object", "properties": {}, "required": []}),
        )
    }

    async fn execute(&self, _args: &Value) -> Result<Value, ToolError> {
        match self.kind {
            KnowledgeKind::TableColumns => self.knowledge.columns().map(Value::Object),
            KnowledgeKind::BusinessContext => self.knowledge.business_context().map(Value::String),
            KnowledgeKind::Wholesalers => self.knowledge.wholesalers().map(|v| json!(v)),
            KnowledgeKind::QueryExamples => self.knowledge.query_examples().map(|v| json!(v)),
        }
    }
}
