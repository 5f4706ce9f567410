//! Reasoning service client.
//!
//! One call sends a profile's instructions plus the conversation to an
//! OpenAI-compatible chat completions endpoint, runs any tool calls the
//! model makes, and returns the final structured JSON content.

use crate::agent::profiles::AgentProfile;
use crate::agent::tools::{ToolDefinition, ToolSet};
use crate::config::ModelConfig;
use crate::error::WorkflowError;
use crate::models::Turn;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result schema attached to a reasoning call.
#[derive(Debug, Clone)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
}

impl OutputSchema {
    pub fn of<T: JsonSchema>(name: impl Into<String>) -> Result<Self, WorkflowError> {
        let name = name.into();
        let schema = serde_json::to_value(schemars::schema_for!(T))
            .map_err(|e| WorkflowError::schema(name.clone(), e))?;
        Ok(Self { name, schema })
    }
}

/// Everything one reasoning call needs.
pub struct ReasoningRequest<'a> {
    pub profile: &'a AgentProfile,
    pub conversation: &'a [Turn],
    pub schema: &'a OutputSchema,
    pub tools: &'a ToolSet,
}

/// The external reasoning capability.
///
/// Implementations return the raw JSON object the model produced; callers
/// validate it against the expected shape with [`invoke_structured`].
#[async_trait]
pub trait ReasoningService: Send + Sync {
    async fn invoke(&self, request: ReasoningRequest<'_>) -> Result<Value, WorkflowError>;
}

/// Invoke a profile and validate the result against `T`.
pub async fn invoke_structured<T>(
    service: &dyn ReasoningService,
    profile: &AgentProfile,
    conversation: &[Turn],
    tools: &ToolSet,
) -> Result<T, WorkflowError>
where
    T: DeserializeOwned + JsonSchema,
{
    let schema = OutputSchema::of::<T>(profile.schema_name())?;
    let value = service
        .invoke(ReasoningRequest {
            profile,
            conversation,
            schema: &schema,
            tools,
        })
        .await?;

    serde_json::from_value(value).map_err(|e| WorkflowError::schema(profile.name.clone(), e))
}

/// Chat message in the OpenAI wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ToolCallMessage>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl ChatMessage {
    fn text(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: Some(content.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCallMessage {
    id: String,
    #[serde(rename = "type", default = "function_type")]
    call_type: String,
    function: ToolCallFunction,
}

fn function_type() -> String {
    "function".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolCallFunction {
    name: String,
    /// JSON-encoded arguments, as the API sends them.
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolDefinition>,
    temperature: f32,
    response_format: Value,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChatMessage,
}

/// [`ReasoningService`] backed by an OpenAI-compatible HTTP API.
pub struct OpenAiReasoning {
    http_client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    temperature: f32,
    timeout_seconds: u64,
    max_tool_rounds: usize,
}

impl OpenAiReasoning {
    pub fn new(config: &ModelConfig) -> Result<Self, WorkflowError> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty());
        if api_key.is_none() {
            warn!(
                "{} is not set; calling {} without credentials",
                config.api_key_env, config.api_url
            );
        }

        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| WorkflowError::Service(format!("Failed to create HTTP client: {}", e)))?;

        info!("Reasoning service at {}", config.api_url);

        Ok(Self {
            http_client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_key,
            temperature: config.temperature,
            timeout_seconds: config.timeout_seconds,
            max_tool_rounds: config.max_tool_rounds,
        })
    }

    async fn chat(&self, request: &ChatRequest<'_>) -> Result<ChatMessage, WorkflowError> {
        let url = format!("{}/v1/chat/completions", self.api_url);

        let mut builder = self.http_client.post(&url).json(request);
        if let Some(ref key) = self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                WorkflowError::Service(format!(
                    "Request timed out after {}s",
                    self.timeout_seconds
                ))
            } else if e.is_connect() {
                WorkflowError::Service(format!(
                    "Cannot connect to reasoning service at {}",
                    self.api_url
                ))
            } else {
                WorkflowError::Service(format!("Failed to send request: {}", e))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(WorkflowError::Service(format!(
                "Reasoning API error {}: {}",
                status, body
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            WorkflowError::Service(format!("Failed to parse reasoning response: {}", e))
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| WorkflowError::Service("Reasoning response had no choices".to_string()))
    }
}

#[async_trait]
impl ReasoningService for OpenAiReasoning {
    async fn invoke(&self, request: ReasoningRequest<'_>) -> Result<Value, WorkflowError> {
        let profile = request.profile;

        let mut messages = Vec::with_capacity(request.conversation.len() + 1);
        messages.push(ChatMessage::text("system", &profile.instructions));
        for turn in request.conversation {
            messages.push(ChatMessage::text(&turn.role.to_string(), &turn.content));
        }

        let response_format = json!({
            "type": "json_schema",
            "json_schema": {
                "name": request.schema.name,
                "schema": request.schema.schema,
                "strict": false
            }
        });

        debug!("{}: tools available {:?}", profile.name, request.tools.names());

        for round in 0..=self.max_tool_rounds {
            debug!(
                "{}: round {} with {} messages",
                profile.name,
                round + 1,
                messages.len()
            );

            let reply = self
                .chat(&ChatRequest {
                    model: &profile.model,
                    messages: &messages,
                    tools: request.tools.definitions(),
                    temperature: self.temperature,
                    response_format: response_format.clone(),
                })
                .await?;

            let calls = reply.tool_calls.clone().unwrap_or_default();
            if calls.is_empty() {
                let content = reply.content.unwrap_or_default();
                return parse_json_content(&content)
                    .map_err(|e| WorkflowError::schema(profile.name.clone(), e));
            }

            messages.push(reply);
            for call in calls {
                let result = request
                    .tools
                    .execute(&call.function.name, &call.function.arguments)
                    .await;
                info!("{}: tool {} executed", profile.name, call.function.name);

                messages.push(ChatMessage {
                    role: "tool".to_string(),
                    content: Some(result.into_message()),
                    tool_calls: None,
                    tool_call_id: Some(call.id),
                });
            }
        }

        Err(WorkflowError::Service(format!(
            "{} exceeded {} tool rounds without answering",
            profile.name, self.max_tool_rounds
        )))
    }
}

/// Parse model content as a JSON object, tolerating a markdown code fence.
fn parse_json_content(content: &str) -> Result<Value, String> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    let value: Value =
        serde_json::from_str(unfenced.trim()).map_err(|e| format!("content is not JSON: {}", e))?;
    if value.is_object() {
        Ok(value)
    } else {
        Err("content is not a JSON object".to_string())
    }
}
