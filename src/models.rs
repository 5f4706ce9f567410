//! Data models for the orchestration workflow.
//!
//! This module contains the conversation log, routing decisions, specialist
//! results, judge verdicts and the request/response payloads shared by the
//! CLI and the HTTP surface.

use crate::error::WorkflowError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One table row: column name to value, in column order.
pub type Row = Map<String, Value>;

/// Speaker of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    /// Canonicalize an external role label.
    ///
    /// Front-ends label the assistant side `agent`; that label is folded into
    /// [`Role::Assistant`] here so nothing downstream ever sees it.
    pub fn parse(label: &str) -> Result<Self, WorkflowError> {
        match label.trim().to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" | "agent" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(WorkflowError::Validation(format!(
                "unknown role label '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// A single conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// History entry as received from a client, before role canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub content: String,
}

/// Append-only conversation log owned by one request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the log from client history, canonicalizing role labels.
    pub fn from_history(history: &[HistoryEntry]) -> Result<Self, WorkflowError> {
        let turns = history
            .iter()
            .map(|entry| {
                Ok(Turn {
                    role: Role::parse(&entry.role)?,
                    content: entry.content.clone(),
                })
            })
            .collect::<Result<Vec<_>, WorkflowError>>()?;

        Ok(Self { turns })
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(Turn::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(Turn::assistant(content));
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Content of the most recent user turn.
    pub fn last_user(&self) -> Option<&str> {
        self.turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }

    /// Independent copy for one specialist branch.
    pub fn snapshot(&self) -> ConversationState {
        self.clone()
    }
}

/// Identifier of a domain specialist.
///
/// The declaration order is the dispatch order when several are assigned:
/// the metrics specialist always runs before the strategy specialist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialistId {
    /// Fresh computed metrics from the data store.
    DataAnalyst,
    /// Narrative and strategic interpretation.
    MarketingAnalyst,
}

impl SpecialistId {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialistId::DataAnalyst => "data_analyst",
            SpecialistId::MarketingAnalyst => "marketing_analyst",
        }
    }

    pub fn all() -> [SpecialistId; 2] {
        [SpecialistId::DataAnalyst, SpecialistId::MarketingAnalyst]
    }
}

impl fmt::Display for SpecialistId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecialistId {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "data_analyst" => Ok(SpecialistId::DataAnalyst),
            "marketing_analyst" => Ok(SpecialistId::MarketingAnalyst),
            other => Err(WorkflowError::Routing(format!(
                "unrecognized specialist id '{}'",
                other
            ))),
        }
    }
}

/// Outcome of routing one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub assigned_specialists: Vec<SpecialistId>,
    pub user_question: String,
    pub user_goal: String,
    pub commentary: String,
    pub requires_graph: bool,
    pub clarifying_question: Option<String>,
}

impl RoutingDecision {
    pub fn clarifying(&self) -> Option<&str> {
        non_empty(self.clarifying_question.as_deref())
    }

    /// No specialist is dispatched: either a clarification or a direct answer.
    pub fn is_terminal(&self) -> bool {
        self.assigned_specialists.is_empty()
    }
}

/// Structured output of one specialist invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SpecialistResult {
    /// Result table, one object per row.
    #[serde(default)]
    pub data: Option<Vec<Row>>,
    /// Plain-text interpretation of the data.
    #[serde(default)]
    pub findings: String,
    /// Only set when blocking details are missing.
    #[serde(default)]
    pub clarifying_question: Option<String>,
}

impl SpecialistResult {
    pub fn clarifying(&self) -> Option<&str> {
        non_empty(self.clarifying_question.as_deref())
    }

    pub fn rows(&self) -> &[Row] {
        self.data.as_deref().unwrap_or(&[])
    }

    pub fn has_data(&self) -> bool {
        !self.rows().is_empty()
    }
}

/// Usefulness score assigned by the judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum JudgeScore {
    /// Does not answer the question.
    Rejected,
    /// Answers part of the question.
    Partial,
    /// Directly and correctly answers the question.
    Accepted,
}

impl fmt::Display for JudgeScore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JudgeScore::Rejected => write!(f, "rejected"),
            JudgeScore::Partial => write!(f, "partial"),
            JudgeScore::Accepted => write!(f, "accepted"),
        }
    }
}

/// The judge's ruling on one iteration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JudgeVerdict {
    pub score: JudgeScore,
    pub reason: String,
    pub useful_data: Option<Vec<Row>>,
    pub suggestions: Option<String>,
    /// Specialists whose output needs another pass; empty means all.
    pub flagged: Vec<SpecialistId>,
}

impl JudgeVerdict {
    pub fn is_accepted(&self) -> bool {
        self.score == JudgeScore::Accepted
    }
}

/// A published chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphArtifact {
    pub generation_code: String,
    pub image_reference: String,
}

/// Terminal output of one workflow execution.
#[derive(Debug, Clone, Serialize)]
pub struct FinalResponse {
    pub markdown: String,
    #[serde(with = "duration_secs")]
    pub elapsed_time: Duration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clarifying_question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request accepted by the HTTP surface and the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// Response returned to callers: markdown on success, error otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AskResponse {
    Answer { markdown: String },
    Failure { error: String },
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }
}
