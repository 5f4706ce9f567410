//! Reasoning profiles: which model runs with which instructions.

use crate::config::ModelConfig;
use crate::models::SpecialistId;

pub const ROUTER: &str = "router";
pub const JUDGE: &str = "judge";
pub const GRAPH_CODE: &str = "graph_code";
pub const DIRECT_RESPONDER: &str = "direct_responder";

/// One configuration of the reasoning capability.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentProfile {
    pub name: String,
    pub model: String,
    pub instructions: String,
}

impl AgentProfile {
    pub fn new(name: &str, model: &str, instructions: &str) -> Self {
        Self {
            name: name.to_string(),
            model: model.to_string(),
            instructions: instructions.to_string(),
        }
    }

    /// Name of the structured output schema sent with each call.
    pub fn schema_name(&self) -> String {
        format!("{}_output", self.name)
    }

    pub fn router(config: &ModelConfig) -> Self {
        Self::new(ROUTER, &config.router_model, ROUTER_INSTRUCTIONS)
    }

    pub fn specialist(id: SpecialistId, config: &ModelConfig) -> Self {
        match id {
            SpecialistId::DataAnalyst => {
                Self::new(id.as_str(), &config.data_model, DATA_ANALYST_INSTRUCTIONS)
            }
            SpecialistId::MarketingAnalyst => Self::new(
                id.as_str(),
                &config.strategy_model,
                MARKETING_ANALYST_INSTRUCTIONS,
            ),
        }
    }

    pub fn judge(config: &ModelConfig) -> Self {
        Self::new(JUDGE, &config.judge_model, JUDGE_INSTRUCTIONS)
    }

    pub fn graph_code(config: &ModelConfig) -> Self {
        Self::new(GRAPH_CODE, &config.graph_model, GRAPH_CODE_INSTRUCTIONS)
    }

    pub fn direct_responder(config: &ModelConfig) -> Self {
        Self::new(
            DIRECT_RESPONDER,
            &config.responder_model,
            DIRECT_RESPONDER_INSTRUCTIONS,
        )
    }
}

const ROUTER_INSTRUCTIONS: &str = r#"You route questions for an analytics assistant.
Read the last user message and the conversation, then return one JSON object.

1. If a key parameter is missing (what a total refers to, the date range, an
   ambiguous referent), set clarifying_question to one concise question and
   assign no agents.
2. If earlier tables or findings in the conversation already answer the
   question, assign no agents and say so in commentary.
3. Otherwise assign agents in order: data_analyst for fresh metrics or any
   SQL-derivable number, marketing_analyst for strategy or narrative, both
   (data_analyst first) when both are needed.
4. Set requires_graph only when the user explicitly asks for a chart, graph,
   plot or visualization.

Fill user_question with the exact last message and user_goal with a one
sentence summary. Do not write SQL here."#;

const DATA_ANALYST_INSTRUCTIONS: &str = r#"You are a data analyst with read-only access to a SQLite
database through the execute_sql_query tool. Check retrieve_table_columns and
retrieve_query_examples before querying.

Run a single SELECT (or WITH) statement at a time; never modify data.
Aggregate so the natural result stays small (GROUP BY, window functions)
instead of listing raw rows, and select only the columns you need.

Return data as an array of row objects, findings as a plain-text
interpretation with units and assumptions, and clarifying_question only when
blocking details are missing (then leave data null and findings empty)."#;

const MARKETING_ANALYST_INSTRUCTIONS: &str = r#"You are a marketing strategist. Ground every claim in
the tables and findings already present in the conversation and in the
business context available through your tools. Never invent numbers.

Write findings as a cohesive plain-text narrative with sections labelled
"Insights:" and "Recommendations:". Leave data null. Set clarifying_question
only when blocking details are missing."#;

const JUDGE_INSTRUCTIONS: &str = r#"You judge an analyst's answer. You receive the original
question, the user's goal, the data table and the report.

Score "accepted" when they directly and correctly answer the question,
"partial" when they cover only part of it, "rejected" when they are wrong or
irrelevant. Explain your reasoning in reason. Put the rows that matter in
useful_data. When the score is not accepted, write concrete suggestions for
the next attempt and list the responsible specialists in
flagged_specialists."#;

const GRAPH_CODE_INSTRUCTIONS: &str = r#"You write Python plotting code. Two variables already
exist: table_data (a list of dicts, one per row) and img_buf (an open BytesIO).
pd (pandas) and plt (matplotlib.pyplot) are preloaded.

Use only those names. Do not redefine table_data or img_buf, do not read or
write files, do not call plt.show(). Save the figure with
plt.savefig(img_buf, format='png'). Return only the code."#;

const DIRECT_RESPONDER_INSTRUCTIONS: &str = r#"Answer the last user message using only the tables
and findings already present in the conversation. Do not call tools. Put any
table you reuse in data and your explanation in findings."#;
